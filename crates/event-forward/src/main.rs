// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! event-forward CLI
//!
//! Receives network-server events over HTTP and forwards them to the
//! configured brokers.
//!
//! # Usage
//!
//! ```bash
//! # Run with a configuration file
//! event-forward --config forward.toml
//!
//! # Generate an example configuration
//! event-forward gen-config --output forward.toml
//!
//! # Check a configuration without connecting
//! event-forward validate --config forward.toml
//! ```

use clap::{Parser, Subcommand};
use event_forward::{
    error_channel, spawn_error_monitor, DispatchError, Dispatcher, ForwardStatsSnapshot,
    ForwarderConfig, IntegrationError, IntegrationOptions, NetworkServerClient,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// LoRaWAN event forwarder
#[derive(Parser, Debug)]
#[command(name = "event-forward")]
#[command(about = "Forward LoRaWAN network-server events to MQTT and Pulsar")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "forward.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "forward.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(cmd) = args.command {
        init_logging(args.log_level.as_deref().unwrap_or("info"));
        return match cmd {
            Commands::GenConfig { output } => cmd_gen_config(output),
            Commands::Validate { config } => cmd_validate(config),
        };
    }

    let config = ForwarderConfig::from_file(&args.config)?;
    init_logging(args.log_level.as_deref().unwrap_or(&config.log_level));

    run(config).await
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run(config: ForwarderConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("event-forward v{}", env!("CARGO_PKG_VERSION"));

    let shutdown = CancellationToken::new();
    let (errors, error_rx) = error_channel(config.errors.capacity);
    let monitor = spawn_error_monitor(error_rx);

    let mut options = IntegrationOptions::new(errors.clone()).with_shutdown(shutdown.clone());
    if config.network_server.is_configured() {
        let client = NetworkServerClient::new(&config.network_server)?;
        tracing::info!("Downlink relay to {}", client.base_url());
        options = options.with_relay(Arc::new(client));
    } else {
        tracing::warn!("No network server configured, downlink relay disabled");
    }

    // Ctrl+C also aborts a startup still waiting for a broker.
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down...");
            signal_token.cancel();
        }
    });

    let dispatcher = match Dispatcher::from_config(&config, options).await {
        Ok(dispatcher) => Arc::new(dispatcher),
        Err(DispatchError::Integration(e)) if matches!(e.error, IntegrationError::Cancelled) => {
            tracing::info!("Startup cancelled");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!("Listening for events on http://{}", listener.local_addr()?);

    event_forward::ingest::serve(listener, dispatcher.clone(), shutdown.clone()).await?;

    dispatcher.close().await;
    print_stats(&dispatcher.stats());

    let dropped = errors.dropped();
    drop(dispatcher);
    drop(errors);
    // Tasks that outlived close may still hold senders.
    match tokio::time::timeout(std::time::Duration::from_secs(2), monitor).await {
        Ok(Ok(seen)) => tracing::info!("{} integration errors reported", seen),
        Ok(Err(e)) => tracing::warn!("Error monitor failed: {}", e),
        Err(_) => tracing::debug!("Error monitor still draining at exit"),
    }
    if dropped > 0 {
        tracing::warn!("{} integration errors dropped (error channel full)", dropped);
    }

    Ok(())
}

fn cmd_gen_config(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let toml_str = toml::to_string_pretty(&ForwarderConfig::example())?;

    let content = format!(
        r#"# event-forward configuration
# Generated by event-forward gen-config

{}
"#,
        toml_str
    );

    std::fs::write(&output, content)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    match ForwarderConfig::from_file(&config_path) {
        Ok(config) => {
            println!("Configuration valid!");
            println!();
            println!("Ingest:  http://{}", config.server.bind);
            if config.mqtt.enabled {
                println!("MQTT:    {} -> {}", config.mqtt.url, config.mqtt.topic_template);
            }
            if config.pulsar.enabled {
                println!(
                    "Pulsar:  {} -> {}",
                    config.pulsar.url, config.pulsar.topic_template
                );
            }
            if config.network_server.is_configured() {
                println!("Downlink relay: {}", config.network_server.url);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}

fn print_stats(stats: &[ForwardStatsSnapshot]) {
    println!("--- Forwarding Statistics ---");
    for stat in stats {
        println!(
            "  {}: {} events ({:.1} ev/s), {} bytes, {} errors",
            stat.integration,
            stat.events_forwarded,
            stat.events_per_second(),
            stat.bytes_forwarded,
            stat.errors
        );
    }
}
