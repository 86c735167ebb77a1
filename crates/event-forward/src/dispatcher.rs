// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event dispatcher.
//!
//! Owns one instance of every configured integration and fans each event
//! out to all of them concurrently.

use crate::config::{ConfigError, ForwarderConfig};
use crate::error_channel::{ErrorSender, HandleError};
use crate::integration::{
    Event, Integration, IntegrationOptions, MqttIntegration, PulsarIntegration,
};
use crate::network_server::RelayError;
use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Dispatcher errors.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Network server client error: {0}")]
    Relay(#[from] RelayError),

    #[error("Integration startup failed: {0}")]
    Integration(#[from] HandleError),

    #[error("No integration enabled")]
    NoIntegrations,
}

/// Forwarding statistics for one integration.
#[derive(Debug)]
pub struct ForwardStats {
    pub integration: &'static str,

    /// Events accepted by the integration.
    pub events_forwarded: AtomicU64,

    /// Payload bytes accepted.
    pub bytes_forwarded: AtomicU64,

    /// Synchronous failures.
    pub errors: AtomicU64,

    pub created: Instant,
}

impl ForwardStats {
    pub fn new(integration: &'static str) -> Self {
        Self {
            integration,
            events_forwarded: AtomicU64::new(0),
            bytes_forwarded: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            created: Instant::now(),
        }
    }

    pub fn record_event(&self, bytes: u64) {
        self.events_forwarded.fetch_add(1, Ordering::Relaxed);
        self.bytes_forwarded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of current stats.
    pub fn snapshot(&self) -> ForwardStatsSnapshot {
        ForwardStatsSnapshot {
            integration: self.integration,
            events_forwarded: self.events_forwarded.load(Ordering::Relaxed),
            bytes_forwarded: self.bytes_forwarded.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            uptime_secs: self.created.elapsed().as_secs(),
        }
    }
}

/// Snapshot of forwarding statistics.
#[derive(Debug, Clone)]
pub struct ForwardStatsSnapshot {
    pub integration: &'static str,
    pub events_forwarded: u64,
    pub bytes_forwarded: u64,
    pub errors: u64,
    pub uptime_secs: u64,
}

impl ForwardStatsSnapshot {
    pub fn events_per_second(&self) -> f64 {
        if self.uptime_secs > 0 {
            self.events_forwarded as f64 / self.uptime_secs as f64
        } else {
            0.0
        }
    }
}

struct Slot {
    integration: Box<dyn Integration>,
    stats: Arc<ForwardStats>,
}

/// Fans events out to every integration.
pub struct Dispatcher {
    slots: Vec<Slot>,
    errors: ErrorSender,
}

impl Dispatcher {
    pub fn new(integrations: Vec<Box<dyn Integration>>, errors: ErrorSender) -> Self {
        let slots = integrations
            .into_iter()
            .map(|integration| Slot {
                stats: Arc::new(ForwardStats::new(integration.name())),
                integration,
            })
            .collect();
        Self { slots, errors }
    }

    /// Build every enabled integration.
    ///
    /// Integrations already built are closed again if a later one fails.
    pub async fn from_config(
        config: &ForwarderConfig,
        options: IntegrationOptions,
    ) -> Result<Self, DispatchError> {
        let mut integrations: Vec<Box<dyn Integration>> = Vec::new();

        if config.mqtt.enabled {
            match MqttIntegration::new(&config.mqtt, &options).await {
                Ok(mqtt) => integrations.push(Box::new(mqtt)),
                Err(e) => return Err(HandleError::new("mqtt", e).into()),
            }
        }

        if config.pulsar.enabled {
            match PulsarIntegration::new(&config.pulsar, &options).await {
                Ok(pulsar) => integrations.push(Box::new(pulsar)),
                Err(e) => {
                    close_all(&integrations).await;
                    return Err(HandleError::new("pulsar", e).into());
                }
            }
        }

        if integrations.is_empty() {
            return Err(DispatchError::NoIntegrations);
        }

        for integration in &integrations {
            tracing::info!("Integration {} ready", integration.name());
        }
        Ok(Self::new(integrations, options.errors))
    }

    /// Names of the owned integrations.
    pub fn integrations(&self) -> Vec<&'static str> {
        self.slots.iter().map(|s| s.integration.name()).collect()
    }

    /// Forward one event to every integration concurrently.
    ///
    /// Returns the synchronous failures.
    pub async fn dispatch(&self, event: &Event) -> Vec<HandleError> {
        let errors = &self.errors;
        let results = join_all(self.slots.iter().map(|slot| async move {
            let result = slot.integration.handle_event(errors, event).await;
            match &result {
                Ok(()) => slot.stats.record_event(event.payload.len() as u64),
                Err(e) => {
                    slot.stats.record_error();
                    tracing::warn!("Forwarding failed: {}", e);
                }
            }
            result
        }))
        .await;

        results.into_iter().filter_map(Result::err).collect()
    }

    /// Statistics for every integration.
    pub fn stats(&self) -> Vec<ForwardStatsSnapshot> {
        self.slots.iter().map(|s| s.stats.snapshot()).collect()
    }

    /// Close every integration.
    pub async fn close(&self) {
        for slot in &self.slots {
            if let Err(e) = slot.integration.close().await {
                tracing::warn!("Close failed: {}", e);
            }
        }
    }
}

async fn close_all(integrations: &[Box<dyn Integration>]) {
    for integration in integrations {
        if let Err(e) = integration.close().await {
            tracing::warn!("Close failed: {}", e);
        }
    }
}
