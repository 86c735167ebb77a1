// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Forwarder configuration.
//!
//! Loaded from a TOML file; every section has defaults except broker URLs
//! and secrets.

use crate::backoff::BackoffConfig;
use crate::error_channel::DEFAULT_ERROR_CAPACITY;
use crate::integration::pulsar::lookup_namespace;
use crate::template::DestinationTemplate;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level forwarder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub network_server: NetworkServerConfig,

    #[serde(default)]
    pub errors: ErrorsConfig,

    #[serde(default)]
    pub mqtt: MqttConfig,

    #[serde(default)]
    pub pulsar: PulsarConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            server: ServerConfig::default(),
            network_server: NetworkServerConfig::default(),
            errors: ErrorsConfig::default(),
            mqtt: MqttConfig::default(),
            pulsar: PulsarConfig::default(),
        }
    }
}

impl ForwarderConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.mqtt.enabled && !self.pulsar.enabled {
            return Err(ConfigError::Invalid("No integration enabled".into()));
        }

        self.server
            .bind
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid(format!("server.bind '{}': {}", self.server.bind, e)))?;

        if self.errors.capacity == 0 {
            return Err(ConfigError::Invalid("errors.capacity must be > 0".into()));
        }

        if self.mqtt.enabled {
            require("mqtt.url", &self.mqtt.url)?;
            require("mqtt.topic_template", &self.mqtt.topic_template)?;
            compile("mqtt.topic_template", &self.mqtt.topic_template)?;
            if self.mqtt.qos > 2 {
                return Err(ConfigError::Invalid(format!(
                    "mqtt.qos must be 0, 1 or 2 (got {})",
                    self.mqtt.qos
                )));
            }
        }

        if self.pulsar.enabled {
            require("pulsar.url", &self.pulsar.url)?;
            require("pulsar.topic_template", &self.pulsar.topic_template)?;
            require(
                "pulsar.producer_name_template",
                &self.pulsar.producer_name_template,
            )?;
            compile("pulsar.topic_template", &self.pulsar.topic_template)?;
            compile(
                "pulsar.producer_name_template",
                &self.pulsar.producer_name_template,
            )?;
            if self.pulsar.downlink_configured() {
                lookup_namespace(&self.pulsar.topics_pattern)
                    .map_err(|e| ConfigError::Invalid(format!("pulsar.topics_pattern: {}", e)))?;
            }
        }

        Ok(())
    }

    /// Example configuration written by `gen-config`.
    pub fn example() -> Self {
        Self {
            log_level: default_log_level(),
            server: ServerConfig::default(),
            network_server: NetworkServerConfig {
                url: "http://localhost:8080".into(),
                token: "<api token>".into(),
                ..Default::default()
            },
            errors: ErrorsConfig::default(),
            mqtt: MqttConfig {
                enabled: true,
                url: "tcp://localhost:1883".into(),
                downlink_topic: "application/+/device/+/command/down".into(),
                qos: 1,
                ..Default::default()
            },
            pulsar: PulsarConfig {
                enabled: false,
                url: "pulsar://localhost:6650".into(),
                topics_pattern: "persistent://public/default/downlink-.*".into(),
                consumer_name: "event-forward".into(),
                subscription_name: "event-forward-downlink".into(),
                ..Default::default()
            },
        }
    }
}

fn require(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Invalid(format!("{} is required", field)));
    }
    Ok(())
}

fn compile(field: &str, template: &str) -> Result<(), ConfigError> {
    DestinationTemplate::compile(template)
        .map(|_| ())
        .map_err(|e| ConfigError::Invalid(format!("{}: {}", field, e)))
}

/// Event ingestion HTTP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "0.0.0.0:8090".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Network-server REST API used for downlink relay.
///
/// Downlink relay is disabled when `url` is empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkServerConfig {
    #[serde(default)]
    pub url: String,

    /// API token, sent as a bearer token.
    #[serde(default)]
    pub token: String,

    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

fn default_http_timeout() -> u64 {
    30
}

impl Default for NetworkServerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            timeout_secs: default_http_timeout(),
        }
    }
}

impl NetworkServerConfig {
    pub fn is_configured(&self) -> bool {
        !self.url.trim().is_empty()
    }
}

/// Error channel sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorsConfig {
    #[serde(default = "default_error_capacity")]
    pub capacity: usize,
}

fn default_error_capacity() -> usize {
    DEFAULT_ERROR_CAPACITY
}

impl Default for ErrorsConfig {
    fn default() -> Self {
        Self {
            capacity: default_error_capacity(),
        }
    }
}

/// MQTT integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Broker URL (`tcp://host:port`, `mqtt://host:port`, `host:port` or `host`).
    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Defaults to `event-forward-<pid>`.
    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default = "default_mqtt_topic")]
    pub topic_template: String,

    /// Fixed downlink subscription topic (wildcards allowed). Empty disables.
    #[serde(default)]
    pub downlink_topic: String,

    #[serde(default)]
    pub qos: u8,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Grace period for draining the connection on close.
    #[serde(default = "default_quiesce_ms")]
    pub quiesce_ms: u64,

    #[serde(default)]
    pub reconnect: BackoffConfig,
}

fn default_mqtt_topic() -> String {
    "application/{{ .applicationID }}/device/{{ .devEUI }}/event/{{ .event }}".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_quiesce_ms() -> u64 {
    1000
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            username: None,
            password: None,
            client_id: None,
            topic_template: default_mqtt_topic(),
            downlink_topic: String::new(),
            qos: 0,
            keep_alive_secs: default_keep_alive(),
            quiesce_ms: default_quiesce_ms(),
            reconnect: BackoffConfig::default(),
        }
    }
}

/// Pulsar integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PulsarConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Service URL (`pulsar://host:6650`).
    #[serde(default)]
    pub url: String,

    /// JWT for token authentication.
    #[serde(default)]
    pub auth_token: Option<String>,

    #[serde(default = "default_pulsar_topic")]
    pub topic_template: String,

    /// Producers are pooled by the rendered name.
    #[serde(default = "default_producer_name")]
    pub producer_name_template: String,

    /// Downlink topic regex. Downlink needs this, `consumer_name` and
    /// `subscription_name`.
    #[serde(default)]
    pub topics_pattern: String,

    #[serde(default)]
    pub consumer_name: String,

    #[serde(default)]
    pub subscription_name: String,

    #[serde(default = "default_pulsar_timeout")]
    pub connection_timeout_secs: u64,

    #[serde(default = "default_pulsar_timeout")]
    pub operation_timeout_secs: u64,
}

fn default_pulsar_topic() -> String {
    "persistent://public/default/application-{{ .applicationID }}-{{ .event }}".to_string()
}

fn default_producer_name() -> String {
    "event-forward-{{ .applicationID }}-{{ .event }}".to_string()
}

fn default_pulsar_timeout() -> u64 {
    30
}

impl Default for PulsarConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            auth_token: None,
            topic_template: default_pulsar_topic(),
            producer_name_template: default_producer_name(),
            topics_pattern: String::new(),
            consumer_name: String::new(),
            subscription_name: String::new(),
            connection_timeout_secs: default_pulsar_timeout(),
            operation_timeout_secs: default_pulsar_timeout(),
        }
    }
}

impl PulsarConfig {
    /// All three downlink identifiers are set.
    pub fn downlink_configured(&self) -> bool {
        !self.topics_pattern.trim().is_empty()
            && !self.consumer_name.trim().is_empty()
            && !self.subscription_name.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_minimal_mqtt_config_gets_defaults() {
        let config = ForwarderConfig::from_toml(
            r#"
            [mqtt]
            enabled = true
            url = "tcp://broker:1883"
            "#,
        )
        .expect("valid");

        assert_eq!(config.log_level, "info");
        assert_eq!(config.server.bind, "0.0.0.0:8090");
        assert_eq!(config.errors.capacity, DEFAULT_ERROR_CAPACITY);
        assert_eq!(config.mqtt.qos, 0);
        assert_eq!(config.mqtt.quiesce_ms, 1000);
        assert_eq!(config.mqtt.reconnect, BackoffConfig::Fixed { delay_ms: 2000 });
        assert!(!config.pulsar.enabled);
        assert!(!config.network_server.is_configured());
        assert_eq!(config.network_server.timeout_secs, 30);
    }

    #[test]
    fn test_reconnect_section() {
        let config = ForwarderConfig::from_toml(
            r#"
            [mqtt]
            enabled = true
            url = "broker"

            [mqtt.reconnect]
            strategy = "exponential"
            initial_ms = 100
            max_ms = 1000
            "#,
        )
        .expect("valid");
        assert_eq!(
            config.mqtt.reconnect,
            BackoffConfig::Exponential {
                initial_ms: 100,
                max_ms: 1000
            }
        );
    }

    #[test]
    fn test_no_integration_is_invalid() {
        let err = ForwarderConfig::from_toml("log_level = \"debug\"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_enabled_integration_requires_url() {
        let err = ForwarderConfig::from_toml("[pulsar]\nenabled = true").unwrap_err();
        assert!(err.to_string().contains("pulsar.url"));
    }

    #[test]
    fn test_invalid_qos_and_template() {
        let err = ForwarderConfig::from_toml("[mqtt]\nenabled = true\nurl = \"b\"\nqos = 3")
            .unwrap_err();
        assert!(err.to_string().contains("qos"));

        let err = ForwarderConfig::from_toml(
            "[mqtt]\nenabled = true\nurl = \"b\"\ntopic_template = \"up/{{ .devEUI\"",
        )
        .unwrap_err();
        assert!(err.to_string().contains("mqtt.topic_template"));
    }

    #[test]
    fn test_bad_bind_address() {
        let err = ForwarderConfig::from_toml(
            "[server]\nbind = \"nowhere\"\n[mqtt]\nenabled = true\nurl = \"b\"",
        )
        .unwrap_err();
        assert!(err.to_string().contains("server.bind"));
    }

    #[test]
    fn test_pulsar_downlink_configured() {
        let mut pulsar = PulsarConfig::default();
        assert!(!pulsar.downlink_configured());
        pulsar.topics_pattern = "down-.*".into();
        pulsar.consumer_name = "c".into();
        assert!(!pulsar.downlink_configured());
        pulsar.subscription_name = "s".into();
        assert!(pulsar.downlink_configured());
    }

    #[test]
    fn test_pulsar_topics_pattern_needs_namespace() {
        let base = "[pulsar]\nenabled = true\nurl = \"pulsar://p:6650\"\nconsumer_name = \"c\"\nsubscription_name = \"s\"\n";

        let err = ForwarderConfig::from_toml(&format!(
            "{}topics_pattern = \"persistent://acme/downlink-.*\"",
            base
        ))
        .unwrap_err();
        assert!(err.to_string().contains("pulsar.topics_pattern"));

        ForwarderConfig::from_toml(&format!(
            "{}topics_pattern = \"persistent://acme/lorawan/downlink-.*\"",
            base
        ))
        .expect("qualified pattern");
    }

    #[test]
    fn test_example_round_trips_through_file() {
        let example = ForwarderConfig::example();
        let text = toml::to_string_pretty(&example).expect("serialize");

        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(text.as_bytes()).expect("write");

        let loaded = ForwarderConfig::from_file(file.path()).expect("load");
        assert!(loaded.mqtt.enabled);
        assert_eq!(loaded.mqtt.qos, 1);
        assert_eq!(loaded.network_server.url, "http://localhost:8080");
        assert_eq!(loaded.pulsar.subscription_name, "event-forward-downlink");
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = ForwarderConfig::from_file(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
