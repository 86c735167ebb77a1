// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! LoRaWAN event forwarding.
//!
//! Forwards network-server events to message brokers and relays downlink
//! commands from those brokers back to the network server.
//!
//! # Features
//!
//! - **MQTT**: one connection, per-event topic, acknowledged publish, fixed
//!   downlink subscription
//! - **Pulsar**: per-event topic and producer, pooled producers, background
//!   send, key-shared downlink consumer with ack on successful relay
//! - **Destination templates**: `application/{{ .applicationID }}/device/{{ .devEUI }}`
//! - **Error channel**: asynchronous failures from every integration in one
//!   bounded stream
//!
//! # Quick Start
//!
//! ```bash
//! # Write an example configuration
//! event-forward gen-config --output forward.toml
//!
//! # Run
//! event-forward --config forward.toml
//! ```
//!
//! # Configuration File
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8090"
//!
//! [network_server]
//! url = "http://localhost:8080"
//! token = "..."
//!
//! [mqtt]
//! enabled = true
//! url = "tcp://localhost:1883"
//! topic_template = "application/{{ .applicationID }}/device/{{ .devEUI }}/event/{{ .event }}"
//! downlink_topic = "application/+/device/+/command/down"
//! qos = 1
//!
//! [pulsar]
//! enabled = true
//! url = "pulsar://localhost:6650"
//! topic_template = "persistent://public/default/application-{{ .applicationID }}"
//! producer_name_template = "event-forward-{{ .applicationID }}"
//! topics_pattern = "persistent://public/default/downlink-.*"
//! consumer_name = "event-forward"
//! subscription_name = "event-forward-downlink"
//! ```

pub mod backoff;
pub mod config;
pub mod dispatcher;
pub mod downlink;
pub mod error_channel;
pub mod ingest;
pub mod integration;
pub mod network_server;
pub mod template;

pub use backoff::{Backoff, BackoffConfig};
pub use config::{ConfigError, ForwarderConfig, MqttConfig, NetworkServerConfig, PulsarConfig};
pub use dispatcher::{DispatchError, Dispatcher, ForwardStats, ForwardStatsSnapshot};
pub use downlink::{DownlinkCommand, DownlinkContext, DownlinkRelay};
pub use error_channel::{error_channel, spawn_error_monitor, ErrorReceiver, ErrorSender, HandleError};
pub use integration::{Event, Integration, IntegrationError, IntegrationOptions};
pub use network_server::{NetworkServerClient, RelayError};
pub use template::{DestinationTemplate, TemplateError};
