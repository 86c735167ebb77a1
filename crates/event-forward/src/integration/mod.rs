// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker integrations.
//!
//! Every backend is driven through the same [`Integration`] contract:
//!
//! ```text
//! Integration trait
//! +-- MqttIntegration    (one connection, synchronous publish, fixed downlink topic)
//! +-- PulsarIntegration  (pooled producers, asynchronous send, downlink consumer loop)
//! ```
//!
//! Outbound calls come from the dispatcher. Inbound downlink traffic runs on
//! tasks owned by each integration and is reported through the shared
//! [`ErrorSender`](crate::error_channel::ErrorSender).

pub mod mqtt;
pub mod producer_pool;
pub mod pulsar;

pub use self::mqtt::{MqttIntegration, MqttTransport, RumqttTransport};
pub use self::producer_pool::ProducerPool;
pub use self::pulsar::{
    consume_downlinks, DownlinkConsumer, EventProducer, PendingDelivery, PulsarBackend,
    PulsarClient, PulsarIntegration,
};

use crate::downlink::{DecodeError, DownlinkRelay};
use crate::error_channel::{ErrorSender, HandleError};
use crate::network_server::RelayError;
use crate::template::TemplateError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Integration errors.
#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("subscription failed: {0}")]
    Subscribe(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("producer creation failed: {0}")]
    Producer(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("ack failed: {0}")]
    Ack(String),

    #[error("invalid downlink payload: {0}")]
    Decode(#[from] DecodeError),

    #[error("downlink relay failed: {0}")]
    Relay(#[from] RelayError),

    #[error("startup cancelled")]
    Cancelled,

    #[error("integration closed")]
    Closed,
}

/// One event emitted by the network server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Event {
    /// Naming variables (application id, device EUI, event type, ...).
    pub vars: HashMap<String, String>,

    /// Raw, uninterpreted payload.
    pub payload: Vec<u8>,
}

impl Event {
    pub fn new(vars: HashMap<String, String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            vars,
            payload: payload.into(),
        }
    }

    /// Set a single variable.
    pub fn var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }
}

/// Collaborators handed to every integration at construction.
#[derive(Clone)]
pub struct IntegrationOptions {
    /// Network-server relay for downlink commands. `None` disables downlink.
    pub relay: Option<Arc<dyn DownlinkRelay>>,

    /// Shared error channel.
    pub errors: ErrorSender,

    /// Cancelled at process shutdown; also aborts startup retry loops.
    pub shutdown: CancellationToken,
}

impl IntegrationOptions {
    pub fn new(errors: ErrorSender) -> Self {
        Self {
            relay: None,
            errors,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_relay(mut self, relay: Arc<dyn DownlinkRelay>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }
}

/// Uniform contract for broker backends.
#[async_trait]
pub trait Integration: Send + Sync {
    /// Source name used in [`HandleError`]s ("mqtt", "pulsar", ...).
    fn name(&self) -> &'static str;

    /// Forward one event.
    ///
    /// Synchronous failures are returned; failures that happen after this
    /// call returns go to `errors`.
    async fn handle_event(&self, errors: &ErrorSender, event: &Event) -> Result<(), HandleError>;

    /// Release broker resources. Safe to call more than once.
    async fn close(&self) -> Result<(), HandleError>;
}
