// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Downlink commands and the relay contract.
//!
//! Brokers deliver JSON-encoded [`DownlinkCommand`]s; they are decoded and
//! handed to a [`DownlinkRelay`] (normally the network-server HTTP client)
//! which queues them for the device.

use crate::error_channel::{ErrorSender, HandleError};
use crate::integration::IntegrationError;
use crate::network_server::RelayError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Downlink decode errors.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("{0}")]
    Json(#[from] serde_json::Error),

    #[error("missing devEUI")]
    MissingDevEui,

    #[error("devEUI must be 16 hex digits, got {0:?}")]
    InvalidDevEui(String),
}

/// A devEUI is an EUI-64 written as 16 hex digits.
pub fn is_valid_dev_eui(dev_eui: &str) -> bool {
    dev_eui.len() == 16 && dev_eui.bytes().all(|b| b.is_ascii_hexdigit())
}

/// A device queue item, as accepted by the network server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownlinkCommand {
    #[serde(default)]
    pub confirmed: bool,

    /// Base64 frame payload, passed through untouched.
    #[serde(default)]
    pub data: String,

    #[serde(rename = "devEUI", default)]
    pub dev_eui: String,

    #[serde(default)]
    pub f_cnt: u32,

    #[serde(default)]
    pub f_port: u8,

    #[serde(default)]
    pub json_object: String,
}

impl DownlinkCommand {
    /// Decode a broker payload.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let command: Self = serde_json::from_slice(payload)?;
        if command.dev_eui.trim().is_empty() {
            return Err(DecodeError::MissingDevEui);
        }
        if !is_valid_dev_eui(&command.dev_eui) {
            return Err(DecodeError::InvalidDevEui(command.dev_eui));
        }
        Ok(command)
    }
}

/// Queues downlink commands on the network server.
#[async_trait]
pub trait DownlinkRelay: Send + Sync {
    async fn submit(&self, command: &DownlinkCommand) -> Result<(), RelayError>;
}

/// Everything an inbound handler needs to relay a downlink.
#[derive(Clone)]
pub struct DownlinkContext {
    pub relay: Arc<dyn DownlinkRelay>,
    pub errors: ErrorSender,
}

impl DownlinkContext {
    pub fn new(relay: Arc<dyn DownlinkRelay>, errors: ErrorSender) -> Self {
        Self { relay, errors }
    }

    /// Decode and relay one inbound payload.
    ///
    /// Returns `true` when the command was accepted by the relay. Any failure
    /// is reported once on the error channel.
    pub async fn relay(&self, source: &'static str, payload: &[u8]) -> bool {
        match self.forward(payload).await {
            Ok(command) => {
                tracing::debug!("{}: downlink queued for {}", source, command.dev_eui);
                true
            }
            Err(err) => {
                self.errors.report(HandleError::new(source, err));
                false
            }
        }
    }

    async fn forward(&self, payload: &[u8]) -> Result<DownlinkCommand, IntegrationError> {
        let command = DownlinkCommand::decode(payload)?;
        self.relay.submit(&command).await?;
        Ok(command)
    }
}
