// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Network-server REST client.
//!
//! Queues downlink commands through `POST /api/devices/{devEUI}/queue`.

use crate::config::NetworkServerConfig;
use crate::downlink::{is_valid_dev_eui, DownlinkCommand, DownlinkRelay};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

const GRPC_AUTHORIZATION: &str = "Grpc-Metadata-Authorization";

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("network server not configured: {0}")]
    Config(String),

    #[error("refusing to queue for devEUI {0:?}")]
    InvalidDevEui(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("network server returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueueRequest<'a> {
    device_queue_item: &'a DownlinkCommand,
}

/// HTTP client for the network server's device queue.
#[derive(Debug, Clone)]
pub struct NetworkServerClient {
    http: reqwest::Client,
    base_url: String,
    bearer: String,
}

impl NetworkServerClient {
    /// Build a client. Fails when the URL or token is empty.
    pub fn new(config: &NetworkServerConfig) -> Result<Self, RelayError> {
        let base_url = config.url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(RelayError::Config("empty url".into()));
        }
        if config.token.trim().is_empty() {
            return Err(RelayError::Config("empty api token".into()));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.to_string(),
            bearer: format!("Bearer {}", config.token.trim()),
        })
    }

    /// Base URL without trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn queue_url(&self, dev_eui: &str) -> String {
        format!("{}/api/devices/{}/queue", self.base_url, dev_eui)
    }
}

#[async_trait]
impl DownlinkRelay for NetworkServerClient {
    async fn submit(&self, command: &DownlinkCommand) -> Result<(), RelayError> {
        // The devEUI becomes a path segment.
        if !is_valid_dev_eui(&command.dev_eui) {
            return Err(RelayError::InvalidDevEui(command.dev_eui.clone()));
        }
        let url = self.queue_url(&command.dev_eui);
        tracing::debug!("POST {}", url);

        let response = self
            .http
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, &self.bearer)
            .header(GRPC_AUTHORIZATION, &self.bearer)
            .json(&QueueRequest {
                device_queue_item: command,
            })
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(RelayError::Status {
            status: status.as_u16(),
            body,
        })
    }
}
