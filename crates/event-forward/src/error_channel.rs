// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-wide error channel.
//!
//! Every integration reports failures it cannot hand back to a caller
//! (asynchronous send completions, inbound downlink failures, blank
//! destinations) as a [`HandleError`] on one bounded channel. A single
//! monitor drains it.
//!
//! Reporting never blocks: when the channel is full the error is counted and
//! dropped.

use crate::integration::IntegrationError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

/// Default channel capacity.
pub const DEFAULT_ERROR_CAPACITY: usize = 1024;

/// A failure attributed to one integration.
#[derive(Debug, Error)]
#[error("{integration}: {error}")]
pub struct HandleError {
    /// Integration name ("mqtt", "pulsar", ...).
    pub integration: &'static str,

    /// The underlying failure.
    #[source]
    pub error: IntegrationError,
}

impl HandleError {
    pub fn new(integration: &'static str, error: impl Into<IntegrationError>) -> Self {
        Self {
            integration,
            error: error.into(),
        }
    }
}

/// Receiving half of the error channel.
pub type ErrorReceiver = mpsc::Receiver<HandleError>;

/// Sending half of the error channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ErrorSender {
    tx: mpsc::Sender<HandleError>,
    dropped: Arc<AtomicU64>,
}

impl ErrorSender {
    /// Report an error without blocking.
    pub fn report(&self, error: HandleError) {
        match self.tx.try_send(error) {
            Ok(()) => {}
            Err(TrySendError::Full(error)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    "Error channel full, dropping error ({} dropped so far): {}",
                    dropped,
                    error
                );
            }
            Err(TrySendError::Closed(error)) => {
                tracing::debug!("Error channel closed, discarding: {}", error);
            }
        }
    }

    /// Number of errors dropped because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Create a bounded error channel.
pub fn error_channel(capacity: usize) -> (ErrorSender, ErrorReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ErrorSender {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

/// Spawn the default monitor: logs every error until all senders are gone.
///
/// The task resolves to the number of errors it observed.
pub fn spawn_error_monitor(mut rx: ErrorReceiver) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut seen = 0u64;
        while let Some(err) = rx.recv().await {
            seen += 1;
            tracing::error!(
                integration = err.integration,
                error = %err.error,
                "Integration error"
            );
        }
        seen
    })
}
