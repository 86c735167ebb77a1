// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection retry policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Retry delay strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// Same delay between every attempt.
    Fixed {
        #[serde(default = "default_fixed_delay_ms")]
        delay_ms: u64,
    },

    /// Doubling delay, capped at `max_ms`.
    Exponential {
        #[serde(default = "default_initial_ms")]
        initial_ms: u64,
        #[serde(default = "default_max_ms")]
        max_ms: u64,
    },
}

fn default_fixed_delay_ms() -> u64 {
    2000
}

fn default_initial_ms() -> u64 {
    500
}

fn default_max_ms() -> u64 {
    30_000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::Fixed {
            delay_ms: default_fixed_delay_ms(),
        }
    }
}

/// Stateful delay sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.config {
            BackoffConfig::Fixed { delay_ms } => delay_ms,
            BackoffConfig::Exponential { initial_ms, max_ms } => {
                let factor = 1u64.checked_shl(self.attempt.min(32)).unwrap_or(u64::MAX);
                initial_ms.saturating_mul(factor).min(max_ms)
            }
        };
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(delay)
    }

    /// Restart the sequence after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Sleep for the next delay. Returns `false` if `cancel` fired first.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> bool {
        let delay = self.next_delay();
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
