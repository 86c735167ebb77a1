// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lazily created producers, one per destination key.
//!
//! Each key owns its own slot; creation for a key runs under that slot's
//! lock only, so unrelated destinations never wait on each other. Concurrent
//! first users of a key all observe the single producer created for it.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

type Slot<P> = Arc<OnceCell<Arc<Mutex<P>>>>;

/// Keyed producer cache.
pub struct ProducerPool<P> {
    slots: DashMap<String, Slot<P>>,
}

impl<P> Default for ProducerPool<P> {
    fn default() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }
}

impl<P> ProducerPool<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the producer for `key`, creating it with `create` on first use.
    ///
    /// At most one `create` runs per key at a time; once one succeeds no other
    /// is called. A failed creation leaves the key empty so the next caller
    /// retries.
    pub async fn get_or_create<F, Fut, E>(&self, key: &str, create: F) -> Result<Arc<Mutex<P>>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<P, E>>,
    {
        if let Some(producer) = self.slots.get(key).and_then(|slot| slot.get().cloned()) {
            return Ok(producer);
        }

        let slot = self.slots.entry(key.to_string()).or_default().clone();
        let producer = slot
            .get_or_try_init(|| async { create().await.map(|p| Arc::new(Mutex::new(p))) })
            .await?;
        Ok(producer.clone())
    }

    /// Number of created producers.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.value().initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every producer from the pool and hand them back.
    pub fn drain(&self) -> Vec<Arc<Mutex<P>>> {
        let keys: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        keys.into_iter()
            .filter_map(|key| self.slots.remove(&key))
            .filter_map(|(_, slot)| slot.get().cloned())
            .collect()
    }
}
