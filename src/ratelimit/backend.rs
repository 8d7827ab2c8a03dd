//! Admission trait shared by the in-memory and store-backed limiters.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::counter::KeyedFixedWindow;
use super::limiter::SlidingWindowLimiter;
use super::store::{CounterStore, MemoryCounterStore, RedisCounterStore, StoreCounter};
use crate::config::StoreConfig;
use crate::error::{AdmissionError, Result};

/// A keyed admission decision.
///
/// This trait lets callers such as the CLI drive any limiter the same way.
/// In-memory limiters always return `Ok`; store-backed ones may fail.
#[async_trait]
pub trait AdmissionBackend: Send + Sync {
    /// Decide whether a request for `key` may proceed, recording it.
    async fn allow(&self, key: &str) -> Result<bool>;

    /// Whether a request for `key` is blocked. Records the request.
    async fn is_limited(&self, key: &str) -> Result<bool> {
        Ok(!self.allow(key).await?)
    }
}

#[async_trait]
impl AdmissionBackend for SlidingWindowLimiter {
    async fn allow(&self, key: &str) -> Result<bool> {
        Ok(SlidingWindowLimiter::allow(self, key))
    }
}

#[async_trait]
impl AdmissionBackend for KeyedFixedWindow {
    async fn allow(&self, key: &str) -> Result<bool> {
        Ok(KeyedFixedWindow::allow(self, key))
    }
}

#[async_trait]
impl<S: CounterStore + 'static> AdmissionBackend for StoreCounter<S> {
    async fn allow(&self, key: &str) -> Result<bool> {
        StoreCounter::allow(self, key).await
    }
}

/// Build a store counter from `config`, backed by Redis when it answers.
///
/// The connection attempt is bounded by the store timeout. When Redis is
/// unavailable the counter falls back to a [`MemoryCounterStore`] whose
/// expired buckets are purged in the background.
pub async fn store_backend(config: &StoreConfig) -> Arc<dyn AdmissionBackend> {
    let timeout = config.timeout();
    let connected = tokio::time::timeout(timeout, RedisCounterStore::connect(&config.url))
        .await
        .map_err(|_| AdmissionError::Timeout(timeout))
        .and_then(|result| result);

    match connected {
        Ok(store) => {
            info!(url = %config.url, "Using Redis counter store");
            Arc::new(store_counter(Arc::new(store), config))
        }
        Err(e) => {
            warn!(error = %e, url = %config.url, "Redis unavailable, using in-memory store");
            let store = Arc::new(MemoryCounterStore::new());
            Arc::clone(&store).spawn_purger(config.expiry());
            Arc::new(store_counter(store, config))
        }
    }
}

fn store_counter<S: CounterStore>(store: Arc<S>, config: &StoreConfig) -> StoreCounter<S> {
    StoreCounter::new(store, config.budget)
        .with_prefix(config.key_prefix.clone())
        .with_expiry(config.expiry())
        .with_timeout(config.timeout())
}
