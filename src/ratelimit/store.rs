//! Counter backed by an external key/value store.
//!
//! The store must offer an atomic increment that returns the new value and a
//! way to put an expiry on a key. A bucket's first increment and its expiry
//! are applied in one step, so a lost round trip can never leave a bucket
//! without an expiry. Redis does this with a Lua script; [`MemoryCounterStore`]
//! mimics it in-process.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::Script;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{AdmissionError, Result};

/// Key prefix for counters written to the store.
pub const DEFAULT_KEY_PREFIX: &str = "count-limit-";

/// Timestamp layout appended to each counter key, one bucket per second.
const BUCKET_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Increments between purges of expired [`MemoryCounterStore`] entries.
const PURGE_EVERY: u64 = 1024;

/// Increment, and set the expiry when the key is new or has none.
const INCR_WITH_EXPIRY_LUA: &str = r#"
local count = redis.call("INCR", KEYS[1])
if count == 1 or redis.call("PTTL", KEYS[1]) == -1 then
    redis.call("PEXPIRE", KEYS[1], ARGV[1])
end
return count
"#;

/// Atomic counter primitives required from a remote store.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key` by one and return the new value.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Expire `key` after `ttl`.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Increment `key` and, in the same atomic step, expire it after `ttl` if
    /// it has no expiry yet. Returns the new value.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64>;
}

/// [`CounterStore`] backed by Redis `INCR` and `PEXPIRE`.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection_manager: ConnectionManager,
    incr_with_expiry: Script,
}

impl RedisCounterStore {
    /// Wrap an existing connection manager.
    pub fn new(connection_manager: ConnectionManager) -> Self {
        Self {
            connection_manager,
            incr_with_expiry: Script::new(INCR_WITH_EXPIRY_LUA),
        }
    }

    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let connection_manager = client.get_connection_manager().await?;
        debug!(url = %url, "Connected to Redis counter store");
        Ok(Self::new(connection_manager))
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr(&self, key: &str) -> Result<i64> {
        let mut connection_manager = self.connection_manager.clone();
        let value = redis::cmd("INCR")
            .arg(key)
            .query_async::<i64>(&mut connection_manager)
            .await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut connection_manager = self.connection_manager.clone();
        redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async::<()>(&mut connection_manager)
            .await?;
        Ok(())
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut connection_manager = self.connection_manager.clone();
        let value: i64 = self
            .incr_with_expiry
            .key(key)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut connection_manager)
            .await?;
        Ok(value)
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    // PEXPIRE rejects 0
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

struct StoredCounter {
    value: i64,
    expires_at: Option<Instant>,
}

impl StoredCounter {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process [`CounterStore`] with the same increment and expiry semantics.
///
/// Expired entries are dropped every few increments and by
/// [`purge_expired`](Self::purge_expired), so one-second buckets do not pile
/// up in a long-running process.
#[derive(Default)]
pub struct MemoryCounterStore {
    entries: DashMap<String, StoredCounter>,
    increments: AtomicU64,
}

impl MemoryCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of `key`, if present and unexpired.
    pub fn get(&self, key: &str) -> Option<i64> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value)
    }

    /// Remaining time to live of `key`, if it is present and has an expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .and_then(|at| at.checked_duration_since(now))
    }

    /// Number of keys held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed = removed, remaining = self.entries.len(), "Purged expired counters");
        }
        removed
    }

    /// Run [`purge_expired`](Self::purge_expired) every `interval` on the
    /// tokio runtime.
    pub fn spawn_purger(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        info!(interval_ms = interval.as_millis() as u64, "Starting counter purger");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.purge_expired();
            }
        })
    }

    fn bump(&self, key: &str, ttl: Option<Duration>) -> i64 {
        // Purge before taking the entry; retain would wait on its shard
        if self.increments.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1 {
            self.purge_expired();
        }

        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_owned())
            .or_insert(StoredCounter {
                value: 0,
                expires_at: None,
            });
        if entry.is_expired(now) {
            entry.value = 0;
            entry.expires_at = None;
        }
        entry.value += 1;
        if let Some(ttl) = ttl {
            if entry.expires_at.is_none() {
                entry.expires_at = now.checked_add(ttl);
            }
        }
        entry.value
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr(&self, key: &str) -> Result<i64> {
        Ok(self.bump(key, None))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Instant::now().checked_add(ttl);
        }
        Ok(())
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64> {
        Ok(self.bump(key, Some(ttl)))
    }
}

/// How a caller treats a store failure when it needs a yes/no answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Admit the request when the store cannot answer.
    Open,
    /// Deny the request when the store cannot answer.
    #[default]
    Closed,
}

impl FailMode {
    /// Collapse a store decision into a boolean, logging any swallowed error.
    pub fn resolve(self, decision: Result<bool>) -> bool {
        match decision {
            Ok(admitted) => admitted,
            Err(e) => {
                let admitted = self == FailMode::Open;
                warn!(error = %e, fail_mode = ?self, admitted = admitted, "Admission state unknown");
                admitted
            }
        }
    }
}

/// Admission counter stored in a [`CounterStore`].
///
/// Each call increments `"{prefix}{key}{timestamp}"`, where the timestamp is
/// the current UTC second. The first increment of a bucket sets its expiry in
/// the same store call; requests are denied once the bucket's value exceeds
/// `budget`.
pub struct StoreCounter<S: CounterStore> {
    store: Arc<S>,
    budget: i64,
    prefix: String,
    expiry: Duration,
    timeout: Duration,
}

impl<S: CounterStore> StoreCounter<S> {
    /// Create a counter allowing `budget` requests per bucket.
    pub fn new(store: Arc<S>, budget: i64) -> Self {
        Self {
            store,
            budget,
            prefix: DEFAULT_KEY_PREFIX.to_string(),
            expiry: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
        }
    }

    /// Use a different key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Bound each store round trip by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Expire fresh buckets after `expiry`.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    /// The configured budget.
    pub fn budget(&self) -> i64 {
        self.budget
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The store key used for `key` in the current second.
    pub fn bucket_key(&self, key: &str) -> String {
        format!("{}{}{}", self.prefix, key, Utc::now().format(BUCKET_FORMAT))
    }

    /// Decide whether a request for `key` may proceed.
    ///
    /// Store failures and timeouts are returned as errors. They say nothing
    /// about admission; see [`FailMode`].
    pub async fn allow(&self, key: &str) -> Result<bool> {
        let bucket = self.bucket_key(key);

        let count = self
            .bounded(self.store.incr_with_expiry(&bucket, self.expiry))
            .await?;

        let admitted = count <= self.budget;
        trace!(bucket = %bucket, count = count, admitted = admitted, "Store counter decision");
        if !admitted {
            debug!(bucket = %bucket, count = count, budget = self.budget, "Request denied");
        }
        Ok(admitted)
    }

    /// Like [`allow`](Self::allow), abandoned with
    /// [`AdmissionError::Cancelled`] if `cancel` resolves first.
    pub async fn allow_or_cancel<F>(&self, key: &str, cancel: F) -> Result<bool>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::select! {
            decision = self.allow(key) => decision,
            _ = cancel => Err(AdmissionError::Cancelled),
        }
    }

    /// Whether a request for `key` is blocked.
    pub async fn is_limited(&self, key: &str) -> Result<bool> {
        Ok(!self.allow(key).await?)
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.timeout, op)
            .await
            .map_err(|_| AdmissionError::Timeout(self.timeout))?
    }
}
