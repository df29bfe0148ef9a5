//! Memoizing fetch cache.
//!
//! Design:
//! - Entries live in their own backend namespace so `restart` can wipe run
//!   state while keeping fetched data.
//! - Each entry records its expiration policy, storage time and the run
//!   epoch that wrote it; freshness is judged at read time against the
//!   current run.
//! - Concurrent misses on one key are collapsed: a single fill runs and
//!   every caller gets its value (single flight).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use crate::domain::TaskError;
use crate::ports::Clock;
use crate::store::{Backend, Mutation, Namespace};

/// When a cached value stops being served.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ExpirePolicy {
    /// Served forever.
    Never,
    /// Stale as soon as a new run starts.
    Epoch,
    /// Stale after a fixed age.
    Ttl { max_age_ms: i64 },
}

/// What a fill closure hands back: the value plus how long to keep it.
#[derive(Debug, Clone)]
pub struct CacheFill {
    pub value: Value,
    pub expires: ExpirePolicy,
}

impl CacheFill {
    pub fn new(value: Value, expires: ExpirePolicy) -> Self {
        Self { value, expires }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Value,
    pub expires: ExpirePolicy,
    pub stored_at: DateTime<Utc>,
    pub epoch: DateTime<Utc>,
}

pub struct CacheLayer {
    backend: Arc<dyn Backend>,
    ns: Namespace,
    clock: Arc<dyn Clock>,
    epoch: DateTime<Utc>,
    prefer_cache: bool,
    inflight: Mutex<HashMap<String, Arc<OnceCell<Value>>>>,
}

impl CacheLayer {
    /// `epoch` is the start timestamp of the current run; entries written by
    /// earlier runs carry an older epoch and fail the `Epoch` policy.
    pub fn new(
        backend: Arc<dyn Backend>,
        clock: Arc<dyn Clock>,
        epoch: DateTime<Utc>,
        prefer_cache: bool,
    ) -> Self {
        Self {
            backend,
            ns: Namespace::cache(),
            clock,
            epoch,
            prefer_cache,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached value for `key`, running `fill` on a miss or a
    /// stale hit. Concurrent callers of the same key share one fill.
    pub async fn cached<F, Fut>(&self, key: &str, fill: F) -> Result<Value, TaskError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheFill, TaskError>>,
    {
        let cell = {
            let mut inflight = self.inflight.lock().await;
            Arc::clone(inflight.entry(key.to_owned()).or_default())
        };

        let result = cell
            .get_or_try_init(|| self.lookup_or_fill(key, fill))
            .await
            .cloned();

        // Drop the slot so later calls re-judge freshness; only the cell we
        // handed out may be evicted, a newer one belongs to someone else.
        let mut inflight = self.inflight.lock().await;
        if let Some(current) = inflight.get(key)
            && Arc::ptr_eq(current, &cell)
        {
            inflight.remove(key);
        }

        result
    }

    async fn lookup_or_fill<F, Fut>(&self, key: &str, fill: F) -> Result<Value, TaskError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheFill, TaskError>>,
    {
        if let Some(raw) = self.backend.get(&self.ns, key).await? {
            match serde_json::from_value::<CacheEntry>(raw) {
                Ok(entry) if self.is_fresh(&entry) => return Ok(entry.value),
                Ok(_) => {}
                Err(err) => {
                    debug!(key, error = %err, "discarding unreadable cache entry");
                }
            }
        }

        let filled = fill().await?;
        if let ExpirePolicy::Ttl { max_age_ms } = filled.expires
            && max_age_ms < 0
        {
            return Err(TaskError::transient(format!(
                "cache fill for '{key}' returned a negative max age ({max_age_ms}ms)"
            )));
        }

        let entry = CacheEntry {
            value: filled.value.clone(),
            expires: filled.expires,
            stored_at: self.clock.now(),
            epoch: self.epoch,
        };
        let put = Mutation::put(self.ns.clone(), key, &entry)?;
        self.backend.apply(&[put]).await?;
        Ok(filled.value)
    }

    fn is_fresh(&self, entry: &CacheEntry) -> bool {
        if self.prefer_cache {
            return true;
        }
        match entry.expires {
            ExpirePolicy::Never => true,
            ExpirePolicy::Epoch => entry.epoch == self.epoch,
            ExpirePolicy::Ttl { max_age_ms } => {
                (self.clock.now() - entry.stored_at).num_milliseconds() < max_age_ms
            }
        }
    }
}
