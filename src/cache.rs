//! Time-bounded memoization for expensive pipeline results.
//!
//! One slot per key, each behind its own async mutex, so concurrent callers
//! of the same key wait for a single in-flight computation instead of
//! fetching upstream twice. Different keys never block each other.
//!
//! An entry may carry a tag naming what it was derived from. A tagged lookup
//! only hits when the tag matches, so values derived from an older input are
//! recomputed as soon as the input changes, whatever their age.
//!
//! A failed or timed-out computation leaves the slot exactly as it was. There
//! is no stale fallback: an expired entry is recomputed or the call fails.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::EngineError;

struct CacheEntry<V> {
    value: Arc<V>,
    computed_at: Instant,
    tag: Option<String>,
}

type Slot<V> = Arc<Mutex<Option<CacheEntry<V>>>>;

pub struct ResultCache<V> {
    ttl: Duration,
    slots: DashMap<String, Slot<V>>,
}

impl<V: Send + Sync + 'static> ResultCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: DashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn slot(&self, key: &str) -> Slot<V> {
        self.slots.entry(key.to_string()).or_default().clone()
    }

    /// Return the cached value for `key` if it is younger than the TTL,
    /// otherwise run `compute` and store its result.
    ///
    /// The flag is `true` when the value was computed by this call.
    pub async fn get_or_compute<F, Fut, E>(&self, key: &str, compute: F) -> Result<(Arc<V>, bool), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        self.get_or_compute_tagged(key, None, compute).await
    }

    /// Like [`get_or_compute`](Self::get_or_compute), but an entry stored
    /// under a different tag counts as a miss.
    pub async fn get_or_compute_tagged<F, Fut, E>(
        &self,
        key: &str,
        tag: Option<&str>,
        compute: F,
    ) -> Result<(Arc<V>, bool), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;

        if let Some(entry) = guard.as_ref() {
            if entry.computed_at.elapsed() < self.ttl && entry.tag.as_deref() == tag {
                log::debug!("cache hit: {}", key);
                return Ok((entry.value.clone(), false));
            }
        }

        log::info!("cache miss: {}", key);
        let value = Arc::new(compute().await?);
        *guard = Some(CacheEntry {
            value: value.clone(),
            computed_at: Instant::now(),
            tag: tag.map(str::to_string),
        });
        Ok((value, true))
    }

    /// [`get_or_compute`](Self::get_or_compute) bounded by `limit`, including
    /// time spent waiting behind another caller of the same key.
    pub async fn get_or_compute_within<F, Fut, E>(
        &self,
        key: &str,
        limit: Duration,
        compute: F,
    ) -> Result<(Arc<V>, bool), EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: Into<EngineError>,
    {
        match tokio::time::timeout(limit, self.get_or_compute(key, compute)).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => {
                log::warn!("cache compute for {} timed out after {:?}", key, limit);
                Err(EngineError::Timeout(limit.as_secs()))
            }
        }
    }

    /// Compute and store regardless of the current entry's age.
    pub async fn recompute<F, Fut, E>(&self, key: &str, compute: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        self.recompute_tagged(key, None, compute).await
    }

    pub async fn recompute_tagged<F, Fut, E>(&self, key: &str, tag: Option<&str>, compute: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        let value = Arc::new(compute().await?);
        *guard = Some(CacheEntry {
            value: value.clone(),
            computed_at: Instant::now(),
            tag: tag.map(str::to_string),
        });
        Ok(value)
    }

    /// The stored value, whatever its age.
    pub async fn peek(&self, key: &str) -> Option<Arc<V>> {
        let slot = self.slots.get(key).map(|s| s.value().clone())?;
        let guard = slot.lock().await;
        guard.as_ref().map(|e| e.value.clone())
    }

    pub async fn invalidate(&self, key: &str) {
        let slot = self.slots.get(key).map(|s| s.value().clone());
        if let Some(slot) = slot {
            *slot.lock().await = None;
        }
    }
}
