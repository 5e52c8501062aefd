use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use super::{CacheEntry, CacheError, SharedCache};
use crate::flags::CacheKey;

/// In-process stand-in for the shared cache service.
///
/// Behaves like the network tier (TTL, higher-version-wins puts, bulk eviction)
/// and can be told to add latency or go offline, which is how the evaluator's
/// timeout and degraded paths are exercised.
pub struct InMemorySharedCache {
    entries: DashMap<CacheKey, CacheEntry>,
    ttl: Duration,
    latency_ms: AtomicU64,
    available: AtomicBool,
}

impl InMemorySharedCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            latency_ms: AtomicU64::new(0),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Peek without the simulated round trip.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    async fn round_trip(&self) -> Result<(), CacheError> {
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.available.load(Ordering::Relaxed) {
            return Err(CacheError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SharedCache for InMemorySharedCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        self.round_trip().await?;

        let now = Utc::now();
        let removed = self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        if removed.is_some() {
            return Ok(None);
        }
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn put(&self, key: &CacheKey, entry: CacheEntry) -> Result<(), CacheError> {
        self.round_trip().await?;

        let now = Utc::now();
        self.entries
            .entry(key.clone())
            .and_modify(|existing| {
                if existing.source_version <= entry.source_version || existing.is_expired(now) {
                    *existing = entry.clone();
                }
            })
            .or_insert_with(|| entry.clone());
        Ok(())
    }

    async fn evict(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.round_trip().await?;
        self.entries.remove(key);
        Ok(())
    }

    async fn evict_if_older(&self, key: &CacheKey, version: u64) -> Result<bool, CacheError> {
        self.round_trip().await?;
        Ok(self
            .entries
            .remove_if(key, |_, entry| entry.source_version < version)
            .is_some())
    }

    async fn evict_environment(&self, environment: &str) -> Result<usize, CacheError> {
        self.round_trip().await?;
        let before = self.entries.len();
        self.entries.retain(|key, _| key.environment != environment);
        Ok(before.saturating_sub(self.entries.len()))
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}
