//! Cache tiers sitting in front of the flag store.
//!
//! Two tiers hold independent copies of a record snapshot:
//! - `LocalCache`: per-process, LRU-bounded (moka)
//! - `SharedCache`: a network tier shared by every process (trait + in-memory double)
//!
//! Both expire entries passively on read and keep the higher `source_version`
//! when two writers race.

pub mod local;
pub mod shared;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;

use crate::flags::{CacheKey, FlagRecord};

pub use local::{LocalCache, LocalCacheConfig};
pub use shared::InMemorySharedCache;

/// A record snapshot owned by exactly one tier.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub record: FlagRecord,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub source_version: u64,
}

impl CacheEntry {
    pub fn new(record: FlagRecord, ttl: Duration, now: DateTime<Utc>) -> Self {
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            source_version: record.version,
            record,
            fetched_at: now,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Time left until `expires_at`, zero once expired.
    pub fn time_to_live(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("shared cache unavailable: {0}")]
    Unavailable(String),
}

/// A network-reachable cache tier consulted on local miss.
#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError>;

    /// Store an entry unless a newer version is already cached.
    async fn put(&self, key: &CacheKey, entry: CacheEntry) -> Result<(), CacheError>;

    async fn evict(&self, key: &CacheKey) -> Result<(), CacheError>;

    /// Evict the entry only if it is older than `version`. Returns whether it was evicted.
    async fn evict_if_older(&self, key: &CacheKey, version: u64) -> Result<bool, CacheError>;

    async fn evict_environment(&self, environment: &str) -> Result<usize, CacheError>;

    /// TTL applied to entries this tier creates.
    fn ttl(&self) -> Duration;
}

/// Highest version seen per key in this process.
///
/// Cache entries below the floor are stale and are skipped by the evaluator,
/// which gives monotonic reads per flag even while invalidations are in flight.
#[derive(Debug, Default)]
pub struct VersionFloors {
    floors: DashMap<CacheKey, u64>,
}

impl VersionFloors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> u64 {
        self.floors.get(key).map(|v| *v).unwrap_or(0)
    }

    /// Raise the floor for `key` to `version` if it is higher.
    pub fn raise(&self, key: &CacheKey, version: u64) {
        self.floors
            .entry(key.clone())
            .and_modify(|floor| *floor = (*floor).max(version))
            .or_insert(version);
    }
}
