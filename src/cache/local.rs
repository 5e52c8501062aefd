use chrono::{DateTime, Utc};
use moka::ops::compute::{CompResult, Op};
use moka::policy::EvictionPolicy;
use moka::sync::Cache as MokaCache;
use moka::Expiry;
use std::time::{Duration, Instant};
use tracing::debug;

use super::CacheEntry;
use crate::flags::{CacheKey, FlagRecord};

#[derive(Debug, Clone)]
pub struct LocalCacheConfig {
    /// Upper bound on entries, least recently used evicted first.
    pub capacity: usize,
    pub ttl: Duration,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl: Duration::from_secs(30),
        }
    }
}

/// Expire each entry at its own `expires_at`, capped at the tier TTL.
struct UntilExpiresAt {
    max: Duration,
}

impl Expiry<CacheKey, CacheEntry> for UntilExpiresAt {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.time_to_live(Utc::now()).min(self.max))
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.time_to_live(Utc::now()).min(self.max))
    }
}

/// Per-process flag cache.
///
/// Backed by a moka cache: lookups and evictions of different keys never wait on
/// each other, size is bounded by LRU eviction and entries expire at
/// `expires_at`. Reads also check expiry against the caller's clock.
pub struct LocalCache {
    entries: MokaCache<CacheKey, CacheEntry>,
    ttl: Duration,
}

impl LocalCache {
    pub fn new(config: LocalCacheConfig) -> Self {
        let entries = MokaCache::builder()
            .max_capacity(config.capacity.max(1) as u64)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(UntilExpiresAt { max: config.ttl })
            .build();

        Self {
            entries,
            ttl: config.ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Snapshot `record` with this tier's TTL.
    pub fn entry_for(&self, record: FlagRecord, now: DateTime<Utc>) -> CacheEntry {
        CacheEntry::new(record, self.ttl, now)
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.get_at(key, Utc::now())
    }

    pub fn get_at(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<CacheEntry> {
        let entry = self.entries.get(key)?;
        if !entry.is_expired(now) {
            return Some(entry);
        }

        // only drop it if no fresher entry replaced it meanwhile
        self.entries
            .entry_by_ref(key)
            .and_compute_with(|current| match current {
                Some(current) if current.value().is_expired(now) => Op::Remove,
                _ => Op::Nop,
            });
        debug!(%key, "local cache entry expired");
        None
    }

    /// Insert or replace an entry. A live entry with a higher version is kept and
    /// `false` is returned.
    pub fn put(&self, key: CacheKey, entry: CacheEntry) -> bool {
        self.put_at(key, entry, Utc::now())
    }

    pub fn put_at(&self, key: CacheKey, entry: CacheEntry, now: DateTime<Utc>) -> bool {
        let result = self.entries.entry(key).and_compute_with(|current| match current {
            Some(current)
                if current.value().source_version > entry.source_version
                    && !current.value().is_expired(now) =>
            {
                Op::Nop
            }
            _ => Op::Put(entry),
        });
        matches!(result, CompResult::Inserted(_) | CompResult::ReplacedWith(_))
    }

    pub fn evict(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.remove(key)
    }

    /// Evict the entry if its `source_version` is below `version`.
    ///
    /// Entries already at or above `version` are left alone, which makes repeated
    /// or reordered change events harmless.
    pub fn evict_if_older(&self, key: &CacheKey, version: u64) -> bool {
        let result = self
            .entries
            .entry_by_ref(key)
            .and_compute_with(|current| match current {
                Some(current) if current.value().source_version < version => Op::Remove,
                _ => Op::Nop,
            });
        matches!(result, CompResult::Removed(_))
    }

    /// Drop every entry of `environment`. Returns how many were removed.
    pub fn evict_environment(&self, environment: &str) -> usize {
        let keys: Vec<_> = self
            .entries
            .iter()
            .filter(|(key, _)| key.environment == environment)
            .map(|(key, _)| key)
            .collect();

        keys.into_iter()
            .filter(|key| self.entries.remove(&**key).is_some())
            .count()
    }

    /// Number of live entries, after moka's pending evictions are applied.
    pub fn len(&self) -> usize {
        self.entries.run_pending_tasks();
        self.entries.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn cache(capacity: usize) -> LocalCache {
        LocalCache::new(LocalCacheConfig {
            capacity,
            ttl: Duration::from_secs(30),
        })
    }

    fn entry(flag_key: &str, version: u64) -> CacheEntry {
        CacheEntry::new(
            FlagRecord::new(flag_key, "prod").with_version(version),
            Duration::from_secs(30),
            Utc::now(),
        )
    }

    #[test]
    fn test_put_get_evict() {
        let cache = cache(10);
        let key = CacheKey::new("checkout-v2", "prod");
        assert!(cache.get(&key).is_none());

        assert!(cache.put(key.clone(), entry("checkout-v2", 1)));
        assert_eq!(cache.get(&key).unwrap().source_version, 1);
        assert_eq!(cache.len(), 1);

        assert!(cache.evict(&key).is_some());
        assert!(cache.get(&key).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_passive_expiry_removes_entry() {
        let cache = cache(10);
        let key = CacheKey::new("checkout-v2", "prod");
        cache.put(key.clone(), entry("checkout-v2", 1));

        let later = Utc::now() + chrono::Duration::seconds(31);
        assert!(cache.get_at(&key, later).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_put_keeps_higher_version() {
        let cache = cache(10);
        let key = CacheKey::new("checkout-v2", "prod");
        assert!(cache.put(key.clone(), entry("checkout-v2", 5)));
        assert!(!cache.put(key.clone(), entry("checkout-v2", 3)));
        assert_eq!(cache.get(&key).unwrap().source_version, 5);
        assert!(cache.put(key.clone(), entry("checkout-v2", 6)));
        assert_eq!(cache.get(&key).unwrap().source_version, 6);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = cache(2);
        let a = CacheKey::new("a", "prod");
        let b = CacheKey::new("b", "prod");
        let c = CacheKey::new("c", "prod");

        cache.put(a.clone(), entry("a", 1));
        cache.put(b.clone(), entry("b", 1));
        cache.entries.run_pending_tasks();
        // touch a so b becomes the least recently used
        assert!(cache.get(&a).is_some());
        cache.entries.run_pending_tasks();
        cache.put(c.clone(), entry("c", 1));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&a).is_some());
        assert!(cache.get(&b).is_none());
        assert!(cache.get(&c).is_some());
    }

    #[test]
    fn test_evict_if_older_is_idempotent() {
        let cache = cache(10);
        let key = CacheKey::new("checkout-v2", "prod");
        cache.put(key.clone(), entry("checkout-v2", 3));

        assert!(!cache.evict_if_older(&key, 3));
        assert!(cache.get(&key).is_some());

        assert!(cache.evict_if_older(&key, 4));
        assert!(!cache.evict_if_older(&key, 4));
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn test_evict_environment() {
        let cache = cache(100);
        for i in 0..10 {
            cache.put(CacheKey::new(format!("f{i}"), "prod"), entry("f", 1));
            cache.put(CacheKey::new(format!("f{i}"), "staging"), entry("f", 1));
        }
        assert_eq!(cache.evict_environment("prod"), 10);
        assert_eq!(cache.len(), 10);
        assert!(cache.get(&CacheKey::new("f0", "staging")).is_some());
        assert!(cache.get(&CacheKey::new("f0", "prod")).is_none());
    }

    #[test]
    fn test_capacity_is_a_hard_bound() {
        let cache = cache(10);
        for i in 0..200 {
            let flag = format!("flag-{}", i);
            cache.put(CacheKey::new(&flag, "prod"), entry(&flag, 1));
        }
        assert!(cache.len() <= 10, "holds {} entries", cache.len());
    }

    #[test]
    fn test_entry_expires_at_its_own_deadline() {
        let cache = cache(10);
        let key = CacheKey::new("checkout-v2", "prod");
        let stale = CacheEntry::new(
            FlagRecord::new("checkout-v2", "prod"),
            Duration::from_millis(1),
            Utc::now() - chrono::Duration::seconds(1),
        );
        cache.put(key.clone(), stale);
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn test_concurrent_access() {
        let cache = Arc::new(cache(1_000));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let key = CacheKey::new(format!("flag-{}", i % 50), "prod");
                        if t % 2 == 0 {
                            cache.put(key, entry("flag", i));
                        } else {
                            cache.get(&key);
                            cache.evict_if_older(&key, i / 2);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.len() <= 50);
    }

    proptest! {
        #[test]
        fn prop_eviction_is_idempotent(
            versions in prop::collection::vec(1u64..20, 1..8),
            event_version in 1u64..20,
        ) {
            let once = cache(16);
            let twice = cache(16);
            for (i, version) in versions.iter().enumerate() {
                let flag = format!("flag-{}", i);
                once.put(CacheKey::new(&flag, "prod"), entry(&flag, *version));
                twice.put(CacheKey::new(&flag, "prod"), entry(&flag, *version));
            }

            for i in 0..versions.len() {
                let key = CacheKey::new(format!("flag-{}", i), "prod");
                once.evict_if_older(&key, event_version);
                twice.evict_if_older(&key, event_version);
                twice.evict_if_older(&key, event_version);
            }

            for i in 0..versions.len() {
                let key = CacheKey::new(format!("flag-{}", i), "prod");
                let left = once.get(&key).map(|e| e.source_version);
                let right = twice.get(&key).map(|e| e.source_version);
                prop_assert_eq!(left, right);
                if let Some(version) = left {
                    prop_assert!(version >= event_version);
                }
            }
        }
    }
}
