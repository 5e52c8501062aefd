use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{ChangeEvent, FlagStore, StoreError, Subscription};
use crate::flags::{validate_environment_key, validate_flag_key, CacheKey, FlagRecord};

pub(crate) const CHANNEL_CAPACITY: usize = 1024;

enum Stored {
    Live(FlagRecord),
    Tombstone { version: u64 },
    Malformed { version: u64, reason: String },
}

impl Stored {
    fn version(&self) -> u64 {
        match self {
            Self::Live(record) => record.version,
            Self::Tombstone { version } | Self::Malformed { version, .. } => *version,
        }
    }
}

/// Authoritative in-process flag store.
///
/// Carries the admin write path (create, update, delete, bulk import), bumps
/// versions, keeps tombstones so a re-created flag continues its version line,
/// and publishes a `ChangeEvent` per environment after each commit. Latency and
/// outages can be injected for degraded-mode tests.
pub struct InMemoryFlagStore {
    records: RwLock<HashMap<CacheKey, Stored>>,
    channels: Mutex<HashMap<String, broadcast::Sender<ChangeEvent>>>,
    latency_ms: AtomicU64,
    available: AtomicBool,
    fetches: AtomicU64,
}

impl Default for InMemoryFlagStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryFlagStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            latency_ms: AtomicU64::new(0),
            available: AtomicBool::new(true),
            fetches: AtomicU64::new(0),
        }
    }

    // ADMIN WRITE PATH

    /// Create a flag at the version after any previous tombstone (1 for a new key).
    pub fn create(&self, mut record: FlagRecord) -> Result<FlagRecord, StoreError> {
        validate_flag_key(&record.flag_key).map_err(|e| StoreError::malformed(&record.key(), e))?;
        validate_environment_key(&record.environment)
            .map_err(|e| StoreError::malformed(&record.key(), e))?;

        let key = record.key();
        {
            let mut records = self.records.write();
            let version = match records.get(&key) {
                Some(Stored::Live(_)) => {
                    return Err(StoreError::Conflict {
                        flag_key: key.flag_key,
                        environment: key.environment,
                    })
                }
                Some(previous) => previous.version() + 1,
                None => 1,
            };

            record.targeting_rules.normalize();
            record.version = version;
            record.updated_at = Utc::now();
            records.insert(key.clone(), Stored::Live(record.clone()));
        }

        info!(key = %key, version = record.version, "flag created");
        self.publish(ChangeEvent::flag(&key.flag_key, &key.environment, record.version));
        Ok(record)
    }

    /// Apply `mutate` to a live record and bump its version by one.
    pub fn update(
        &self,
        flag_key: &str,
        environment: &str,
        mutate: impl FnOnce(&mut FlagRecord),
    ) -> Result<FlagRecord, StoreError> {
        let key = CacheKey::new(flag_key, environment);
        let updated = {
            let mut records = self.records.write();
            let Some(Stored::Live(current)) = records.get_mut(&key) else {
                return Err(StoreError::not_found(&key));
            };

            let next_version = current.version + 1;
            mutate(current);
            current.flag_key = key.flag_key.clone();
            current.environment = key.environment.clone();
            current.targeting_rules.normalize();
            current.version = next_version;
            current.updated_at = Utc::now();
            current.clone()
        };

        info!(key = %key, version = updated.version, "flag updated");
        self.publish(ChangeEvent::flag(flag_key, environment, updated.version));
        Ok(updated)
    }

    /// Tombstone a flag. Returns the tombstone version.
    pub fn delete(&self, flag_key: &str, environment: &str) -> Result<u64, StoreError> {
        let key = CacheKey::new(flag_key, environment);
        let version = {
            let mut records = self.records.write();
            let version = match records.get(&key) {
                Some(Stored::Live(record)) => record.version + 1,
                Some(Stored::Malformed { version, .. }) => version + 1,
                Some(Stored::Tombstone { .. }) | None => return Err(StoreError::not_found(&key)),
            };
            records.insert(key.clone(), Stored::Tombstone { version });
            version
        };

        info!(key = %key, version, "flag deleted");
        self.publish(ChangeEvent::flag(flag_key, environment, version));
        Ok(version)
    }

    /// Replace every flag of an environment and publish a single environment-wide flush.
    pub fn bulk_import(
        &self,
        environment: &str,
        records: Vec<FlagRecord>,
    ) -> Result<usize, StoreError> {
        for record in &records {
            validate_flag_key(&record.flag_key)
                .map_err(|e| StoreError::malformed(&record.key(), e))?;
        }

        let count = records.len();
        {
            let mut stored = self.records.write();
            let now = Utc::now();

            let mut next: HashMap<CacheKey, Stored> = HashMap::new();
            for (key, previous) in stored.iter() {
                if key.environment == environment {
                    next.insert(
                        key.clone(),
                        Stored::Tombstone {
                            version: previous.version() + 1,
                        },
                    );
                }
            }

            for mut record in records {
                record.environment = environment.to_string();
                let key = record.key();
                let floor = next
                    .get(&key)
                    .map(Stored::version)
                    .or_else(|| stored.get(&key).map(Stored::version))
                    .unwrap_or(0);
                record.version = floor.max(record.version).max(1);
                record.targeting_rules.normalize();
                record.updated_at = now;
                next.insert(key, Stored::Live(record));
            }

            stored.extend(next);
        }

        info!(environment, count, "bulk import applied");
        self.publish(ChangeEvent::environment_flush(environment));
        Ok(count)
    }

    /// Test hook: replace a record with an undecodable one.
    pub fn corrupt(&self, flag_key: &str, environment: &str, reason: &str) {
        let key = CacheKey::new(flag_key, environment);
        let mut records = self.records.write();
        let version = records.get(&key).map(Stored::version).unwrap_or(0) + 1;
        records.insert(
            key,
            Stored::Malformed {
                version,
                reason: reason.to_string(),
            },
        );
    }

    // FAULT INJECTION

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Drop the pub/sub channel of an environment, closing every subscription on it.
    pub fn disconnect_subscribers(&self, environment: &str) {
        if self.channels.lock().remove(environment).is_some() {
            debug!(environment, "subscribers disconnected");
        }
    }

    /// Number of `get`/`list` calls that reached the store.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    fn publish(&self, event: ChangeEvent) {
        let channels = self.channels.lock();
        if let Some(tx) = channels.get(&event.environment) {
            // no receivers is fine
            let _ = tx.send(event);
        }
    }

    async fn round_trip(&self) -> Result<(), StoreError> {
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.available.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl FlagStore for InMemoryFlagStore {
    async fn get(&self, flag_key: &str, environment: &str) -> Result<FlagRecord, StoreError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        self.round_trip().await?;

        let key = CacheKey::new(flag_key, environment);
        match self.records.read().get(&key) {
            Some(Stored::Live(record)) => Ok(record.clone()),
            Some(Stored::Malformed { reason, .. }) => Err(StoreError::malformed(&key, reason.clone())),
            Some(Stored::Tombstone { .. }) | None => Err(StoreError::not_found(&key)),
        }
    }

    async fn list(&self, environment: &str) -> Result<Vec<FlagRecord>, StoreError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        self.round_trip().await?;

        let mut records: Vec<FlagRecord> = self
            .records
            .read()
            .values()
            .filter_map(|stored| match stored {
                Stored::Live(record) if record.environment == environment => Some(record.clone()),
                _ => None,
            })
            .collect();
        records.sort_by(|a, b| a.flag_key.cmp(&b.flag_key));
        Ok(records)
    }

    async fn subscribe(&self, environment: &str) -> Result<Subscription, StoreError> {
        self.round_trip().await?;

        let rx = self
            .channels
            .lock()
            .entry(environment.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        Ok(Subscription::from_broadcast(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::TargetingRules;
    use crate::store::Notification;

    #[tokio::test]
    async fn test_create_get() {
        let store = InMemoryFlagStore::new();
        let created = store
            .create(FlagRecord::new("checkout-v2", "prod").with_enabled(true))
            .unwrap();
        assert_eq!(created.version, 1);

        let fetched = store.get("checkout-v2", "prod").await.unwrap();
        assert_eq!(fetched, created);
        assert!(matches!(
            store.get("checkout-v2", "staging").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_conflict() {
        let store = InMemoryFlagStore::new();
        store.create(FlagRecord::new("checkout-v2", "prod")).unwrap();
        assert!(matches!(
            store.create(FlagRecord::new("checkout-v2", "prod")),
            Err(StoreError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_versions_strictly_increase() {
        let store = InMemoryFlagStore::new();
        store.create(FlagRecord::new("checkout-v2", "prod")).unwrap();
        let v2 = store.update("checkout-v2", "prod", |r| r.enabled = true).unwrap();
        let v3 = store
            .update("checkout-v2", "prod", |r| r.version = 1)
            .unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(v3.version, 3);

        let tombstone = store.delete("checkout-v2", "prod").unwrap();
        assert_eq!(tombstone, 4);
        assert!(store.get("checkout-v2", "prod").await.is_err());

        let recreated = store.create(FlagRecord::new("checkout-v2", "prod")).unwrap();
        assert_eq!(recreated.version, 5);
    }

    #[tokio::test]
    async fn test_percentage_clamped_on_ingest() {
        let store = InMemoryFlagStore::new();
        let created = store
            .create(FlagRecord::new("checkout-v2", "prod").with_rules(TargetingRules {
                percentage: 200,
                ..Default::default()
            }))
            .unwrap();
        assert_eq!(created.targeting_rules.percentage, 100);
    }

    #[tokio::test]
    async fn test_mutations_are_published() {
        let store = InMemoryFlagStore::new();
        let mut sub = store.subscribe("prod").await.unwrap();

        store.create(FlagRecord::new("checkout-v2", "prod")).unwrap();
        store.update("checkout-v2", "prod", |r| r.enabled = true).unwrap();
        store.delete("checkout-v2", "prod").unwrap();
        store.create(FlagRecord::new("other", "staging")).unwrap();

        for version in 1..=3 {
            assert_eq!(
                sub.recv().await,
                Some(Notification::Changed(ChangeEvent::flag("checkout-v2", "prod", version)))
            );
        }

        store.disconnect_subscribers("prod");
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_bulk_import_replaces_environment() {
        let store = InMemoryFlagStore::new();
        store.create(FlagRecord::new("old", "prod")).unwrap();
        store.create(FlagRecord::new("kept", "prod")).unwrap();
        store.create(FlagRecord::new("other", "staging")).unwrap();
        let mut sub = store.subscribe("prod").await.unwrap();

        let imported = store
            .bulk_import(
                "prod",
                vec![FlagRecord::new("kept", "prod"), FlagRecord::new("new", "prod")],
            )
            .unwrap();
        assert_eq!(imported, 2);

        let keys: Vec<String> = store
            .list("prod")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.flag_key)
            .collect();
        assert_eq!(keys, vec!["kept".to_string(), "new".to_string()]);
        assert_eq!(store.get("kept", "prod").await.unwrap().version, 2);
        assert!(store.get("other", "staging").await.is_ok());
        assert_eq!(
            sub.recv().await,
            Some(Notification::Changed(ChangeEvent::environment_flush("prod")))
        );
    }

    #[tokio::test]
    async fn test_malformed_record() {
        let store = InMemoryFlagStore::new();
        store.create(FlagRecord::new("checkout-v2", "prod")).unwrap();
        store.corrupt("checkout-v2", "prod", "rules is not an object");
        assert!(matches!(
            store.get("checkout-v2", "prod").await,
            Err(StoreError::Malformed { .. })
        ));
        assert!(store.list("prod").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable() {
        let store = InMemoryFlagStore::new();
        store.set_available(false);
        let err = store.get("checkout-v2", "prod").await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(store.subscribe("prod").await.is_err());
        assert_eq!(store.fetch_count(), 1);
    }
}
