//! The public evaluation entry point.
//!
//! Resolution walks the cache chain (local, then shared, then store), keeps the
//! higher version when the tiers disagree, writes through on a store fetch and
//! fails closed when nothing can be resolved. Only malformed requests surface as
//! errors; every internal failure becomes a default decision.

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::cache::{CacheEntry, LocalCache, SharedCache, VersionFloors};
use crate::error::EvaluationError;
use crate::evaluation::{evaluate_record, Decision, EvaluationContext};
use crate::flags::{CacheKey, FlagRecord};
use crate::invalidation::InvalidationHandler;
use crate::store::{FlagStore, StoreError};

/// Store reads per resolve when the first one comes back below the version floor.
const STORE_FETCH_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    pub shared_timeout: Duration,
    pub store_timeout: Duration,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            shared_timeout: Duration::from_millis(50),
            store_timeout: Duration::from_millis(200),
        }
    }
}

/// Outcome of resolving a record through the cache chain.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Found(FlagRecord),
    NotFound,
    Unavailable,
}

#[derive(Debug, Default)]
pub struct EvaluatorStats {
    local_hits: AtomicU64,
    shared_hits: AtomicU64,
    store_fetches: AtomicU64,
    store_failures: AtomicU64,
    version_skews: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub local_hits: u64,
    pub shared_hits: u64,
    pub store_fetches: u64,
    pub store_failures: u64,
    pub version_skews: u64,
}

impl EvaluatorStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            local_hits: self.local_hits.load(Ordering::Relaxed),
            shared_hits: self.shared_hits.load(Ordering::Relaxed),
            store_fetches: self.store_fetches.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            version_skews: self.version_skews.load(Ordering::Relaxed),
        }
    }
}

fn validate_identifier(kind: &str, value: &str) -> Result<(), EvaluationError> {
    if value.is_empty() {
        return Err(EvaluationError::invalid_context(format!("{} cannot be empty", kind)));
    }
    if !value.is_ascii() || value.chars().any(|c| c.is_ascii_control()) {
        return Err(EvaluationError::invalid_context(format!(
            "{} must be printable ASCII",
            kind
        )));
    }
    Ok(())
}

/// Flag evaluator over explicit cache tiers and a store.
///
/// Instances share nothing implicitly; several can live in one process.
pub struct Evaluator {
    store: Arc<dyn FlagStore>,
    local: Arc<LocalCache>,
    shared: Arc<dyn SharedCache>,
    floors: Arc<VersionFloors>,
    config: EvaluatorConfig,
    stats: EvaluatorStats,
}

impl Evaluator {
    pub fn new(
        store: Arc<dyn FlagStore>,
        local: Arc<LocalCache>,
        shared: Arc<dyn SharedCache>,
        config: EvaluatorConfig,
    ) -> Self {
        Self {
            store,
            local,
            shared,
            floors: Arc::new(VersionFloors::new()),
            config,
            stats: EvaluatorStats::default(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// A handler evicting from this evaluator's own tiers, for the listener.
    pub fn invalidation_handler(&self) -> InvalidationHandler {
        InvalidationHandler::new(
            self.local.clone(),
            self.shared.clone(),
            self.floors.clone(),
            self.config.shared_timeout,
        )
    }

    /// Admin mutation hook: a flag changed to `new_version` in the store.
    pub async fn on_flag_changed(&self, flag_key: &str, environment: &str, new_version: u64) {
        self.invalidation_handler()
            .on_flag_changed(flag_key, environment, new_version)
            .await
    }

    /// Evaluate one flag for one request.
    #[instrument(skip_all, fields(flag_key = %flag_key, environment = %environment))]
    pub async fn evaluate(
        &self,
        flag_key: &str,
        environment: &str,
        context: &EvaluationContext,
    ) -> Result<Decision, EvaluationError> {
        validate_identifier("flag key", flag_key)?;
        validate_identifier("environment", environment)?;
        context.validate()?;

        Ok(self.decide(&CacheKey::new(flag_key, environment), context).await)
    }

    /// Evaluate several flags for one request. A failure on one flag never fails
    /// the batch; only a malformed context or environment does.
    #[instrument(skip_all, fields(environment = %environment))]
    pub async fn evaluate_batch<S: AsRef<str>>(
        &self,
        environment: &str,
        context: &EvaluationContext,
        flag_keys: &[S],
    ) -> Result<HashMap<String, Decision>, EvaluationError> {
        validate_identifier("environment", environment)?;
        context.validate()?;

        let decisions = join_all(flag_keys.iter().map(|flag_key| async move {
            let flag_key = flag_key.as_ref();
            let decision = match validate_identifier("flag key", flag_key) {
                Ok(()) => self.decide(&CacheKey::new(flag_key, environment), context).await,
                Err(_) => Decision::not_found(),
            };
            (flag_key.to_string(), decision)
        }))
        .await;

        Ok(decisions.into_iter().collect())
    }

    /// Evaluate every flag the store lists for an environment.
    pub async fn evaluate_all(
        &self,
        environment: &str,
        context: &EvaluationContext,
    ) -> Result<HashMap<String, Decision>, EvaluationError> {
        validate_identifier("environment", environment)?;
        context.validate()?;

        let keys: Vec<String> = match self.list_records(environment).await {
            Ok(records) => records.into_iter().map(|r| r.flag_key).collect(),
            Err(e) => {
                warn!(environment, error = %e, degraded = true, "cannot list flags");
                return Ok(HashMap::new());
            }
        };
        self.evaluate_batch(environment, context, &keys).await
    }

    /// Preload both tiers from `store.list`. Returns how many records were cached.
    pub async fn warm_up(&self, environment: &str) -> Result<usize, StoreError> {
        let records = self.list_records(environment).await?;
        let now = Utc::now();
        for record in &records {
            let key = record.key();
            self.floors.raise(&key, record.version);
            self.local.put(key.clone(), self.local.entry_for(record.clone(), now));
            self.put_shared(&key, record.clone()).await;
        }
        Ok(records.len())
    }

    async fn list_records(&self, environment: &str) -> Result<Vec<FlagRecord>, StoreError> {
        match tokio::time::timeout(self.config.store_timeout, self.store.list(environment)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.config.store_timeout)),
        }
    }

    async fn decide(&self, key: &CacheKey, context: &EvaluationContext) -> Decision {
        match self.resolve(key).await {
            Resolution::Found(record) => evaluate_record(&record, context, Utc::now()),
            Resolution::NotFound => Decision::not_found(),
            Resolution::Unavailable => Decision::store_unavailable(),
        }
    }

    /// Resolve the freshest record available for `key`.
    ///
    /// Entries below the version floor (the highest version this process has seen
    /// for the key) are treated as absent. When both tiers hold an entry the higher
    /// version wins and the losing tier is overwritten.
    pub async fn resolve(&self, key: &CacheKey) -> Resolution {
        let floor = self.floors.get(key);
        let now = Utc::now();

        let local = match self.local.get_at(key, now) {
            Some(entry) if entry.source_version < floor => {
                self.local.evict_if_older(key, floor);
                None
            }
            other => other,
        };
        let shared = self.get_shared(key).await.filter(|e| e.source_version >= floor);

        let record = match (local, shared) {
            (Some(local), Some(shared)) => {
                EvaluatorStats::bump(&self.stats.local_hits);
                if shared.source_version > local.source_version {
                    EvaluatorStats::bump(&self.stats.version_skews);
                    debug!(%key, local = local.source_version, shared = shared.source_version, "local tier behind shared");
                    self.local.put(key.clone(), self.local.entry_for(shared.record.clone(), now));
                    shared.record
                } else if local.source_version > shared.source_version {
                    EvaluatorStats::bump(&self.stats.version_skews);
                    debug!(%key, local = local.source_version, shared = shared.source_version, "shared tier behind local");
                    self.put_shared(key, local.record.clone()).await;
                    local.record
                } else {
                    local.record
                }
            }
            (Some(local), None) => {
                EvaluatorStats::bump(&self.stats.local_hits);
                local.record
            }
            (None, Some(shared)) => {
                EvaluatorStats::bump(&self.stats.shared_hits);
                debug!(%key, version = shared.source_version, "shared cache hit");
                self.local.put(key.clone(), self.local.entry_for(shared.record.clone(), now));
                shared.record
            }
            (None, None) => return self.fetch_from_store(key).await,
        };

        self.floors.raise(key, record.version);
        Resolution::Found(record)
    }

    /// Fetch from the store and write through to both tiers.
    ///
    /// A record below the version floor was read before an invalidation this
    /// process already applied. It is never returned or cached; the fetch is
    /// retried within the same timeout budget and fails closed if still stale.
    async fn fetch_from_store(&self, key: &CacheKey) -> Resolution {
        EvaluatorStats::bump(&self.stats.store_fetches);
        let deadline = Instant::now() + self.config.store_timeout;

        for attempt in 1..=STORE_FETCH_ATTEMPTS {
            let fetched = match tokio::time::timeout_at(
                deadline,
                self.store.get(&key.flag_key, &key.environment),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout(self.config.store_timeout)),
            };

            let record = match fetched {
                Ok(record) => record,
                Err(StoreError::NotFound { .. }) => {
                    debug!(%key, "flag not found");
                    return Resolution::NotFound;
                }
                Err(e @ StoreError::Malformed { .. }) => {
                    warn!(%key, error = %e, "malformed flag record treated as not found");
                    return Resolution::NotFound;
                }
                Err(e) => {
                    EvaluatorStats::bump(&self.stats.store_failures);
                    warn!(%key, error = %e, degraded = true, "store unavailable, failing closed");
                    return Resolution::Unavailable;
                }
            };

            let floor = self.floors.get(key);
            if record.version < floor {
                debug!(%key, version = record.version, floor, attempt, "store returned a version older than one already applied");
                continue;
            }

            // write-through: only reached once the fetch completed
            self.floors.raise(key, record.version);
            self.local
                .put(key.clone(), self.local.entry_for(record.clone(), Utc::now()));
            self.put_shared(key, record.clone()).await;
            debug!(%key, version = record.version, "populated caches from store");
            return Resolution::Found(record);
        }

        EvaluatorStats::bump(&self.stats.store_failures);
        warn!(%key, degraded = true, "store keeps returning a stale version, failing closed");
        Resolution::Unavailable
    }

    async fn get_shared(&self, key: &CacheKey) -> Option<CacheEntry> {
        match tokio::time::timeout(self.config.shared_timeout, self.shared.get(key)).await {
            Ok(Ok(entry)) => entry,
            Ok(Err(e)) => {
                warn!(%key, error = %e, "shared cache read failed");
                None
            }
            Err(_) => {
                warn!(%key, timeout = ?self.config.shared_timeout, "shared cache read timed out");
                None
            }
        }
    }

    async fn put_shared(&self, key: &CacheKey, record: FlagRecord) {
        let entry = CacheEntry::new(record, self.shared.ttl(), Utc::now());
        match tokio::time::timeout(self.config.shared_timeout, self.shared.put(key, entry)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%key, error = %e, "shared cache write failed"),
            Err(_) => warn!(%key, "shared cache write timed out"),
        }
    }
}
