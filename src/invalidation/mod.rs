//! Pub/sub driven cache invalidation.
//!
//! `InvalidationHandler` applies change events to both cache tiers.
//! `InvalidationListener` keeps a store subscription alive per environment and
//! feeds it into the handler, moving between `Subscribed` and `Disconnected`.

use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{LocalCache, SharedCache, VersionFloors};
use crate::flags::CacheKey;
use crate::store::{ChangeEvent, FlagStore, Notification};

/// Applies change events to the cache tiers.
///
/// Events are compare-and-evict on `source_version`: an entry at or above the
/// event's version survives, so duplicate and reordered deliveries converge.
#[derive(Clone)]
pub struct InvalidationHandler {
    local: Arc<LocalCache>,
    shared: Arc<dyn SharedCache>,
    floors: Arc<VersionFloors>,
    shared_timeout: Duration,
}

impl InvalidationHandler {
    pub fn new(
        local: Arc<LocalCache>,
        shared: Arc<dyn SharedCache>,
        floors: Arc<VersionFloors>,
        shared_timeout: Duration,
    ) -> Self {
        Self {
            local,
            shared,
            floors,
            shared_timeout,
        }
    }

    /// Entry point for a single flag change.
    pub async fn on_flag_changed(&self, flag_key: &str, environment: &str, new_version: u64) {
        let key = CacheKey::new(flag_key, environment);
        self.floors.raise(&key, new_version);

        let evicted_local = self.local.evict_if_older(&key, new_version);

        let evicted_shared = match tokio::time::timeout(
            self.shared_timeout,
            self.shared.evict_if_older(&key, new_version),
        )
        .await
        {
            Ok(Ok(evicted)) => evicted,
            Ok(Err(e)) => {
                warn!(%key, error = %e, "shared cache eviction failed, relying on ttl");
                false
            }
            Err(_) => {
                warn!(%key, timeout = ?self.shared_timeout, "shared cache eviction timed out, relying on ttl");
                false
            }
        };

        debug!(%key, new_version, evicted_local, evicted_shared, "applied flag change");
    }

    pub async fn apply(&self, event: &ChangeEvent) {
        match &event.flag_key {
            Some(flag_key) => {
                self.on_flag_changed(flag_key, &event.environment, event.new_version)
                    .await
            }
            None => self.flush_environment(&event.environment).await,
        }
    }

    /// Drop both tiers for an environment (bulk changes).
    pub async fn flush_environment(&self, environment: &str) {
        let local = self.flush_local(environment);
        match tokio::time::timeout(self.shared_timeout, self.shared.evict_environment(environment))
            .await
        {
            Ok(Ok(shared)) => info!(environment, local, shared, "flushed environment"),
            Ok(Err(e)) => warn!(environment, error = %e, "shared cache flush failed, relying on ttl"),
            Err(_) => warn!(environment, "shared cache flush timed out, relying on ttl"),
        }
    }

    /// Drop the local tier for an environment.
    pub fn flush_local(&self, environment: &str) -> usize {
        self.local.evict_environment(environment)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerState {
    Subscribed,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
        }
    }
}

struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial,
            config,
        }
    }

    fn reset(&mut self) {
        self.current = self.config.initial;
    }

    /// Current delay plus up to 50% jitter; doubles for the next call.
    fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.config.max);

        let jitter_ms = (base.as_millis() as u64) / 2;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        base + Duration::from_millis(jitter)
    }
}

/// Keeps the cache tiers in sync with store change notifications.
///
/// While disconnected nothing blocks: evaluations keep reading the caches and
/// passive TTL expiry bounds staleness. Every (re)subscription flushes the local
/// tier for the environment since events may have been missed in between.
pub struct InvalidationListener {
    store: Arc<dyn FlagStore>,
    handler: InvalidationHandler,
    backoff: BackoffConfig,
    state: watch::Sender<ListenerState>,
}

impl InvalidationListener {
    pub fn new(store: Arc<dyn FlagStore>, handler: InvalidationHandler) -> Self {
        Self::with_backoff(store, handler, BackoffConfig::default())
    }

    pub fn with_backoff(
        store: Arc<dyn FlagStore>,
        handler: InvalidationHandler,
        backoff: BackoffConfig,
    ) -> Self {
        let (state, _) = watch::channel(ListenerState::Disconnected);
        Self {
            store,
            handler,
            backoff,
            state,
        }
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    pub fn handler(&self) -> &InvalidationHandler {
        &self.handler
    }

    fn set_state(&self, next: ListenerState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    pub fn spawn(self: &Arc<Self>, environment: impl Into<String>) -> JoinHandle<()> {
        let listener = self.clone();
        let environment = environment.into();
        tokio::spawn(async move { listener.run(environment).await })
    }

    /// Subscribe and apply events until the task is aborted.
    pub async fn run(&self, environment: String) {
        let mut backoff = Backoff::new(self.backoff.clone());

        loop {
            match self.store.subscribe(&environment).await {
                Ok(mut subscription) => {
                    let flushed = self.handler.flush_local(&environment);
                    self.set_state(ListenerState::Subscribed);
                    backoff.reset();
                    info!(environment = %environment, flushed, "invalidation listener subscribed");

                    while let Some(notification) = subscription.recv().await {
                        match notification {
                            Notification::Changed(event) => self.handler.apply(&event).await,
                            Notification::Gap => {
                                let flushed = self.handler.flush_local(&environment);
                                warn!(environment = %environment, flushed, "missed change events, flushed local cache");
                            }
                        }
                    }

                    self.set_state(ListenerState::Disconnected);
                    warn!(environment = %environment, "invalidation subscription closed");
                }
                Err(e) => {
                    self.set_state(ListenerState::Disconnected);
                    warn!(environment = %environment, error = %e, "invalidation subscribe failed");
                }
            }

            tokio::time::sleep(backoff.next_delay()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheEntry, InMemorySharedCache, LocalCacheConfig};
    use crate::flags::FlagRecord;
    use crate::store::InMemoryFlagStore;
    use chrono::Utc;

    struct Fixture {
        local: Arc<LocalCache>,
        shared: Arc<InMemorySharedCache>,
        floors: Arc<VersionFloors>,
        handler: InvalidationHandler,
    }

    fn fixture() -> Fixture {
        let local = Arc::new(LocalCache::new(LocalCacheConfig::default()));
        let shared = Arc::new(InMemorySharedCache::new(Duration::from_secs(300)));
        let floors = Arc::new(VersionFloors::new());
        let handler = InvalidationHandler::new(
            local.clone(),
            shared.clone(),
            floors.clone(),
            Duration::from_millis(50),
        );
        Fixture {
            local,
            shared,
            floors,
            handler,
        }
    }

    async fn seed(f: &Fixture, flag_key: &str, environment: &str, version: u64) {
        let record = FlagRecord::new(flag_key, environment).with_version(version);
        let key = record.key();
        f.local.put(key.clone(), f.local.entry_for(record.clone(), Utc::now()));
        f.shared
            .put(&key, CacheEntry::new(record, f.shared.ttl(), Utc::now()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_evicts_older_versions() {
        let f = fixture();
        seed(&f, "checkout-v2", "prod", 3).await;
        f.handler.on_flag_changed("checkout-v2", "prod", 4).await;

        let key = CacheKey::new("checkout-v2", "prod");
        assert!(f.local.get(&key).is_none());
        assert!(f.shared.peek(&key).is_none());
        assert_eq!(f.floors.get(&key), 4);
    }

    #[tokio::test]
    async fn test_keeps_current_versions() {
        let f = fixture();
        seed(&f, "checkout-v2", "prod", 5).await;
        f.handler.on_flag_changed("checkout-v2", "prod", 4).await;
        f.handler.on_flag_changed("checkout-v2", "prod", 5).await;

        let key = CacheKey::new("checkout-v2", "prod");
        assert_eq!(f.local.get(&key).unwrap().source_version, 5);
        assert_eq!(f.shared.peek(&key).unwrap().source_version, 5);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_idempotent() {
        let once = fixture();
        let twice = fixture();
        for f in [&once, &twice] {
            seed(f, "a", "prod", 2).await;
            seed(f, "b", "prod", 7).await;
        }

        once.handler.on_flag_changed("a", "prod", 3).await;
        once.handler.on_flag_changed("b", "prod", 3).await;
        for _ in 0..2 {
            twice.handler.on_flag_changed("a", "prod", 3).await;
            twice.handler.on_flag_changed("b", "prod", 3).await;
        }

        for key in [CacheKey::new("a", "prod"), CacheKey::new("b", "prod")] {
            assert_eq!(
                once.local.get(&key).map(|e| e.source_version),
                twice.local.get(&key).map(|e| e.source_version)
            );
            assert_eq!(
                once.shared.peek(&key).map(|e| e.source_version),
                twice.shared.peek(&key).map(|e| e.source_version)
            );
            assert_eq!(once.floors.get(&key), twice.floors.get(&key));
        }
    }

    #[tokio::test]
    async fn test_shared_outage_does_not_block() {
        let f = fixture();
        seed(&f, "checkout-v2", "prod", 1).await;
        f.shared.set_available(false);
        f.handler.on_flag_changed("checkout-v2", "prod", 2).await;
        assert!(f.local.get(&CacheKey::new("checkout-v2", "prod")).is_none());
    }

    #[tokio::test]
    async fn test_environment_flush_event() {
        let f = fixture();
        seed(&f, "a", "prod", 1).await;
        seed(&f, "a", "staging", 1).await;
        f.handler.apply(&ChangeEvent::environment_flush("prod")).await;
        assert!(f.local.get(&CacheKey::new("a", "prod")).is_none());
        assert!(f.shared.peek(&CacheKey::new("a", "prod")).is_none());
        assert!(f.local.get(&CacheKey::new("a", "staging")).is_some());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(400),
        });
        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
        let second = backoff.next_delay();
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(300));
        backoff.next_delay();
        let capped = backoff.next_delay();
        assert!(capped >= Duration::from_millis(400) && capped <= Duration::from_millis(600));
        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_millis(150));
    }

    async fn wait_for(rx: &mut watch::Receiver<ListenerState>, state: ListenerState) {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .expect("state transition timed out")
            .expect("listener dropped");
    }

    #[tokio::test]
    async fn test_listener_applies_store_events() {
        let f = fixture();
        let store = Arc::new(InMemoryFlagStore::new());
        let listener = Arc::new(InvalidationListener::new(store.clone(), f.handler.clone()));
        let mut state = listener.watch_state();
        let task = listener.spawn("prod");
        wait_for(&mut state, ListenerState::Subscribed).await;

        let created = store.create(FlagRecord::new("checkout-v2", "prod")).unwrap();
        seed(&f, "checkout-v2", "prod", created.version).await;
        store.update("checkout-v2", "prod", |r| r.enabled = true).unwrap();

        let key = CacheKey::new("checkout-v2", "prod");
        tokio::time::timeout(Duration::from_secs(5), async {
            while f.local.get(&key).is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("local entry was never evicted");
        assert_eq!(f.floors.get(&key), 2);

        task.abort();
    }

    #[tokio::test]
    async fn test_listener_reconnects_and_flushes() {
        let f = fixture();
        let store = Arc::new(InMemoryFlagStore::new());
        let listener = Arc::new(InvalidationListener::with_backoff(
            store.clone(),
            f.handler.clone(),
            BackoffConfig {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(20),
            },
        ));
        let mut state = listener.watch_state();
        let task = listener.spawn("prod");
        wait_for(&mut state, ListenerState::Subscribed).await;

        store.set_available(false);
        store.disconnect_subscribers("prod");
        wait_for(&mut state, ListenerState::Disconnected).await;
        assert_eq!(listener.state(), ListenerState::Disconnected);

        // written while disconnected: no event will ever arrive for it
        seed(&f, "stale", "prod", 1).await;
        seed(&f, "stale", "staging", 1).await;

        store.set_available(true);
        wait_for(&mut state, ListenerState::Subscribed).await;
        assert!(f.local.get(&CacheKey::new("stale", "prod")).is_none());
        assert!(f.local.get(&CacheKey::new("stale", "staging")).is_some());

        task.abort();
    }

    #[tokio::test]
    async fn test_listener_flushes_after_missed_events() {
        let f = fixture();
        let store = Arc::new(InMemoryFlagStore::new());
        let listener = Arc::new(InvalidationListener::new(store.clone(), f.handler.clone()));
        let mut state = listener.watch_state();
        let task = listener.spawn("prod");
        wait_for(&mut state, ListenerState::Subscribed).await;

        // no event will ever name this flag, only a flush removes it
        let steady = store.create(FlagRecord::new("steady", "prod")).unwrap();
        seed(&f, "steady", "prod", steady.version).await;
        seed(&f, "steady", "staging", steady.version).await;

        // the listener task cannot run in between, so its receiver lags
        store.create(FlagRecord::new("churn", "prod")).unwrap();
        for _ in 0..crate::store::memory::CHANNEL_CAPACITY + 16 {
            store.update("churn", "prod", |r| r.enabled = !r.enabled).unwrap();
        }

        let key = CacheKey::new("steady", "prod");
        tokio::time::timeout(Duration::from_secs(5), async {
            while f.local.get(&key).is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("local tier was never flushed after the gap");

        assert!(f.local.get(&CacheKey::new("steady", "staging")).is_some());
        assert_eq!(listener.state(), ListenerState::Subscribed);

        task.abort();
    }
}
