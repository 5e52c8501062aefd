use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

use flagcache::cache::{InMemorySharedCache, LocalCache, SharedCache};
use flagcache::config::Config;
use flagcache::evaluator::Evaluator;
use flagcache::invalidation::InvalidationListener;
use flagcache::routes;
use flagcache::state::AppState;
use flagcache::store::{FlagStore, InMemoryFlagStore, PgFlagStore};
use flagcache::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid configuration")?;
    telemetry::init(config.log_format);

    let store = connect_store(&config).await?;
    let local = Arc::new(LocalCache::new(config.local_cache.clone()));
    let shared: Arc<dyn SharedCache> = Arc::new(InMemorySharedCache::new(config.shared_cache_ttl));
    let evaluator = Arc::new(Evaluator::new(
        store.clone(),
        local,
        shared,
        config.evaluator.clone(),
    ));

    let mut listeners = BTreeMap::new();
    for environment in &config.environments {
        let listener = Arc::new(InvalidationListener::new(
            store.clone(),
            evaluator.invalidation_handler(),
        ));
        listener.spawn(environment.clone());
        listeners.insert(environment.clone(), listener);

        match evaluator.warm_up(environment).await {
            Ok(count) => info!(environment = %environment, count, "cache warmed"),
            Err(e) => warn!(environment = %environment, error = %e, "warm-up failed, serving cold"),
        }
    }

    let state = AppState::new(evaluator).with_listeners(listeners);
    let app = routes::routes().with_state(state);

    let listener = tokio::net::TcpListener::bind(config.addr())
        .await
        .with_context(|| format!("cannot bind {}", config.addr()))?;

    info!(addr = %config.addr(), "flagcache listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

async fn connect_store(config: &Config) -> anyhow::Result<Arc<dyn FlagStore>> {
    let Some(url) = config.database_url.as_deref() else {
        warn!("DATABASE_URL not set, using an empty in-memory store");
        return Ok(Arc::new(InMemoryFlagStore::new()));
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(url)
        .await
        .context("error connecting to the flag database")?;

    let store = PgFlagStore::new(pool);
    store.migrate().await.context("migrations failed")?;
    Ok(Arc::new(store))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl_c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
