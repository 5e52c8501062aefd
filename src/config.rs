use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::LocalCacheConfig;
use crate::error::ConfigError;
use crate::evaluator::EvaluatorConfig;
use crate::telemetry::LogFormat;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub port: u16,
    /// Postgres store; `None` serves from an in-memory store.
    pub database_url: Option<String>,
    pub local_cache: LocalCacheConfig,
    pub shared_cache_ttl: Duration,
    pub evaluator: EvaluatorConfig,
    /// Environments the invalidation listener subscribes to and warms up.
    pub environments: Vec<String>,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 3000,
            database_url: None,
            local_cache: LocalCacheConfig::default(),
            shared_cache_ttl: Duration::from_secs(300),
            evaluator: EvaluatorConfig::default(),
            environments: vec!["prod".to_string()],
            log_format: LogFormat::Pretty,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenv().is_ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from any variable source; unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let port = parse_or(&lookup, "PORT", defaults.port)?;
        let bind_addr = lookup("BIND_ADDR").unwrap_or(defaults.bind_addr);
        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());

        let local_cache = LocalCacheConfig {
            capacity: parse_or(&lookup, "LOCAL_CACHE_CAPACITY", defaults.local_cache.capacity)?,
            ttl: millis_or(&lookup, "LOCAL_CACHE_TTL_MS", defaults.local_cache.ttl)?,
        };
        if local_cache.capacity == 0 {
            return Err(ConfigError::invalid("LOCAL_CACHE_CAPACITY", "0", "must be at least 1"));
        }

        let shared_cache_ttl = millis_or(&lookup, "SHARED_CACHE_TTL_MS", defaults.shared_cache_ttl)?;
        let evaluator = EvaluatorConfig {
            shared_timeout: millis_or(
                &lookup,
                "SHARED_CACHE_TIMEOUT_MS",
                defaults.evaluator.shared_timeout,
            )?,
            store_timeout: millis_or(&lookup, "STORE_TIMEOUT_MS", defaults.evaluator.store_timeout)?,
        };

        let environments = match lookup("LISTENER_ENVIRONMENTS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            None => defaults.environments,
        };

        let log_format = match lookup("LOG_FORMAT") {
            Some(raw) => raw
                .parse()
                .map_err(|e: String| ConfigError::invalid("LOG_FORMAT", raw, e))?,
            None => defaults.log_format,
        };

        Ok(Self {
            bind_addr,
            port,
            database_url,
            local_cache,
            shared_cache_ttl,
            evaluator,
            environments,
            log_format,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(name, raw, e)),
        None => Ok(default),
    }
}

fn millis_or(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let default_ms = default.as_millis() as u64;
    parse_or(lookup, name, default_ms).map(Duration::from_millis)
}
