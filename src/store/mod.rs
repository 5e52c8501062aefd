//! Durable flag store boundary.
//!
//! The store is the single writer-of-record. The core only reads from it and
//! listens for its change notifications; admin writes happen elsewhere.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use crate::flags::{CacheKey, FlagRecord};

pub use memory::InMemoryFlagStore;
pub use postgres::PgFlagStore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("flag '{flag_key}' not found in environment '{environment}'")]
    NotFound {
        flag_key: String,
        environment: String,
    },

    #[error("flag '{flag_key}' already exists in environment '{environment}'")]
    Conflict {
        flag_key: String,
        environment: String,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed record {key}: {reason}")]
    Malformed { key: CacheKey, reason: String },
}

impl StoreError {
    pub fn not_found(key: &CacheKey) -> Self {
        Self::NotFound {
            flag_key: key.flag_key.clone(),
            environment: key.environment.clone(),
        }
    }

    pub fn malformed(key: &CacheKey, reason: impl Into<String>) -> Self {
        Self::Malformed {
            key: key.clone(),
            reason: reason.into(),
        }
    }

    /// Transport-level failures that should put the evaluator in degraded mode.
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// Change notification published after every committed mutation.
///
/// `flag_key = None` means the whole environment changed (bulk import).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(default)]
    pub flag_key: Option<String>,
    pub environment: String,
    #[serde(default)]
    pub new_version: u64,
}

impl ChangeEvent {
    pub fn flag(flag_key: impl Into<String>, environment: impl Into<String>, new_version: u64) -> Self {
        Self {
            flag_key: Some(flag_key.into()),
            environment: environment.into(),
            new_version,
        }
    }

    pub fn environment_flush(environment: impl Into<String>) -> Self {
        Self {
            flag_key: None,
            environment: environment.into(),
            new_version: 0,
        }
    }
}

/// What a subscription yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Changed(ChangeEvent),
    /// Events were dropped (slow consumer or transport reconnect).
    Gap,
}

enum Feed {
    Broadcast(broadcast::Receiver<ChangeEvent>),
    Channel(mpsc::Receiver<Notification>),
}

/// Receiving end of a store subscription. `recv` returns `None` once the
/// underlying connection is gone.
pub struct Subscription {
    feed: Feed,
}

impl Subscription {
    pub fn from_broadcast(rx: broadcast::Receiver<ChangeEvent>) -> Self {
        Self {
            feed: Feed::Broadcast(rx),
        }
    }

    pub fn from_channel(rx: mpsc::Receiver<Notification>) -> Self {
        Self {
            feed: Feed::Channel(rx),
        }
    }

    pub async fn recv(&mut self) -> Option<Notification> {
        match &mut self.feed {
            Feed::Broadcast(rx) => match rx.recv().await {
                Ok(event) => Some(Notification::Changed(event)),
                Err(broadcast::error::RecvError::Lagged(_)) => Some(Notification::Gap),
                Err(broadcast::error::RecvError::Closed) => None,
            },
            Feed::Channel(rx) => rx.recv().await,
        }
    }
}

#[async_trait]
pub trait FlagStore: Send + Sync {
    /// Fetch one live record. Tombstoned or absent flags are `NotFound`.
    async fn get(&self, flag_key: &str, environment: &str) -> Result<FlagRecord, StoreError>;

    /// All live records of an environment.
    async fn list(&self, environment: &str) -> Result<Vec<FlagRecord>, StoreError>;

    /// Subscribe to change notifications for one environment.
    async fn subscribe(&self, environment: &str) -> Result<Subscription, StoreError>;
}
