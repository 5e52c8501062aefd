//! Feature-flag evaluation with a two-tier cache in front of an authoritative store.
//!
//! Requests resolve a [`flags::FlagRecord`] through the process-local LRU, the
//! shared cache and finally the store, then run it through the resolution chain in
//! [`evaluation`]. Change events from the store evict stale entries so a flag
//! update is visible within the local cache TTL even when notifications are lost.

pub mod cache;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod evaluator;
pub mod flags;
pub mod invalidation;
pub mod routes;
pub mod state;
pub mod store;
pub mod telemetry;

pub use error::EvaluationError;
pub use evaluation::{Decision, EvaluationContext, Reason};
pub use evaluator::{Evaluator, EvaluatorConfig};
pub use flags::{CacheKey, FlagRecord, Override, TargetingRules};
