pub mod routes;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::evaluation::{Decision, Reason};

#[derive(Debug, Deserialize)]
pub struct EvaluateRequest {
    pub environment: String,
    /// Parsed with `EvaluationContext::from_json` so type errors become `InvalidContext`.
    #[serde(default)]
    pub context: Value,
    /// Flags to evaluate; absent or empty evaluates every flag of the environment.
    #[serde(default)]
    pub flags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct EvaluateFlagRequest {
    pub environment: String,
    #[serde(default)]
    pub context: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EvaluateResponse {
    pub flags: HashMap<String, FlagState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagState {
    pub enabled: bool,
    pub reason: Reason,
}

impl From<Decision> for FlagState {
    fn from(decision: Decision) -> Self {
        Self {
            enabled: decision.enabled,
            reason: decision.reason,
        }
    }
}
