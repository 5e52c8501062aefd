//! Errors surfaced outside the evaluation core.
//!
//! Store and cache failures are recovered inside the evaluator and never reach
//! callers; the only caller-visible evaluation error is a malformed request.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Errors returned by the evaluation API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvaluationError {
    /// The request could not be evaluated because its context or keys are malformed.
    #[error("invalid evaluation context: {0}")]
    InvalidContext(String),
}

impl EvaluationError {
    pub fn invalid_context(reason: impl Into<String>) -> Self {
        Self::InvalidContext(reason.into())
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidContext(_) => "invalid_context",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: &'static str,
}

impl IntoResponse for EvaluationError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.to_string(),
            kind: self.kind(),
        };
        (StatusCode::BAD_REQUEST, Json(body)).into_response()
    }
}

/// Startup configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    pub fn invalid(name: &'static str, value: impl Into<String>, reason: impl ToString) -> Self {
        Self::Invalid {
            name,
            value: value.into(),
            reason: reason.to_string(),
        }
    }
}
