use axum::{
    extract::{Path, State},
    Json,
};

use super::{EvaluateFlagRequest, EvaluateRequest, EvaluateResponse, FlagState};
use crate::error::EvaluationError;
use crate::evaluation::EvaluationContext;
use crate::state::AppState;

/// Evaluate a batch of flags (or every flag) of an environment for one context
pub async fn evaluate(
    State(state): State<AppState>,
    Json(request): Json<EvaluateRequest>,
) -> Result<Json<EvaluateResponse>, EvaluationError> {
    let context = EvaluationContext::from_json(&request.context)?;

    let decisions = match request.flags {
        Some(keys) if !keys.is_empty() => {
            state
                .evaluator
                .evaluate_batch(&request.environment, &context, &keys)
                .await?
        }
        _ => {
            state
                .evaluator
                .evaluate_all(&request.environment, &context)
                .await?
        }
    };

    let flags = decisions
        .into_iter()
        .map(|(key, decision)| (key, FlagState::from(decision)))
        .collect();

    Ok(Json(EvaluateResponse { flags }))
}

/// Evaluate a single flag
pub async fn evaluate_flag(
    State(state): State<AppState>,
    Path(flag_key): Path<String>,
    Json(request): Json<EvaluateFlagRequest>,
) -> Result<Json<FlagState>, EvaluationError> {
    let context = EvaluationContext::from_json(&request.context)?;
    let decision = state
        .evaluator
        .evaluate(&flag_key, &request.environment, &context)
        .await?;

    Ok(Json(decision.into()))
}
