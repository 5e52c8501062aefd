use axum::{extract::State, http::StatusCode, Json};
use tracing::{debug, warn};

use crate::error::ErrorBody;
use crate::flags::{validate_environment_key, validate_flag_key};
use crate::state::AppState;
use crate::store::ChangeEvent;

/// Change hook for the admin service's pub/sub bridge.
///
/// Body: `{"flag_key": "...", "environment": "...", "new_version": N}`; omitting
/// `flag_key` flushes the whole environment. Events naming keys the store would
/// never accept are rejected with 400 before they touch the caches.
pub async fn changed(
    State(state): State<AppState>,
    Json(event): Json<ChangeEvent>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    if let Err(reason) = validate_event(&event) {
        warn!(?event, %reason, "rejected change event");
        let body = ErrorBody {
            error: reason,
            kind: "invalid_event",
        };
        return Err((StatusCode::BAD_REQUEST, Json(body)));
    }

    debug!(?event, "flag change received over http");
    state.evaluator.invalidation_handler().apply(&event).await;
    Ok(StatusCode::NO_CONTENT)
}

fn validate_event(event: &ChangeEvent) -> Result<(), String> {
    validate_environment_key(&event.environment)?;
    if let Some(flag_key) = &event.flag_key {
        validate_flag_key(flag_key)?;
        if event.new_version == 0 {
            return Err("new_version must be positive".to_string());
        }
    }
    Ok(())
}
