use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::evaluator::StatsSnapshot;
use crate::invalidation::ListenerState;
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthData {
    status: u16,
    listeners: BTreeMap<String, ListenerState>,
    stats: StatsSnapshot,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthData> {
    let listeners = state
        .listeners
        .iter()
        .map(|(environment, listener)| (environment.clone(), listener.state()))
        .collect();

    let health_data = HealthData {
        status: StatusCode::OK.as_u16(),
        listeners,
        stats: state.evaluator.stats(),
    };
    Json(health_data)
}
