use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

mod flags;
mod health;
mod sdk;

pub use health::health;
pub use sdk::{EvaluateResponse, FlagState};

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    let sdk_router = Router::new()
        .route("/evaluate", post(sdk::routes::evaluate))
        .route("/evaluate/{flag_key}", post(sdk::routes::evaluate_flag));

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .nest("/sdk", sdk_router)
        .route("/internal/flags/changed", post(flags::changed))
        .layer(CorsLayer::permissive())
}

async fn root() -> &'static str {
    "flagcache evaluation service"
}
