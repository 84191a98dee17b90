//! Health check endpoint.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let persistence = if state.engine.persistence.is_degraded() {
        "degraded"
    } else {
        "ok"
    };
    Json(json!({
        "status": "ok",
        "service": "herald-api",
        "version": env!("CARGO_PKG_VERSION"),
        "persistence": persistence,
        "policy_version": state.engine.policy.current().version,
        "open_follow_ups": state.engine.follow_ups.open_count(),
    }))
}
