//! Channel health snapshot.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use herald_common::types::ChannelHealth;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/channels/health", get(channel_health))
}

async fn channel_health(State(state): State<AppState>) -> Json<Vec<ChannelHealth>> {
    Json(state.engine.health.snapshot())
}
