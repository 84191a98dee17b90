//! Follow-up task queries.

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use herald_common::types::{FollowUpStatus, FollowUpTask};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/follow-ups", get(list_follow_ups))
}

#[derive(Debug, Deserialize)]
pub struct FollowUpQuery {
    pub status: Option<FollowUpStatus>,
}

/// GET /api/follow-ups?status=exhausted
async fn list_follow_ups(
    State(state): State<AppState>,
    Query(query): Query<FollowUpQuery>,
) -> Json<Vec<FollowUpTask>> {
    Json(state.engine.follow_ups.list(query.status).await)
}
