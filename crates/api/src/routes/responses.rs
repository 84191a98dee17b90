//! Recipient response intake.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{ResponseEvent, ResponseType};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/responses", post(record_response))
}

#[derive(Debug, Deserialize)]
pub struct ResponseBody {
    pub attempt_id: Uuid,
    pub response_type: ResponseType,
    /// Defaults to the time the response is received.
    #[serde(default)]
    pub responded_at: Option<DateTime<Utc>>,
}

/// POST /api/responses: record a read, click, dismiss or ignore.
async fn record_response(
    State(state): State<AppState>,
    Json(body): Json<ResponseBody>,
) -> Result<Json<ResponseEvent>, AppError> {
    let response = state
        .engine
        .record_response(body.attempt_id, body.response_type, body.responded_at)
        .await?;
    Ok(Json(response))
}
