//! Recipient preference routes: channel opt-outs and quiet hours.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use herald_common::error::AppError;
use herald_common::types::{Channel, DoNotDisturb, RecipientPreferences};
use herald_engine::clock::Clock;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route(
        "/api/recipients/{id}/preferences",
        get(get_preferences).put(put_preferences),
    )
}

#[derive(Debug, Deserialize)]
pub struct PreferencesBody {
    #[serde(default)]
    pub opted_out: Vec<Channel>,
    #[serde(default)]
    pub do_not_disturb: Option<DoNotDisturb>,
}

/// GET /api/recipients/{id}/preferences
async fn get_preferences(
    State(state): State<AppState>,
    Path(recipient_id): Path<String>,
) -> Result<Json<RecipientPreferences>, AppError> {
    state
        .engine
        .preferences(&recipient_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("No preferences for {}", recipient_id)))
}

/// PUT /api/recipients/{id}/preferences: replace the stored preferences.
async fn put_preferences(
    State(state): State<AppState>,
    Path(recipient_id): Path<String>,
    Json(body): Json<PreferencesBody>,
) -> Result<Json<RecipientPreferences>, AppError> {
    let mut preferences = RecipientPreferences::new(recipient_id, state.engine.clock.now());
    preferences.opted_out = body.opted_out;
    preferences.do_not_disturb = body.do_not_disturb;
    Ok(Json(state.engine.save_preferences(preferences).await?))
}
