//! Automation rule CRUD routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::AutomationRule;
use herald_engine::rule_service::{CreateRuleParams, UpdateRuleParams};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/rules", get(list_rules).post(create_rule))
        .route(
            "/api/rules/{id}",
            get(get_rule).patch(update_rule).delete(delete_rule),
        )
        .route("/api/rules/{id}/toggle", post(toggle_rule))
}

/// POST /api/rules: create a rule. It takes effect on the next evaluation pass.
async fn create_rule(
    State(state): State<AppState>,
    Json(params): Json<CreateRuleParams>,
) -> Result<(StatusCode, Json<AutomationRule>), AppError> {
    let rule = state.engine.rule_service.create(params).await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

/// GET /api/rules
async fn list_rules(State(state): State<AppState>) -> Result<Json<Vec<AutomationRule>>, AppError> {
    Ok(Json(state.engine.rule_service.list().await?))
}

/// GET /api/rules/{id}
async fn get_rule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<AutomationRule>, AppError> {
    Ok(Json(state.engine.rule_service.get(id).await?))
}

/// PATCH /api/rules/{id}: absent fields keep their value.
async fn update_rule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(params): Json<UpdateRuleParams>,
) -> Result<Json<AutomationRule>, AppError> {
    Ok(Json(state.engine.rule_service.update(id, params).await?))
}

/// POST /api/rules/{id}/toggle: flip the active flag.
async fn toggle_rule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<AutomationRule>, AppError> {
    Ok(Json(state.engine.rule_service.toggle(id).await?))
}

/// DELETE /api/rules/{id}
async fn delete_rule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    if state.engine.rule_service.delete(id).await? {
        Ok(Json(serde_json::json!({"deleted": true})))
    } else {
        Err(AppError::NotFound(format!("Rule {} not found", id)))
    }
}
