//! Notification intake: queued and synchronous dispatch.

use std::collections::HashMap;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use herald_common::error::AppError;
use herald_common::types::{Channel, NotificationRequest, Priority};
use herald_engine::dispatch::DispatchOutcome;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/notifications", post(enqueue_notification))
        .route("/api/notifications/dispatch", post(dispatch_notification))
}

#[derive(Debug, Deserialize)]
pub struct NotificationBody {
    pub recipient_id: String,
    pub template_id: String,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    pub priority: Priority,
    pub channels: Vec<Channel>,
}

impl NotificationBody {
    fn into_request(self) -> Result<NotificationRequest, AppError> {
        if self.recipient_id.trim().is_empty() {
            return Err(AppError::Validation("recipient_id must not be empty".into()));
        }
        let mut request = NotificationRequest::new(
            self.recipient_id,
            self.template_id,
            self.priority,
            self.channels,
        );
        request.variables = self.variables;
        Ok(request)
    }
}

/// POST /api/notifications: queue a request for the dispatch workers.
async fn enqueue_notification(
    State(state): State<AppState>,
    Json(body): Json<NotificationBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let id = state.engine.submit(body.into_request()?).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "id": id }))))
}

/// POST /api/notifications/dispatch: dispatch now and report the outcome.
async fn dispatch_notification(
    State(state): State<AppState>,
    Json(body): Json<NotificationBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let request = body.into_request()?;
    let outcome = state.engine.dispatch(&request).await?;

    let body = match outcome {
        DispatchOutcome::Delivered { attempt, follow_up } => json!({
            "request_id": request.id,
            "status": "delivered",
            "attempt": attempt,
            "follow_up_id": follow_up,
        }),
        DispatchOutcome::Deferred { retry_at } => json!({
            "request_id": request.id,
            "status": "deferred",
            "retry_at": retry_at,
        }),
    };
    Ok(Json(body))
}
