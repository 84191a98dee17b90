//! Performance report routes.

use axum::extract::{Query, State};
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use herald_common::error::AppError;
use herald_common::types::PerformanceReport;
use herald_engine::clock::{Clock, seconds};

use crate::state::AppState;

const DEFAULT_LIMIT: usize = 20;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/reports", post(generate_report).get(list_reports))
}

/// Period bounds; a missing end is "now" and a missing start is one
/// configured report period before the end.
#[derive(Debug, Default, Deserialize)]
pub struct ReportBody {
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
}

/// POST /api/reports: generate a report for `[start, end)`.
async fn generate_report(
    State(state): State<AppState>,
    Json(body): Json<ReportBody>,
) -> Result<Json<PerformanceReport>, AppError> {
    let end = body.end.unwrap_or_else(|| state.engine.clock.now());
    let start = match body.start {
        Some(start) => start,
        None => seconds(state.config.analytics.report_period_secs)
            .and_then(|period| end.checked_sub_signed(period))
            .ok_or_else(|| AppError::Validation("report period is out of range".to_string()))?,
    };

    let report = state.engine.analytics.generate_report(start, end).await?;
    Ok(Json(report))
}

/// GET /api/reports?limit=: newest first.
async fn list_reports(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<PerformanceReport>>, AppError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
    Ok(Json(state.engine.analytics.reports(limit).await?))
}
