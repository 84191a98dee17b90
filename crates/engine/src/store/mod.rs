//! Persistence contract for requests, attempts, responses, follow-ups,
//! reports and automation rules.
//!
//! Writes of history records are append-only and idempotent per id; only
//! request status, follow-up tasks and rules are updated in place.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{
    AutomationRule, FollowUpStatus, FollowUpTask, NotificationAttempt, NotificationRequest,
    PerformanceReport, RequestStatus, ResponseEvent,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Database(e) => AppError::Database(e),
            StoreError::Redis(e) => AppError::Redis(e),
            other => AppError::Storage(other.to_string()),
        }
    }
}

/// Tracks whether the last persistence write failed.
///
/// While degraded the engine keeps running on in-memory state and marks
/// generated reports as provisional.
#[derive(Debug, Default)]
pub struct PersistenceHealth {
    degraded: AtomicBool,
}

impl PersistenceHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn record_failure(&self, operation: &str, err: &StoreError) {
        let was = self.degraded.swap(true, Ordering::SeqCst);
        if was {
            tracing::debug!(operation, error = %err, "Persistence still unavailable");
        } else {
            tracing::warn!(operation, error = %err, "Persistence unavailable, running degraded");
        }
    }

    pub fn record_success(&self) {
        if self.degraded.swap(false, Ordering::SeqCst) {
            tracing::info!("Persistence recovered");
        }
    }

    /// Pass a result through, noting success or failure.
    pub fn observe<T>(&self, operation: &str, result: Result<T, StoreError>) -> Option<T> {
        match result {
            Ok(value) => {
                self.record_success();
                Some(value)
            }
            Err(err) => {
                self.record_failure(operation, &err);
                None
            }
        }
    }
}

/// A request that has not reached a terminal status.
#[derive(Debug, Clone, PartialEq)]
pub struct UnfinishedRequest {
    pub request: NotificationRequest,
    pub status: RequestStatus,
    /// When a deferred request may be dispatched again.
    pub retry_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a request; a request id already present is left untouched.
    async fn insert_request(&self, request: &NotificationRequest) -> Result<(), StoreError>;
    async fn get_request(&self, id: Uuid) -> Result<Option<NotificationRequest>, StoreError>;
    /// Set a request's status, clearing any retry time.
    async fn set_request_status(&self, id: Uuid, status: RequestStatus)
    -> Result<(), StoreError>;
    /// Mark a request deferred until `retry_at`.
    async fn defer_request(&self, id: Uuid, retry_at: DateTime<Utc>) -> Result<(), StoreError>;
    async fn request_status(&self, id: Uuid) -> Result<Option<RequestStatus>, StoreError>;
    /// Requests still pending or deferred, oldest first.
    async fn unfinished_requests(&self) -> Result<Vec<UnfinishedRequest>, StoreError>;

    /// Append a terminal attempt. Returns `false` when the id was already stored.
    async fn insert_attempt(&self, attempt: &NotificationAttempt) -> Result<bool, StoreError>;
    async fn get_attempt(&self, id: Uuid) -> Result<Option<NotificationAttempt>, StoreError>;
    /// Attempts of one request ordered by attempt number.
    async fn attempts_for_request(
        &self,
        request_id: Uuid,
    ) -> Result<Vec<NotificationAttempt>, StoreError>;
    async fn attempts_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<NotificationAttempt>, StoreError>;
    async fn attempts_for_recipient(
        &self,
        recipient_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<NotificationAttempt>, StoreError>;

    async fn insert_response(&self, response: &ResponseEvent) -> Result<(), StoreError>;
    async fn responses_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ResponseEvent>, StoreError>;

    /// Insert or overwrite a follow-up task.
    async fn save_follow_up(&self, task: &FollowUpTask) -> Result<(), StoreError>;
    async fn get_follow_up(&self, id: Uuid) -> Result<Option<FollowUpTask>, StoreError>;
    async fn follow_ups(
        &self,
        status: Option<FollowUpStatus>,
    ) -> Result<Vec<FollowUpTask>, StoreError>;
    /// Tasks not yet in a terminal state.
    async fn open_follow_ups(&self) -> Result<Vec<FollowUpTask>, StoreError>;

    async fn insert_report(&self, report: &PerformanceReport) -> Result<(), StoreError>;
    /// Newest first.
    async fn list_reports(&self, limit: usize) -> Result<Vec<PerformanceReport>, StoreError>;

    async fn insert_rule(&self, rule: &AutomationRule) -> Result<(), StoreError>;
    /// Returns `false` when no rule with that id exists.
    async fn update_rule(&self, rule: &AutomationRule) -> Result<bool, StoreError>;
    async fn delete_rule(&self, id: Uuid) -> Result<bool, StoreError>;
    async fn get_rule(&self, id: Uuid) -> Result<Option<AutomationRule>, StoreError>;
    async fn list_rules(&self) -> Result<Vec<AutomationRule>, StoreError>;
}
