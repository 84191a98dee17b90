use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use herald_common::types::{
    AttemptStatus, AutomationRule, Channel, DoNotDisturb, FailureKind, FollowUpStatus,
    FollowUpTask, NotificationAttempt, NotificationRequest, PerformanceReport, Priority,
    RecipientPreferences, RequestStatus, ResponseEvent, ResponseType, RuleAction, RuleCondition,
    RuleType,
};

use super::{Store, StoreError, UnfinishedRequest};
use crate::directory::AddressBook;
use crate::preferences::PreferenceStore;

/// PostgreSQL-backed store. Schema lives in `migrations/`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Register or replace a recipient's address on a channel.
    pub async fn upsert_address(
        &self,
        recipient_id: &str,
        channel: Channel,
        address: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO recipient_addresses (recipient_id, channel, address)
            VALUES ($1, $2, $3)
            ON CONFLICT (recipient_id, channel) DO UPDATE SET address = EXCLUDED.address
            "#,
        )
        .bind(recipient_id)
        .bind(channel)
        .bind(address)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct RequestRow {
    id: Uuid,
    recipient_id: String,
    template_id: String,
    variables: Json<HashMap<String, String>>,
    priority: Priority,
    channels: Json<Vec<Channel>>,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct UnfinishedRow {
    #[sqlx(flatten)]
    request: RequestRow,
    status: RequestStatus,
    retry_at: Option<DateTime<Utc>>,
}

impl From<UnfinishedRow> for UnfinishedRequest {
    fn from(row: UnfinishedRow) -> Self {
        Self {
            request: row.request.into(),
            status: row.status,
            retry_at: row.retry_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PreferencesRow {
    recipient_id: String,
    opted_out: Json<Vec<Channel>>,
    do_not_disturb: Option<Json<DoNotDisturb>>,
    updated_at: DateTime<Utc>,
}

impl From<PreferencesRow> for RecipientPreferences {
    fn from(row: PreferencesRow) -> Self {
        Self {
            recipient_id: row.recipient_id,
            opted_out: row.opted_out.0,
            do_not_disturb: row.do_not_disturb.map(|d| d.0),
            updated_at: row.updated_at,
        }
    }
}

impl From<RequestRow> for NotificationRequest {
    fn from(row: RequestRow) -> Self {
        Self {
            id: row.id,
            recipient_id: row.recipient_id,
            template_id: row.template_id,
            variables: row.variables.0,
            priority: row.priority,
            channels: row.channels.0,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    id: Uuid,
    request_id: Uuid,
    recipient_id: String,
    channel: Channel,
    attempt_number: i32,
    status: AttemptStatus,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    latency_ms: Option<i64>,
    failure: Option<FailureKind>,
    error_detail: Option<String>,
    follow_up_id: Option<Uuid>,
}

impl From<AttemptRow> for NotificationAttempt {
    fn from(row: AttemptRow) -> Self {
        Self {
            id: row.id,
            request_id: row.request_id,
            recipient_id: row.recipient_id,
            channel: row.channel,
            attempt_number: row.attempt_number.max(0) as u32,
            status: row.status,
            started_at: row.started_at,
            completed_at: row.completed_at,
            latency_ms: row.latency_ms.map(|l| l.max(0) as u64),
            failure: row.failure,
            error_detail: row.error_detail,
            follow_up_id: row.follow_up_id,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ResponseRow {
    id: Uuid,
    attempt_id: Uuid,
    response_type: ResponseType,
    responded_at: DateTime<Utc>,
}

impl From<ResponseRow> for ResponseEvent {
    fn from(row: ResponseRow) -> Self {
        Self {
            id: row.id,
            attempt_id: row.attempt_id,
            response_type: row.response_type,
            responded_at: row.responded_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct FollowUpRow {
    id: Uuid,
    request_id: Uuid,
    origin_attempt_id: Uuid,
    last_attempt_id: Uuid,
    recipient_id: String,
    priority: Priority,
    current_channel: Channel,
    target_channel: Option<Channel>,
    escalation: Json<Vec<Channel>>,
    due_at: DateTime<Utc>,
    remaining_retries: i32,
    rounds: i32,
    delay_secs: i64,
    backoff_factor: f64,
    status: FollowUpStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<FollowUpRow> for FollowUpTask {
    fn from(row: FollowUpRow) -> Self {
        Self {
            id: row.id,
            request_id: row.request_id,
            origin_attempt_id: row.origin_attempt_id,
            last_attempt_id: row.last_attempt_id,
            recipient_id: row.recipient_id,
            priority: row.priority,
            current_channel: row.current_channel,
            target_channel: row.target_channel,
            escalation: row.escalation.0,
            due_at: row.due_at,
            remaining_retries: row.remaining_retries.max(0) as u32,
            rounds: row.rounds.max(0) as u32,
            delay_secs: row.delay_secs.max(0) as u64,
            backoff_factor: row.backoff_factor,
            status: row.status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RuleRow {
    id: Uuid,
    name: String,
    rule_type: RuleType,
    conditions: Json<Vec<RuleCondition>>,
    actions: Json<Vec<RuleAction>>,
    active: bool,
    priority: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<RuleRow> for AutomationRule {
    fn from(row: RuleRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            rule_type: row.rule_type,
            conditions: row.conditions.0,
            actions: row.actions.0,
            active: row.active,
            priority: row.priority,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const ATTEMPT_COLUMNS: &str = "id, request_id, recipient_id, channel, attempt_number, status, \
     started_at, completed_at, latency_ms, failure, error_detail, follow_up_id";

#[async_trait]
impl Store for PgStore {
    async fn insert_request(&self, request: &NotificationRequest) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO notification_requests
                (id, recipient_id, template_id, variables, priority, channels, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(request.id)
        .bind(&request.recipient_id)
        .bind(&request.template_id)
        .bind(Json(&request.variables))
        .bind(request.priority)
        .bind(Json(&request.channels))
        .bind(request.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_request(&self, id: Uuid) -> Result<Option<NotificationRequest>, StoreError> {
        let row: Option<RequestRow> = sqlx::query_as(
            "SELECT id, recipient_id, template_id, variables, priority, channels, created_at \
             FROM notification_requests WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn set_request_status(
        &self,
        id: Uuid,
        status: RequestStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE notification_requests SET status = $2, retry_at = NULL WHERE id = $1",
        )
        .bind(id)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn defer_request(&self, id: Uuid, retry_at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE notification_requests SET status = 'deferred', retry_at = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(retry_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unfinished_requests(&self) -> Result<Vec<UnfinishedRequest>, StoreError> {
        let rows: Vec<UnfinishedRow> = sqlx::query_as(
            "SELECT id, recipient_id, template_id, variables, priority, channels, created_at, \
                    status, retry_at \
             FROM notification_requests WHERE status IN ('pending', 'deferred') \
             ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn request_status(&self, id: Uuid) -> Result<Option<RequestStatus>, StoreError> {
        let row: Option<(RequestStatus,)> =
            sqlx::query_as("SELECT status FROM notification_requests WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(s,)| s))
    }

    async fn insert_attempt(&self, attempt: &NotificationAttempt) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO notification_attempts
                (id, request_id, recipient_id, channel, attempt_number, status, started_at,
                 completed_at, latency_ms, failure, error_detail, follow_up_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.request_id)
        .bind(&attempt.recipient_id)
        .bind(attempt.channel)
        .bind(attempt.attempt_number as i32)
        .bind(attempt.status)
        .bind(attempt.started_at)
        .bind(attempt.completed_at)
        .bind(attempt.latency_ms.map(|l| l as i64))
        .bind(attempt.failure)
        .bind(&attempt.error_detail)
        .bind(attempt.follow_up_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_attempt(&self, id: Uuid) -> Result<Option<NotificationAttempt>, StoreError> {
        let row: Option<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM notification_attempts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn attempts_for_request(
        &self,
        request_id: Uuid,
    ) -> Result<Vec<NotificationAttempt>, StoreError> {
        let rows: Vec<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM notification_attempts \
             WHERE request_id = $1 ORDER BY attempt_number"
        ))
        .bind(request_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn attempts_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<NotificationAttempt>, StoreError> {
        let rows: Vec<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM notification_attempts \
             WHERE started_at >= $1 AND started_at < $2 ORDER BY started_at"
        ))
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn attempts_for_recipient(
        &self,
        recipient_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<NotificationAttempt>, StoreError> {
        let rows: Vec<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM notification_attempts \
             WHERE recipient_id = $1 AND started_at >= $2 AND started_at < $3 \
             ORDER BY started_at"
        ))
        .bind(recipient_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn insert_response(&self, response: &ResponseEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO response_events (id, attempt_id, response_type, responded_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(response.id)
        .bind(response.attempt_id)
        .bind(response.response_type)
        .bind(response.responded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn responses_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ResponseEvent>, StoreError> {
        let rows: Vec<ResponseRow> = sqlx::query_as(
            "SELECT id, attempt_id, response_type, responded_at FROM response_events \
             WHERE responded_at >= $1 AND responded_at < $2 ORDER BY responded_at",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn save_follow_up(&self, task: &FollowUpTask) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO follow_up_tasks
                (id, request_id, origin_attempt_id, last_attempt_id, recipient_id, priority,
                 current_channel, target_channel, escalation, due_at, remaining_retries, rounds,
                 delay_secs, backoff_factor, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (id) DO UPDATE SET
                last_attempt_id = EXCLUDED.last_attempt_id,
                current_channel = EXCLUDED.current_channel,
                target_channel = EXCLUDED.target_channel,
                due_at = EXCLUDED.due_at,
                remaining_retries = EXCLUDED.remaining_retries,
                rounds = EXCLUDED.rounds,
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(task.id)
        .bind(task.request_id)
        .bind(task.origin_attempt_id)
        .bind(task.last_attempt_id)
        .bind(&task.recipient_id)
        .bind(task.priority)
        .bind(task.current_channel)
        .bind(task.target_channel)
        .bind(Json(&task.escalation))
        .bind(task.due_at)
        .bind(task.remaining_retries as i32)
        .bind(task.rounds as i32)
        .bind(task.delay_secs as i64)
        .bind(task.backoff_factor)
        .bind(task.status)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_follow_up(&self, id: Uuid) -> Result<Option<FollowUpTask>, StoreError> {
        let row: Option<FollowUpRow> = sqlx::query_as("SELECT * FROM follow_up_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn follow_ups(
        &self,
        status: Option<FollowUpStatus>,
    ) -> Result<Vec<FollowUpTask>, StoreError> {
        let rows: Vec<FollowUpRow> = match status {
            Some(status) => {
                sqlx::query_as("SELECT * FROM follow_up_tasks WHERE status = $1 ORDER BY due_at")
                    .bind(status)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_as("SELECT * FROM follow_up_tasks ORDER BY due_at")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn open_follow_ups(&self) -> Result<Vec<FollowUpTask>, StoreError> {
        let rows: Vec<FollowUpRow> = sqlx::query_as(
            "SELECT * FROM follow_up_tasks \
             WHERE status IN ('scheduled', 'due', 'dispatched') ORDER BY due_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn insert_report(&self, report: &PerformanceReport) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO performance_reports
                (id, period_start, period_end, generated_at, provisional, body)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(report.id)
        .bind(report.period_start)
        .bind(report.period_end)
        .bind(report.generated_at)
        .bind(report.provisional)
        .bind(Json(report))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_reports(&self, limit: usize) -> Result<Vec<PerformanceReport>, StoreError> {
        let rows: Vec<(Json<PerformanceReport>,)> = sqlx::query_as(
            "SELECT body FROM performance_reports ORDER BY generated_at DESC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(body,)| body.0).collect())
    }

    async fn insert_rule(&self, rule: &AutomationRule) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO automation_rules
                (id, name, rule_type, conditions, actions, active, priority, last_error,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(rule.id)
        .bind(&rule.name)
        .bind(rule.rule_type)
        .bind(Json(&rule.conditions))
        .bind(Json(&rule.actions))
        .bind(rule.active)
        .bind(rule.priority)
        .bind(&rule.last_error)
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_rule(&self, rule: &AutomationRule) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE automation_rules SET
                name = $2, rule_type = $3, conditions = $4, actions = $5, active = $6,
                priority = $7, last_error = $8, updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(rule.id)
        .bind(&rule.name)
        .bind(rule.rule_type)
        .bind(Json(&rule.conditions))
        .bind(Json(&rule.actions))
        .bind(rule.active)
        .bind(rule.priority)
        .bind(&rule.last_error)
        .bind(rule.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_rule(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM automation_rules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_rule(&self, id: Uuid) -> Result<Option<AutomationRule>, StoreError> {
        let row: Option<RuleRow> = sqlx::query_as("SELECT * FROM automation_rules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn list_rules(&self) -> Result<Vec<AutomationRule>, StoreError> {
        let rows: Vec<RuleRow> =
            sqlx::query_as("SELECT * FROM automation_rules ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl AddressBook for PgStore {
    async fn address(
        &self,
        recipient_id: &str,
        channel: Channel,
    ) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT address FROM recipient_addresses WHERE recipient_id = $1 AND channel = $2",
        )
        .bind(recipient_id)
        .bind(channel)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(a,)| a))
    }
}

#[async_trait]
impl PreferenceStore for PgStore {
    async fn preferences(
        &self,
        recipient_id: &str,
    ) -> Result<Option<RecipientPreferences>, StoreError> {
        let row: Option<PreferencesRow> = sqlx::query_as(
            "SELECT recipient_id, opted_out, do_not_disturb, updated_at \
             FROM recipient_preferences WHERE recipient_id = $1",
        )
        .bind(recipient_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn save_preferences(
        &self,
        preferences: &RecipientPreferences,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO recipient_preferences
                (recipient_id, opted_out, do_not_disturb, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (recipient_id) DO UPDATE SET
                opted_out = EXCLUDED.opted_out,
                do_not_disturb = EXCLUDED.do_not_disturb,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&preferences.recipient_id)
        .bind(Json(&preferences.opted_out))
        .bind(preferences.do_not_disturb.map(Json))
        .bind(preferences.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
