use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use herald_common::types::{
    AutomationRule, FollowUpStatus, FollowUpTask, NotificationAttempt, NotificationRequest,
    PerformanceReport, RequestStatus, ResponseEvent,
};

use super::{Store, StoreError, UnfinishedRequest};

#[derive(Default)]
struct MemoryState {
    requests: HashMap<Uuid, UnfinishedRequest>,
    attempts: HashMap<Uuid, NotificationAttempt>,
    responses: Vec<ResponseEvent>,
    follow_ups: HashMap<Uuid, FollowUpTask>,
    reports: Vec<PerformanceReport>,
    rules: HashMap<Uuid, AutomationRule>,
}

/// Process-local store. Also used when no database is configured.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with `Unavailable` (outage simulation).
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

fn in_period(ts: DateTime<Utc>, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    ts >= start && ts < end
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_request(&self, request: &NotificationRequest) -> Result<(), StoreError> {
        self.check()?;
        self.state
            .write()
            .await
            .requests
            .entry(request.id)
            .or_insert_with(|| UnfinishedRequest {
                request: request.clone(),
                status: RequestStatus::Pending,
                retry_at: None,
            });
        Ok(())
    }

    async fn get_request(&self, id: Uuid) -> Result<Option<NotificationRequest>, StoreError> {
        self.check()?;
        Ok(self
            .state
            .read()
            .await
            .requests
            .get(&id)
            .map(|r| r.request.clone()))
    }

    async fn set_request_status(
        &self,
        id: Uuid,
        status: RequestStatus,
    ) -> Result<(), StoreError> {
        self.check()?;
        if let Some(entry) = self.state.write().await.requests.get_mut(&id) {
            entry.status = status;
            entry.retry_at = None;
        }
        Ok(())
    }

    async fn defer_request(&self, id: Uuid, retry_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.check()?;
        if let Some(entry) = self.state.write().await.requests.get_mut(&id) {
            entry.status = RequestStatus::Deferred;
            entry.retry_at = Some(retry_at);
        }
        Ok(())
    }

    async fn request_status(&self, id: Uuid) -> Result<Option<RequestStatus>, StoreError> {
        self.check()?;
        Ok(self.state.read().await.requests.get(&id).map(|r| r.status))
    }

    async fn unfinished_requests(&self) -> Result<Vec<UnfinishedRequest>, StoreError> {
        self.check()?;
        let mut unfinished: Vec<UnfinishedRequest> = self
            .state
            .read()
            .await
            .requests
            .values()
            .filter(|r| matches!(r.status, RequestStatus::Pending | RequestStatus::Deferred))
            .cloned()
            .collect();
        unfinished.sort_by_key(|r| r.request.created_at);
        Ok(unfinished)
    }

    async fn insert_attempt(&self, attempt: &NotificationAttempt) -> Result<bool, StoreError> {
        self.check()?;
        let mut state = self.state.write().await;
        if state.attempts.contains_key(&attempt.id) {
            return Ok(false);
        }
        state.attempts.insert(attempt.id, attempt.clone());
        Ok(true)
    }

    async fn get_attempt(&self, id: Uuid) -> Result<Option<NotificationAttempt>, StoreError> {
        self.check()?;
        Ok(self.state.read().await.attempts.get(&id).cloned())
    }

    async fn attempts_for_request(
        &self,
        request_id: Uuid,
    ) -> Result<Vec<NotificationAttempt>, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        let mut attempts: Vec<NotificationAttempt> = state
            .attempts
            .values()
            .filter(|a| a.request_id == request_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.attempt_number);
        Ok(attempts)
    }

    async fn attempts_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<NotificationAttempt>, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        let mut attempts: Vec<NotificationAttempt> = state
            .attempts
            .values()
            .filter(|a| in_period(a.started_at, start, end))
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.started_at);
        Ok(attempts)
    }

    async fn attempts_for_recipient(
        &self,
        recipient_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<NotificationAttempt>, StoreError> {
        Ok(self
            .attempts_between(start, end)
            .await?
            .into_iter()
            .filter(|a| a.recipient_id == recipient_id)
            .collect())
    }

    async fn insert_response(&self, response: &ResponseEvent) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state.write().await;
        if !state.responses.iter().any(|r| r.id == response.id) {
            state.responses.push(response.clone());
        }
        Ok(())
    }

    async fn responses_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ResponseEvent>, StoreError> {
        self.check()?;
        Ok(self
            .state
            .read()
            .await
            .responses
            .iter()
            .filter(|r| in_period(r.responded_at, start, end))
            .cloned()
            .collect())
    }

    async fn save_follow_up(&self, task: &FollowUpTask) -> Result<(), StoreError> {
        self.check()?;
        self.state
            .write()
            .await
            .follow_ups
            .insert(task.id, task.clone());
        Ok(())
    }

    async fn get_follow_up(&self, id: Uuid) -> Result<Option<FollowUpTask>, StoreError> {
        self.check()?;
        Ok(self.state.read().await.follow_ups.get(&id).cloned())
    }

    async fn follow_ups(
        &self,
        status: Option<FollowUpStatus>,
    ) -> Result<Vec<FollowUpTask>, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        let mut tasks: Vec<FollowUpTask> = state
            .follow_ups
            .values()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.due_at);
        Ok(tasks)
    }

    async fn open_follow_ups(&self) -> Result<Vec<FollowUpTask>, StoreError> {
        Ok(self
            .follow_ups(None)
            .await?
            .into_iter()
            .filter(|t| !t.status.is_terminal())
            .collect())
    }

    async fn insert_report(&self, report: &PerformanceReport) -> Result<(), StoreError> {
        self.check()?;
        self.state.write().await.reports.push(report.clone());
        Ok(())
    }

    async fn list_reports(&self, limit: usize) -> Result<Vec<PerformanceReport>, StoreError> {
        self.check()?;
        Ok(self
            .state
            .read()
            .await
            .reports
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn insert_rule(&self, rule: &AutomationRule) -> Result<(), StoreError> {
        self.check()?;
        self.state.write().await.rules.insert(rule.id, rule.clone());
        Ok(())
    }

    async fn update_rule(&self, rule: &AutomationRule) -> Result<bool, StoreError> {
        self.check()?;
        let mut state = self.state.write().await;
        match state.rules.get_mut(&rule.id) {
            Some(existing) => {
                *existing = rule.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_rule(&self, id: Uuid) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self.state.write().await.rules.remove(&id).is_some())
    }

    async fn get_rule(&self, id: Uuid) -> Result<Option<AutomationRule>, StoreError> {
        self.check()?;
        Ok(self.state.read().await.rules.get(&id).cloned())
    }

    async fn list_rules(&self) -> Result<Vec<AutomationRule>, StoreError> {
        self.check()?;
        let mut rules: Vec<AutomationRule> =
            self.state.read().await.rules.values().cloned().collect();
        rules.sort_by_key(|r| r.created_at);
        Ok(rules)
    }
}
