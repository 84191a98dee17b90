//! Follow-up scheduler.
//!
//! A task is armed when a notification that expects a response is
//! delivered. If no response arrives by its due time the task fires and the
//! request is re-sent on the next channel in its escalation order. Task
//! lifecycle:
//!
//! ```text
//! scheduled ──due──▶ due ──sent──▶ dispatched ──due──▶ due ─ ...
//!     │                │                │
//!  response         response         response
//!     ▼                ▼                ▼
//!  canceled         canceled        succeeded
//! ```
//!
//! A task that comes due with no retries left ends `exhausted`.
//!
//! Only the scheduling loop moves tasks to `due`, under the same lock that
//! response handling takes, so a task cannot fire twice and a response seen
//! before the send commits always wins.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{Notify, watch};
use uuid::Uuid;

use herald_common::types::{
    Channel, FollowUpStatus, FollowUpTask, NotificationAttempt, NotificationRequest, Priority,
};

use crate::clock::Clock;
use crate::dispatch::{Dispatcher, FollowUpOutcome};
use crate::events::{EngineEvent, EventBus};
use crate::policy::RetryPolicy;
use crate::store::{PersistenceHealth, Store};

/// Terminal tasks kept in memory for listing while storage is down.
const FINISHED_CAP: usize = 1024;

/// Upper bound on an idle sleep, so wall clock jumps are noticed.
const MAX_IDLE: Duration = Duration::from_secs(60);

/// Channels to try after `current`, following the escalation order and
/// wrapping around. `current` itself is never included.
pub fn next_channels(escalation: &[Channel], current: Channel) -> Vec<Channel> {
    let start = escalation
        .iter()
        .position(|c| *c == current)
        .map_or(0, |p| p + 1);
    let mut channels: Vec<Channel> = Vec::with_capacity(escalation.len());
    for c in escalation[start..].iter().chain(&escalation[..start]) {
        if *c != current && !channels.contains(c) {
            channels.push(*c);
        }
    }
    channels
}

/// Wait before the follow-up after `round` previous ones.
fn round_delay(delay_secs: u64, backoff_factor: f64, round: u32) -> TimeDelta {
    let secs = delay_secs as f64 * backoff_factor.powi(round as i32);
    TimeDelta::seconds(secs.round().clamp(0.0, 1e12) as i64)
}

struct Entry {
    task: FollowUpTask,
    cancel: Arc<AtomicBool>,
}

#[derive(Default)]
struct SchedulerState {
    open: HashMap<Uuid, Entry>,
    /// Waiting tasks ordered by due time.
    queue: BTreeSet<(DateTime<Utc>, Uuid)>,
    finished: VecDeque<FollowUpTask>,
}

impl SchedulerState {
    fn waiting(status: FollowUpStatus) -> bool {
        matches!(
            status,
            FollowUpStatus::Scheduled | FollowUpStatus::Dispatched
        )
    }

    fn track(&mut self, task: FollowUpTask) {
        if Self::waiting(task.status) {
            self.queue.insert((task.due_at, task.id));
        }
        self.open.insert(
            task.id,
            Entry {
                task,
                cancel: Arc::new(AtomicBool::new(false)),
            },
        );
    }

    fn finish(&mut self, task: FollowUpTask) {
        self.open.remove(&task.id);
        self.queue.remove(&(task.due_at, task.id));
        self.finished.push_back(task);
        while self.finished.len() > FINISHED_CAP {
            self.finished.pop_front();
        }
    }

    fn knows(&self, id: Uuid) -> bool {
        self.open.contains_key(&id) || self.finished.iter().any(|t| t.id == id)
    }
}

struct Claim {
    task: FollowUpTask,
    /// Status before the task was claimed; restored when a round is deferred.
    prior: FollowUpStatus,
    cancel: Arc<AtomicBool>,
}

pub struct FollowUpScheduler {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    persistence: Arc<PersistenceHealth>,
    state: Mutex<SchedulerState>,
    wake: Notify,
}

impl FollowUpScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        persistence: Arc<PersistenceHealth>,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            persistence,
            state: Mutex::new(SchedulerState::default()),
            wake: Notify::new(),
        }
    }

    /// Task id for the follow-up of a delivered attempt.
    pub fn task_id(origin_attempt_id: Uuid) -> Uuid {
        Uuid::new_v5(&origin_attempt_id, b"follow-up")
    }

    /// Arm a follow-up for a delivered attempt. Arming the same attempt
    /// twice returns the existing task.
    pub async fn arm(
        &self,
        request: &NotificationRequest,
        attempt: &NotificationAttempt,
        priority: Priority,
        retry: &RetryPolicy,
        escalation: Vec<Channel>,
    ) -> Option<Uuid> {
        if retry.max_retries == 0 {
            return None;
        }
        let id = Self::task_id(attempt.id);
        let known = self.state.lock().map(|s| s.knows(id)).unwrap_or(false);
        if known {
            return Some(id);
        }
        if let Some(Some(_)) = self
            .persistence
            .observe("follow_up.get", self.store.get_follow_up(id).await)
        {
            return Some(id);
        }

        let now = self.clock.now();
        let sent_at = attempt.completed_at.unwrap_or(attempt.started_at);
        let task = FollowUpTask {
            id,
            request_id: request.id,
            origin_attempt_id: attempt.id,
            last_attempt_id: attempt.id,
            recipient_id: request.recipient_id.clone(),
            priority,
            current_channel: attempt.channel,
            target_channel: next_channels(&escalation, attempt.channel).first().copied(),
            escalation,
            due_at: sent_at + round_delay(retry.delay_secs, retry.backoff_factor, 0),
            remaining_retries: retry.max_retries,
            rounds: 0,
            delay_secs: retry.delay_secs,
            backoff_factor: retry.backoff_factor,
            status: FollowUpStatus::Scheduled,
            created_at: now,
            updated_at: now,
        };

        self.persist(&task).await;
        tracing::info!(
            task_id = %id,
            request_id = %request.id,
            channel = %attempt.channel,
            due_at = %task.due_at,
            remaining_retries = task.remaining_retries,
            "Follow-up armed"
        );
        if let Ok(mut state) = self.state.lock() {
            state.track(task);
        }
        self.wake.notify_one();
        Some(id)
    }

    /// A recipient responded to `attempt`: settle every open task of its
    /// request. Returns the tasks that reached a terminal state.
    pub async fn on_response(&self, attempt: &NotificationAttempt) -> Vec<FollowUpTask> {
        let now = self.clock.now();
        let mut settled = Vec::new();
        if let Ok(mut guard) = self.state.lock() {
            let state = &mut *guard;
            let ids: Vec<Uuid> = state
                .open
                .values()
                .filter(|e| e.task.request_id == attempt.request_id)
                .map(|e| e.task.id)
                .collect();
            for id in ids {
                let Some(entry) = state.open.get_mut(&id) else {
                    continue;
                };
                entry.cancel.store(true, Ordering::SeqCst);
                let status = match entry.task.status {
                    FollowUpStatus::Scheduled => FollowUpStatus::Canceled,
                    FollowUpStatus::Dispatched => FollowUpStatus::Succeeded,
                    // A running round settles the task when it commits.
                    _ => continue,
                };
                let mut task = entry.task.clone();
                task.status = status;
                task.updated_at = now;
                state.finish(task.clone());
                settled.push(task);
            }
        }

        for task in &settled {
            tracing::info!(
                task_id = %task.id,
                request_id = %task.request_id,
                status = %task.status,
                "Follow-up settled by response"
            );
            self.persist(task).await;
        }
        settled
    }

    /// Fire every task due at the clock's current time. Returns how many
    /// tasks were claimed.
    pub async fn fire_due(&self, dispatcher: &Dispatcher) -> usize {
        let claimed = self.claim_due(self.clock.now());
        let count = claimed.len();
        for claim in claimed {
            self.persist(&claim.task).await;
            self.fire(claim, dispatcher).await;
        }
        count
    }

    fn claim_due(&self, now: DateTime<Utc>) -> Vec<Claim> {
        let Ok(mut guard) = self.state.lock() else {
            return Vec::new();
        };
        let state = &mut *guard;
        let mut claimed = Vec::new();
        while let Some((due_at, id)) = state.queue.pop_first() {
            if due_at > now {
                state.queue.insert((due_at, id));
                break;
            }
            let Some(entry) = state.open.get_mut(&id) else {
                continue;
            };
            if !SchedulerState::waiting(entry.task.status) {
                continue;
            }
            let prior = entry.task.status;
            entry.task.status = FollowUpStatus::Due;
            entry.task.updated_at = now;
            claimed.push(Claim {
                task: entry.task.clone(),
                prior,
                cancel: entry.cancel.clone(),
            });
        }
        claimed
    }

    async fn fire(&self, claim: Claim, dispatcher: &Dispatcher) {
        let Claim {
            mut task,
            prior,
            cancel,
        } = claim;

        if task.remaining_retries == 0 {
            task.status = FollowUpStatus::Exhausted;
            self.commit(task, "no response after the final follow-up")
                .await;
            return;
        }

        let outcome = dispatcher.follow_up(&task, &cancel).await;
        let now = self.clock.now();
        let mut reason = "";
        match outcome {
            FollowUpOutcome::Delivered(attempt) => {
                task.remaining_retries -= 1;
                task.rounds += 1;
                task.current_channel = attempt.channel;
                task.last_attempt_id = attempt.id;
                task.target_channel = next_channels(&task.escalation, attempt.channel)
                    .first()
                    .copied();
                let sent_at = attempt.completed_at.unwrap_or(attempt.started_at);
                task.due_at =
                    sent_at + round_delay(task.delay_secs, task.backoff_factor, task.rounds);
                task.status = FollowUpStatus::Dispatched;
                tracing::info!(
                    task_id = %task.id,
                    channel = %attempt.channel,
                    round = task.rounds,
                    remaining_retries = task.remaining_retries,
                    "Follow-up dispatched"
                );
            }
            FollowUpOutcome::Deferred(until) => {
                task.due_at = until;
                task.status = prior;
            }
            FollowUpOutcome::Canceled => {
                task.status = FollowUpStatus::Canceled;
            }
            FollowUpOutcome::Failed(_) => {
                reason = "follow-up delivery failed on every channel";
                Self::spend_round(&mut task, prior, now, reason);
            }
            FollowUpOutcome::NoChannel => {
                reason = "no alternate channel available";
                Self::spend_round(&mut task, prior, now, reason);
            }
        }
        self.commit(task, reason).await;
    }

    /// A round that sent nothing still uses up a retry.
    fn spend_round(
        task: &mut FollowUpTask,
        prior: FollowUpStatus,
        now: DateTime<Utc>,
        reason: &str,
    ) {
        task.remaining_retries -= 1;
        task.rounds += 1;
        if task.remaining_retries == 0 {
            task.status = FollowUpStatus::Exhausted;
        } else {
            tracing::warn!(task_id = %task.id, reason, "Follow-up round failed");
            task.due_at = now + round_delay(task.delay_secs, task.backoff_factor, task.rounds);
            task.status = prior;
        }
    }

    /// Store the outcome of a round. A response observed while the round
    /// was running turns any non-terminal result into `canceled`.
    async fn commit(&self, mut task: FollowUpTask, reason: &str) {
        task.updated_at = self.clock.now();
        if let Ok(mut guard) = self.state.lock() {
            let state = &mut *guard;
            let canceled = state
                .open
                .get(&task.id)
                .is_some_and(|e| e.cancel.load(Ordering::SeqCst));
            if canceled && task.status != FollowUpStatus::Canceled {
                tracing::info!(
                    task_id = %task.id,
                    "Response arrived while follow-up was running"
                );
                task.status = FollowUpStatus::Canceled;
            }

            if task.status.is_terminal() {
                state.finish(task.clone());
            } else if let Some(entry) = state.open.get_mut(&task.id) {
                entry.task = task.clone();
                state.queue.insert((task.due_at, task.id));
            }
        }

        if task.status == FollowUpStatus::Exhausted {
            tracing::warn!(
                audit = true,
                task_id = %task.id,
                request_id = %task.request_id,
                recipient_id = %task.recipient_id,
                rounds = task.rounds,
                reason,
                "Follow-up exhausted"
            );
            self.events.publish(EngineEvent::FollowUpExhausted {
                task_id: task.id,
                request_id: task.request_id,
            });
        }
        self.persist(&task).await;
        self.wake.notify_one();
    }

    /// Reload open tasks from storage. Tasks caught mid-round are put back
    /// to `scheduled`, so their follow-up may repeat.
    pub async fn recover(&self) -> usize {
        let Some(tasks) = self
            .persistence
            .observe("follow_up.recover", self.store.open_follow_ups().await)
        else {
            return 0;
        };

        let now = self.clock.now();
        let mut reset = Vec::new();
        let mut recovered = 0;
        if let Ok(mut state) = self.state.lock() {
            for mut task in tasks {
                if state.open.contains_key(&task.id) {
                    continue;
                }
                if task.status == FollowUpStatus::Due {
                    task.status = FollowUpStatus::Scheduled;
                    task.updated_at = now;
                    reset.push(task.clone());
                }
                state.track(task);
                recovered += 1;
            }
        }
        for task in &reset {
            self.persist(task).await;
        }

        tracing::info!(recovered, reset = reset.len(), "Follow-up tasks recovered");
        self.wake.notify_one();
        recovered
    }

    pub async fn get(&self, id: Uuid) -> Option<FollowUpTask> {
        if let Some(Some(task)) = self
            .persistence
            .observe("follow_up.get", self.store.get_follow_up(id).await)
        {
            return Some(task);
        }
        let state = self.state.lock().ok()?;
        state
            .open
            .get(&id)
            .map(|e| e.task.clone())
            .or_else(|| state.finished.iter().find(|t| t.id == id).cloned())
    }

    /// Tasks with `status` (all when `None`), from storage when reachable.
    pub async fn list(&self, status: Option<FollowUpStatus>) -> Vec<FollowUpTask> {
        if let Some(tasks) = self
            .persistence
            .observe("follow_up.list", self.store.follow_ups(status).await)
        {
            return tasks;
        }
        let Ok(state) = self.state.lock() else {
            return Vec::new();
        };
        let mut tasks: Vec<FollowUpTask> = state
            .open
            .values()
            .map(|e| e.task.clone())
            .chain(state.finished.iter().cloned())
            .filter(|t| status.is_none_or(|s| t.status == s))
            .collect();
        tasks.sort_by_key(|t| t.due_at);
        tasks
    }

    /// Number of tasks not yet terminal.
    pub fn open_count(&self) -> usize {
        self.state.lock().map(|s| s.open.len()).unwrap_or(0)
    }

    fn next_due(&self) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.queue.first().map(|(at, _)| *at))
    }

    async fn persist(&self, task: &FollowUpTask) {
        self.persistence
            .observe("follow_up.save", self.store.save_follow_up(task).await);
    }

    /// Scheduling loop: sleeps until the earliest due task, or until a task
    /// is armed or settled.
    pub async fn run(
        self: Arc<Self>,
        dispatcher: Arc<Dispatcher>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!(open = self.open_count(), "Follow-up scheduler started");
        loop {
            let idle = match self.next_due() {
                Some(at) => (at - self.clock.now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .min(MAX_IDLE),
                None => MAX_IDLE,
            };

            tokio::select! {
                _ = tokio::time::sleep(idle) => {
                    let fired = self.fire_due(&dispatcher).await;
                    if fired > 0 {
                        tracing::debug!(fired, "Follow-ups fired");
                    }
                }
                _ = self.wake.notified() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Follow-up scheduler stopped");
    }
}
