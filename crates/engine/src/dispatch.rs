//! Dispatch core: carries one notification request from template to a
//! delivered (or undeliverable) attempt.
//!
//! A dispatch pass walks the request's candidate channels in policy order,
//! skipping inactive channels, and stops at the first delivery. Attempt ids
//! are derived from `(request, channel, pass)`, so replaying a pass reuses
//! the stored outcome instead of sending again.
//!
//! Channels a recipient opted out of are never tried, and non-urgent sends
//! wait out the recipient's quiet hours.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tokio::sync::Semaphore;
use uuid::Uuid;

use herald_common::config::DispatchConfig;
use herald_common::error::AppError;
use herald_common::types::{
    AttemptStatus, Channel, FailureKind, FollowUpTask, NotificationAttempt, NotificationRequest,
    Priority, RecipientPreferences, RenderedMessage, RequestStatus,
};
use herald_notifier::{AdapterRegistry, ChannelError, Delivery};

use crate::clock::Clock;
use crate::directory::AddressBook;
use crate::fatigue::{FatigueDecision, FatigueLimiter};
use crate::followup::{FollowUpScheduler, next_channels};
use crate::health::HealthTracker;
use crate::policy::{PolicyHandle, RoutingPolicy};
use crate::preferences::PreferenceStore;
use crate::store::{PersistenceHealth, Store};
use crate::templates::{TemplateError, TemplateStore};

const INITIAL_PASS: &str = "initial";

/// Attempts and requests kept in memory for replays and degraded lookups.
const RECENT_CAP: usize = 4096;

/// How long a request waits when another worker holds one of its channels.
const BUSY_RETRY_SECS: i64 = 1;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("request has no candidate channels")]
    NoChannels,

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("request {request_id} undeliverable: {reason}")]
    Undeliverable {
        request_id: Uuid,
        reason: String,
        attempts: Vec<NotificationAttempt>,
    },
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::NoChannels => AppError::Validation(err.to_string()),
            DispatchError::Template(e) => e.into(),
            DispatchError::Undeliverable { .. } => AppError::Undeliverable(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Delivered {
        attempt: NotificationAttempt,
        /// Follow-up armed because the priority expects a response.
        follow_up: Option<Uuid>,
    },
    /// Every permitted channel was blocked by fatigue, or the recipient is in
    /// quiet hours; try again at `retry_at`.
    Deferred { retry_at: DateTime<Utc> },
}

/// Result of one follow-up round.
#[derive(Debug, Clone, PartialEq)]
pub enum FollowUpOutcome {
    Delivered(NotificationAttempt),
    Deferred(DateTime<Utc>),
    Failed(Vec<NotificationAttempt>),
    /// No alternate channel is routable for this request.
    NoChannel,
    /// A response arrived before anything was sent.
    Canceled,
}

enum PassOutcome {
    Delivered(NotificationAttempt),
    Deferred(DateTime<Utc>),
    Failed(Vec<NotificationAttempt>),
    Canceled,
}

struct Pass<'a> {
    request: &'a NotificationRequest,
    message: &'a RenderedMessage,
    priority: Priority,
    policy: &'a RoutingPolicy,
    key: String,
    follow_up_id: Option<Uuid>,
    cancel: Option<&'a AtomicBool>,
}

impl Pass<'_> {
    fn canceled(&self) -> bool {
        self.cancel.is_some_and(|c| c.load(Ordering::SeqCst))
    }
}

/// Deterministic attempt id for `channel` within a dispatch pass.
pub fn attempt_id(request_id: Uuid, channel: Channel, pass: &str) -> Uuid {
    Uuid::new_v5(&request_id, format!("{}:{}", channel, pass).as_bytes())
}

/// Insertion-ordered map that forgets its oldest entries.
struct Recent<V> {
    order: VecDeque<Uuid>,
    entries: HashMap<Uuid, V>,
}

impl<V> Recent<V> {
    fn new() -> Self {
        Self {
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    /// Returns `false` if the id is already present.
    fn insert(&mut self, id: Uuid, value: V) -> bool {
        if self.entries.contains_key(&id) {
            return false;
        }
        self.entries.insert(id, value);
        self.order.push_back(id);
        while self.order.len() > RECENT_CAP {
            if let Some(old) = self.order.pop_front() {
                self.entries.remove(&old);
            }
        }
        true
    }

    fn get(&self, id: &Uuid) -> Option<&V> {
        self.entries.get(id)
    }

    fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values()
    }
}

/// Holds a `(request, channel)` slot until dropped.
struct InFlight<'a> {
    slots: &'a Mutex<HashSet<(Uuid, Channel)>>,
    key: (Uuid, Channel),
}

impl<'a> InFlight<'a> {
    fn claim(slots: &'a Mutex<HashSet<(Uuid, Channel)>>, key: (Uuid, Channel)) -> Option<Self> {
        let mut held = slots.lock().ok()?;
        held.insert(key).then(|| Self { slots, key })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut held) = self.slots.lock() {
            held.remove(&self.key);
        }
    }
}

/// Collaborators the dispatcher is wired with.
pub struct DispatchDeps {
    pub store: Arc<dyn Store>,
    pub templates: Arc<dyn TemplateStore>,
    pub addresses: Arc<dyn AddressBook>,
    pub preferences: Arc<dyn PreferenceStore>,
    pub adapters: AdapterRegistry,
    pub health: Arc<HealthTracker>,
    pub fatigue: Arc<FatigueLimiter>,
    pub policy: PolicyHandle,
    pub follow_ups: Arc<FollowUpScheduler>,
    pub clock: Arc<dyn Clock>,
    pub persistence: Arc<PersistenceHealth>,
}

pub struct Dispatcher {
    config: DispatchConfig,
    store: Arc<dyn Store>,
    templates: Arc<dyn TemplateStore>,
    addresses: Arc<dyn AddressBook>,
    preferences: Arc<dyn PreferenceStore>,
    adapters: AdapterRegistry,
    health: Arc<HealthTracker>,
    fatigue: Arc<FatigueLimiter>,
    policy: PolicyHandle,
    follow_ups: Arc<FollowUpScheduler>,
    clock: Arc<dyn Clock>,
    persistence: Arc<PersistenceHealth>,
    limits: HashMap<Channel, Semaphore>,
    in_flight: Mutex<HashSet<(Uuid, Channel)>>,
    /// Attempts whose side effects were applied.
    applied: Mutex<Recent<NotificationAttempt>>,
    requests: Mutex<Recent<NotificationRequest>>,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig, deps: DispatchDeps) -> Self {
        let permits = config.max_in_flight_per_channel.max(1);
        let limits = Channel::ALL
            .into_iter()
            .map(|c| (c, Semaphore::new(permits)))
            .collect();
        Self {
            config,
            store: deps.store,
            templates: deps.templates,
            addresses: deps.addresses,
            preferences: deps.preferences,
            adapters: deps.adapters,
            health: deps.health,
            fatigue: deps.fatigue,
            policy: deps.policy,
            follow_ups: deps.follow_ups,
            clock: deps.clock,
            persistence: deps.persistence,
            limits,
            in_flight: Mutex::new(HashSet::new()),
            applied: Mutex::new(Recent::new()),
            requests: Mutex::new(Recent::new()),
        }
    }

    /// Dispatch a request on its first healthy, permitted channel.
    pub async fn dispatch(
        &self,
        request: &NotificationRequest,
    ) -> Result<DispatchOutcome, DispatchError> {
        if request.channels.is_empty() {
            return Err(DispatchError::NoChannels);
        }
        if let Ok(mut requests) = self.requests.lock() {
            requests.insert(request.id, request.clone());
        }
        self.persistence.observe(
            "request.insert",
            self.store.insert_request(request).await,
        );

        let message = match self
            .templates
            .render(&request.template_id, &request.variables)
        {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(
                    request_id = %request.id,
                    template_id = %request.template_id,
                    error = %err,
                    "Template rendering failed"
                );
                self.set_status(request.id, RequestStatus::Undeliverable)
                    .await;
                return Err(err.into());
            }
        };

        let policy = self.policy.current();
        let priority = policy.effective_priority(request.priority);
        let preferences = self.preferences_for(&request.recipient_id).await;
        let permitted: Vec<Channel> = policy
            .order_channels(&request.channels)
            .into_iter()
            .filter(|c| preferences.as_ref().is_none_or(|p| p.allows(*c)))
            .collect();
        if permitted.is_empty() {
            return Err(self
                .undeliverable(request, Vec::new(), "recipient opted out of every channel")
                .await);
        }
        let channels: Vec<Channel> = permitted
            .into_iter()
            .filter(|c| self.health.is_routable(*c))
            .collect();
        if channels.is_empty() {
            return Err(self
                .undeliverable(request, Vec::new(), "no routable channel")
                .await);
        }
        if let Some(retry_at) = preferences
            .as_ref()
            .and_then(|p| p.quiet_until(priority, self.clock.now()))
        {
            tracing::info!(
                request_id = %request.id,
                recipient_id = %request.recipient_id,
                retry_at = %retry_at,
                "Recipient in quiet hours, dispatch deferred"
            );
            self.defer(request.id, retry_at).await;
            return Ok(DispatchOutcome::Deferred { retry_at });
        }

        let pass = Pass {
            request,
            message: &message,
            priority,
            policy: &policy,
            key: INITIAL_PASS.to_string(),
            follow_up_id: None,
            cancel: None,
        };
        match self.run_pass(&pass, &channels).await {
            PassOutcome::Delivered(attempt) => {
                self.set_status(request.id, RequestStatus::Delivered).await;
                let mut follow_up = None;
                if priority.requires_ack()
                    && let Some(retry) = policy.retry_for(priority)
                {
                    follow_up = self
                        .follow_ups
                        .arm(
                            request,
                            &attempt,
                            priority,
                            retry,
                            policy.order_channels(&request.channels),
                        )
                        .await;
                }
                Ok(DispatchOutcome::Delivered { attempt, follow_up })
            }
            PassOutcome::Deferred(retry_at) => {
                tracing::info!(
                    request_id = %request.id,
                    recipient_id = %request.recipient_id,
                    retry_at = %retry_at,
                    "Dispatch deferred"
                );
                self.defer(request.id, retry_at).await;
                Ok(DispatchOutcome::Deferred { retry_at })
            }
            PassOutcome::Failed(attempts) => Err(self
                .undeliverable(request, attempts, "all channels failed")
                .await),
            PassOutcome::Canceled => Err(self
                .undeliverable(request, Vec::new(), "dispatch canceled")
                .await),
        }
    }

    /// Run one follow-up round for `task` on the channels after its current
    /// one. `cancel` is checked before every send.
    pub async fn follow_up(&self, task: &FollowUpTask, cancel: &AtomicBool) -> FollowUpOutcome {
        let Some(request) = self.load_request(task.request_id).await else {
            tracing::warn!(
                task_id = %task.id,
                request_id = %task.request_id,
                "Follow-up request not found"
            );
            return FollowUpOutcome::Failed(Vec::new());
        };
        let message = match self
            .templates
            .render(&request.template_id, &request.variables)
        {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(task_id = %task.id, error = %err, "Follow-up rendering failed");
                return FollowUpOutcome::Failed(Vec::new());
            }
        };

        let rejected = self.rejected_channels(request.id).await;
        let preferences = self.preferences_for(&request.recipient_id).await;
        let channels: Vec<Channel> = next_channels(&task.escalation, task.current_channel)
            .into_iter()
            .filter(|c| !rejected.contains(c) && self.health.is_routable(*c))
            .filter(|c| preferences.as_ref().is_none_or(|p| p.allows(*c)))
            .collect();
        if channels.is_empty() {
            return FollowUpOutcome::NoChannel;
        }
        if let Some(until) = preferences
            .as_ref()
            .and_then(|p| p.quiet_until(task.priority, self.clock.now()))
        {
            tracing::debug!(task_id = %task.id, until = %until, "Follow-up held for quiet hours");
            return FollowUpOutcome::Deferred(until);
        }

        let policy = self.policy.current();
        let pass = Pass {
            request: &request,
            message: &message,
            priority: task.priority,
            policy: &policy,
            key: format!("follow-up:{}:{}", task.id, task.rounds),
            follow_up_id: Some(task.id),
            cancel: Some(cancel),
        };
        match self.run_pass(&pass, &channels).await {
            PassOutcome::Delivered(attempt) => FollowUpOutcome::Delivered(attempt),
            PassOutcome::Deferred(until) => FollowUpOutcome::Deferred(until),
            PassOutcome::Failed(attempts) => FollowUpOutcome::Failed(attempts),
            PassOutcome::Canceled => FollowUpOutcome::Canceled,
        }
    }

    /// Apply the side effects of a finished attempt: health, storage and
    /// fatigue. Replays of an attempt id already applied are ignored and
    /// return `false`.
    pub async fn record_attempt(&self, attempt: &NotificationAttempt) -> bool {
        let policy = self.policy.current();
        self.apply_outcome(attempt, &policy).await
    }

    /// Look up an attempt, falling back to memory when storage is down.
    pub async fn attempt(&self, id: Uuid) -> Option<NotificationAttempt> {
        let cached = self.applied.lock().ok().and_then(|a| a.get(&id).cloned());
        if cached.is_some() {
            return cached;
        }
        self.persistence
            .observe("attempt.get", self.store.get_attempt(id).await)
            .flatten()
    }

    async fn run_pass(&self, pass: &Pass<'_>, channels: &[Channel]) -> PassOutcome {
        let request = pass.request;
        let mut failed = Vec::new();
        let mut deferred: Option<DateTime<Utc>> = None;
        let mut next_number = self.next_attempt_number(request.id).await;

        for &channel in channels {
            let id = attempt_id(request.id, channel, &pass.key);
            if let Some(existing) = self.attempt(id).await {
                tracing::debug!(attempt_id = %id, channel = %channel, "Replaying stored attempt");
                self.apply_outcome(&existing, pass.policy).await;
                if existing.is_delivered() {
                    return PassOutcome::Delivered(existing);
                }
                failed.push(existing);
                continue;
            }

            let decision = self
                .fatigue
                .check_and_reserve(&request.recipient_id, channel, pass.priority, pass.policy)
                .await;
            if let FatigueDecision::Blocked { until } = decision {
                deferred = Some(deferred.map_or(until, |d| d.min(until)));
                continue;
            }

            let Some(_slot) = InFlight::claim(&self.in_flight, (request.id, channel)) else {
                tracing::debug!(
                    request_id = %request.id,
                    channel = %channel,
                    "Channel already in flight for request"
                );
                self.fatigue.release(&request.recipient_id);
                let retry = self.clock.now() + TimeDelta::seconds(BUSY_RETRY_SECS);
                deferred = Some(deferred.map_or(retry, |d| d.min(retry)));
                continue;
            };
            if pass.canceled() {
                self.fatigue.release(&request.recipient_id);
                return PassOutcome::Canceled;
            }

            let attempt = self.send_attempt(pass, channel, id, next_number).await;
            next_number += 1;
            if !attempt.is_delivered() {
                self.fatigue.release(&request.recipient_id);
            }
            self.apply_outcome(&attempt, pass.policy).await;
            if attempt.is_delivered() {
                return PassOutcome::Delivered(attempt);
            }
            failed.push(attempt);
        }

        match deferred {
            Some(until) => PassOutcome::Deferred(until),
            None => PassOutcome::Failed(failed),
        }
    }

    async fn send_attempt(
        &self,
        pass: &Pass<'_>,
        channel: Channel,
        id: Uuid,
        attempt_number: u32,
    ) -> NotificationAttempt {
        let request = pass.request;
        let started_at = self.clock.now();
        let timer = Instant::now();
        let result = self.send(request, channel, pass.message).await;
        let measured_ms = timer.elapsed().as_millis() as u64;

        let mut attempt = NotificationAttempt {
            id,
            request_id: request.id,
            recipient_id: request.recipient_id.clone(),
            channel,
            attempt_number,
            status: AttemptStatus::Delivered,
            started_at,
            completed_at: Some(self.clock.now()),
            latency_ms: Some(measured_ms),
            failure: None,
            error_detail: None,
            follow_up_id: pass.follow_up_id,
        };
        match result {
            Ok(delivery) => {
                attempt.latency_ms = Some(delivery.latency_ms.unwrap_or(measured_ms));
                tracing::info!(
                    request_id = %request.id,
                    attempt_id = %id,
                    channel = %channel,
                    attempt_number,
                    latency_ms = attempt.latency_ms,
                    provider_id = delivery.provider_id.as_deref(),
                    "Notification delivered"
                );
            }
            Err(err) => {
                attempt.status = AttemptStatus::Failed;
                attempt.failure = Some(err.kind());
                attempt.error_detail = Some(err.to_string());
                tracing::warn!(
                    request_id = %request.id,
                    attempt_id = %id,
                    channel = %channel,
                    attempt_number,
                    error = %err,
                    "Delivery attempt failed"
                );
            }
        }
        attempt
    }

    async fn send(
        &self,
        request: &NotificationRequest,
        channel: Channel,
        message: &RenderedMessage,
    ) -> Result<Delivery, ChannelError> {
        let Some(adapter) = self.adapters.get(channel) else {
            return Err(ChannelError::Rejected(format!(
                "no adapter configured for {}",
                channel
            )));
        };
        let address = match self.addresses.address(&request.recipient_id, channel).await {
            Ok(Some(address)) => address,
            Ok(None) => {
                return Err(ChannelError::Rejected(format!(
                    "recipient has no {} address",
                    channel
                )));
            }
            Err(err) => {
                return Err(ChannelError::Transient(format!(
                    "address lookup failed: {}",
                    err
                )));
            }
        };

        let limit = Duration::from_millis(self.config.send_timeout_ms);
        let Some(semaphore) = self.limits.get(&channel) else {
            return Err(ChannelError::Transient(format!("no send slots for {}", channel)));
        };
        let _permit = match tokio::time::timeout(limit, semaphore.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(ChannelError::Transient(format!("{} is shutting down", channel)));
            }
            Err(_) => {
                return Err(ChannelError::Transient(format!(
                    "{} in-flight limit reached",
                    channel
                )));
            }
        };

        match tokio::time::timeout(limit, adapter.send(&address, message)).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout(self.config.send_timeout_ms)),
        }
    }

    async fn apply_outcome(&self, attempt: &NotificationAttempt, policy: &RoutingPolicy) -> bool {
        let fresh = self
            .applied
            .lock()
            .map(|mut applied| applied.insert(attempt.id, attempt.clone()))
            .unwrap_or(true);
        if !fresh {
            tracing::debug!(attempt_id = %attempt.id, "Attempt outcome already applied");
            return false;
        }

        // A rejected address says nothing about the transport.
        if attempt.failure != Some(FailureKind::Permanent) {
            self.health.record_attempt(
                attempt.id,
                attempt.channel,
                attempt.is_delivered(),
                attempt.latency_ms,
            );
        }
        self.persistence
            .observe("attempt.insert", self.store.insert_attempt(attempt).await);
        if attempt.is_delivered() {
            self.fatigue
                .record_sent(&attempt.recipient_id, attempt.id, policy)
                .await;
        }
        true
    }

    async fn undeliverable(
        &self,
        request: &NotificationRequest,
        attempts: Vec<NotificationAttempt>,
        reason: &str,
    ) -> DispatchError {
        tracing::warn!(
            audit = true,
            request_id = %request.id,
            recipient_id = %request.recipient_id,
            attempts = attempts.len(),
            reason,
            "Request undeliverable"
        );
        self.set_status(request.id, RequestStatus::Undeliverable)
            .await;
        DispatchError::Undeliverable {
            request_id: request.id,
            reason: reason.to_string(),
            attempts,
        }
    }

    async fn set_status(&self, request_id: Uuid, status: RequestStatus) {
        self.persistence.observe(
            "request.status",
            self.store.set_request_status(request_id, status).await,
        );
    }

    async fn defer(&self, request_id: Uuid, retry_at: DateTime<Utc>) {
        self.persistence.observe(
            "request.defer",
            self.store.defer_request(request_id, retry_at).await,
        );
    }

    /// A failed lookup is treated as no preferences so delivery continues.
    async fn preferences_for(&self, recipient_id: &str) -> Option<RecipientPreferences> {
        match self.preferences.preferences(recipient_id).await {
            Ok(preferences) => preferences,
            Err(err) => {
                tracing::warn!(
                    recipient_id,
                    error = %err,
                    "Preference lookup failed, using defaults"
                );
                None
            }
        }
    }

    async fn load_request(&self, id: Uuid) -> Option<NotificationRequest> {
        let cached = self.requests.lock().ok().and_then(|r| r.get(&id).cloned());
        if cached.is_some() {
            return cached;
        }
        self.persistence
            .observe("request.get", self.store.get_request(id).await)
            .flatten()
    }

    async fn known_attempts(&self, request_id: Uuid) -> Vec<NotificationAttempt> {
        let stored = self.persistence.observe(
            "attempt.list",
            self.store.attempts_for_request(request_id).await,
        );
        let mut attempts = stored.unwrap_or_default();
        if let Ok(applied) = self.applied.lock() {
            for attempt in applied.values().filter(|a| a.request_id == request_id) {
                if !attempts.iter().any(|a| a.id == attempt.id) {
                    attempts.push(attempt.clone());
                }
            }
        }
        attempts
    }

    async fn next_attempt_number(&self, request_id: Uuid) -> u32 {
        self.known_attempts(request_id)
            .await
            .iter()
            .map(|a| a.attempt_number)
            .max()
            .unwrap_or(0)
            + 1
    }

    /// Channels that permanently rejected this request's recipient.
    async fn rejected_channels(&self, request_id: Uuid) -> HashSet<Channel> {
        self.known_attempts(request_id)
            .await
            .into_iter()
            .filter(|a| a.failure == Some(FailureKind::Permanent))
            .map(|a| a.channel)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::directory::InMemoryAddressBook;
    use crate::events::EventBus;
    use crate::fatigue_store::MemoryFatigueStore;
    use crate::preferences::InMemoryPreferences;
    use crate::store::MemoryStore;
    use crate::templates::InMemoryTemplates;
    use herald_common::config::{FatigueConfig, FollowUpConfig, HealthConfig};
    use herald_common::types::{DoNotDisturb, HealthStatus};
    use herald_notifier::MockAdapter;

    struct Fixture {
        dispatcher: Dispatcher,
        store: Arc<MemoryStore>,
        health: Arc<HealthTracker>,
        fatigue: Arc<FatigueLimiter>,
        preferences: Arc<InMemoryPreferences>,
        clock: Arc<ManualClock>,
        email: Arc<MockAdapter>,
        push: Arc<MockAdapter>,
        in_app: Arc<MockAdapter>,
    }

    fn fixture() -> Fixture {
        fixture_with(DispatchConfig::default(), FatigueConfig::default())
    }

    fn fixture_with(config: DispatchConfig, fatigue_config: FatigueConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let events = EventBus::new();
        let store = Arc::new(MemoryStore::new());
        let persistence = Arc::new(PersistenceHealth::new());
        let health = Arc::new(HealthTracker::new(
            HealthConfig::default(),
            clock.clone(),
            events.clone(),
        ));
        let fatigue = Arc::new(FatigueLimiter::new(
            fatigue_config,
            clock.clone(),
            events.clone(),
            Arc::new(MemoryFatigueStore::new()),
            Arc::new(PersistenceHealth::new()),
        ));
        let policy = PolicyHandle::new(RoutingPolicy::baseline(&FollowUpConfig::default()));
        let follow_ups = Arc::new(FollowUpScheduler::new(
            store.clone(),
            clock.clone(),
            events,
            persistence.clone(),
        ));

        let email = Arc::new(MockAdapter::new(Channel::Email));
        let push = Arc::new(MockAdapter::new(Channel::Push));
        let in_app = Arc::new(MockAdapter::new(Channel::InApp));
        let adapters = AdapterRegistry::new()
            .register(email.clone())
            .register(push.clone())
            .register(in_app.clone());

        let addresses = InMemoryAddressBook::new();
        addresses.insert_all("r1", "r1@example.com");
        let templates = InMemoryTemplates::new().with_template(
            "welcome",
            Some("Hi {{name}}"),
            "Welcome, {{name}}!",
        );

        let preferences = Arc::new(InMemoryPreferences::new());
        let dispatcher = Dispatcher::new(
            config,
            DispatchDeps {
                store: store.clone(),
                templates: Arc::new(templates),
                addresses: Arc::new(addresses),
                preferences: preferences.clone(),
                adapters,
                health: health.clone(),
                fatigue: fatigue.clone(),
                policy,
                follow_ups,
                clock: clock.clone(),
                persistence,
            },
        );
        Fixture {
            dispatcher,
            store,
            health,
            fatigue,
            preferences,
            clock,
            email,
            push,
            in_app,
        }
    }

    fn request(priority: Priority) -> NotificationRequest {
        NotificationRequest::new(
            "r1",
            "welcome",
            priority,
            vec![Channel::Email, Channel::Push, Channel::InApp],
        )
        .with_variable("name", "Ada")
    }

    #[tokio::test]
    async fn test_delivers_on_first_channel() {
        let f = fixture();
        let req = request(Priority::Medium);
        let outcome = f.dispatcher.dispatch(&req).await.unwrap();

        let DispatchOutcome::Delivered { attempt, follow_up } = outcome else {
            panic!("expected delivery");
        };
        assert_eq!(attempt.channel, Channel::Email);
        assert_eq!(attempt.attempt_number, 1);
        assert!(follow_up.is_none());
        assert_eq!(f.email.sent()[0].1.body, "Welcome, Ada!");
        assert_eq!(
            f.store.request_status(req.id).await.unwrap(),
            Some(RequestStatus::Delivered)
        );
        assert_eq!(f.fatigue.current("r1").await.daily_count, 1);
    }

    #[tokio::test]
    async fn test_falls_through_failed_channels() {
        let f = fixture();
        f.email
            .push_outcome(Err(ChannelError::Transient("502".to_string())));
        f.push
            .push_outcome(Err(ChannelError::Rejected("bad token".to_string())));

        let req = request(Priority::Low);
        let DispatchOutcome::Delivered { attempt, .. } = f.dispatcher.dispatch(&req).await.unwrap()
        else {
            panic!("expected delivery");
        };
        assert_eq!(attempt.channel, Channel::InApp);
        assert_eq!(attempt.attempt_number, 3);

        let attempts = f.store.attempts_for_request(req.id).await.unwrap();
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[0].failure, Some(FailureKind::Transient));
        assert_eq!(attempts[1].failure, Some(FailureKind::Permanent));
        // The permanent rejection is not a transport failure.
        assert_eq!(f.health.health(Channel::Push).sample_size, 0);
        assert_eq!(f.health.health(Channel::Email).sample_size, 1);
    }

    #[tokio::test]
    async fn test_all_channels_failing_is_undeliverable() {
        let f = fixture();
        for adapter in [&f.email, &f.push, &f.in_app] {
            adapter.set_fallback(Err(ChannelError::Transient("down".to_string())));
        }
        let req = request(Priority::Medium);
        let err = f.dispatcher.dispatch(&req).await.unwrap_err();
        match err {
            DispatchError::Undeliverable { attempts, .. } => assert_eq!(attempts.len(), 3),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            f.store.request_status(req.id).await.unwrap(),
            Some(RequestStatus::Undeliverable)
        );
    }

    #[tokio::test]
    async fn test_inactive_channels_are_skipped() {
        let f = fixture();
        f.health.set_status(Channel::Email, HealthStatus::Inactive);
        f.health.set_status(Channel::Push, HealthStatus::Inactive);

        let req = request(Priority::Medium);
        let DispatchOutcome::Delivered { attempt, .. } = f.dispatcher.dispatch(&req).await.unwrap()
        else {
            panic!("expected delivery");
        };
        assert_eq!(attempt.channel, Channel::InApp);
        assert_eq!(f.email.sent_count(), 0);
        assert_eq!(f.store.attempts_for_request(req.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_template_error_surfaces() {
        let f = fixture();
        let req = NotificationRequest::new("r1", "welcome", Priority::Low, vec![Channel::Email]);
        let err = f.dispatcher.dispatch(&req).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Template(TemplateError::MissingVariable { .. })
        ));
        assert_eq!(f.email.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_fatigued_recipient_is_deferred_but_urgent_proceeds() {
        let f = fixture_with(
            DispatchConfig::default(),
            FatigueConfig {
                daily_cap: 1,
                ..FatigueConfig::default()
            },
        );
        f.dispatcher.dispatch(&request(Priority::Low)).await.unwrap();

        let blocked = f.dispatcher.dispatch(&request(Priority::Low)).await.unwrap();
        assert!(matches!(blocked, DispatchOutcome::Deferred { .. }));

        let urgent = f
            .dispatcher
            .dispatch(&request(Priority::Urgent))
            .await
            .unwrap();
        assert!(matches!(urgent, DispatchOutcome::Delivered { .. }));
        assert_eq!(f.email.sent_count(), 2);
    }

    #[tokio::test]
    async fn test_deferred_request_keeps_retry_time() {
        let f = fixture_with(
            DispatchConfig::default(),
            FatigueConfig {
                daily_cap: 1,
                ..FatigueConfig::default()
            },
        );
        f.dispatcher.dispatch(&request(Priority::Low)).await.unwrap();

        let req = request(Priority::Low);
        let DispatchOutcome::Deferred { retry_at } = f.dispatcher.dispatch(&req).await.unwrap()
        else {
            panic!("expected deferral");
        };
        let unfinished = f.store.unfinished_requests().await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].request.id, req.id);
        assert_eq!(unfinished[0].status, RequestStatus::Deferred);
        assert_eq!(unfinished[0].retry_at, Some(retry_at));
    }

    #[tokio::test]
    async fn test_opted_out_channels_are_skipped() {
        let f = fixture();
        let mut prefs = RecipientPreferences::new("r1", f.clock.now());
        prefs.opted_out = vec![Channel::Email];
        f.preferences.save_preferences(&prefs).await.unwrap();

        let req = request(Priority::Medium);
        let DispatchOutcome::Delivered { attempt, .. } = f.dispatcher.dispatch(&req).await.unwrap()
        else {
            panic!("expected delivery");
        };
        assert_eq!(attempt.channel, Channel::Push);
        assert_eq!(attempt.attempt_number, 1);
        assert_eq!(f.email.sent_count(), 0);

        prefs.opted_out = vec![Channel::Email, Channel::Push, Channel::InApp];
        f.preferences.save_preferences(&prefs).await.unwrap();
        let err = f
            .dispatcher
            .dispatch(&request(Priority::Urgent))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Undeliverable { .. }));
        assert_eq!(f.push.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_quiet_hours_defer_all_but_urgent() {
        let f = fixture();
        let now = f.clock.now();
        let local = now.time();
        let mut prefs = RecipientPreferences::new("r1", now);
        prefs.do_not_disturb = Some(DoNotDisturb {
            start: local - TimeDelta::hours(1),
            end: local + TimeDelta::hours(1),
            utc_offset_minutes: 0,
        });
        f.preferences.save_preferences(&prefs).await.unwrap();

        let req = request(Priority::High);
        let DispatchOutcome::Deferred { retry_at } = f.dispatcher.dispatch(&req).await.unwrap()
        else {
            panic!("expected deferral");
        };
        assert!(retry_at > now && retry_at <= now + TimeDelta::hours(1));
        assert_eq!(f.email.sent_count(), 0);
        assert_eq!(
            f.store.request_status(req.id).await.unwrap(),
            Some(RequestStatus::Deferred)
        );

        let urgent = f
            .dispatcher
            .dispatch(&request(Priority::Urgent))
            .await
            .unwrap();
        assert!(matches!(urgent, DispatchOutcome::Delivered { .. }));

        f.clock.set(retry_at);
        let later = f.dispatcher.dispatch(&req).await.unwrap();
        assert!(matches!(later, DispatchOutcome::Delivered { .. }));
        assert_eq!(f.email.sent_count(), 2);
    }

    #[tokio::test]
    async fn test_replayed_dispatch_does_not_resend() {
        let f = fixture();
        let req = request(Priority::Medium);
        let first = f.dispatcher.dispatch(&req).await.unwrap();
        let second = f.dispatcher.dispatch(&req).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(f.email.sent_count(), 1);
        assert_eq!(f.fatigue.current("r1").await.daily_count, 1);
        assert_eq!(f.health.health(Channel::Email).sample_size, 1);
    }

    #[tokio::test]
    async fn test_record_attempt_is_idempotent() {
        let f = fixture();
        let req = request(Priority::Medium);
        let DispatchOutcome::Delivered { attempt, .. } = f.dispatcher.dispatch(&req).await.unwrap()
        else {
            panic!("expected delivery");
        };
        assert!(!f.dispatcher.record_attempt(&attempt).await);
        assert_eq!(f.fatigue.current("r1").await.daily_count, 1);
    }

    #[tokio::test]
    async fn test_high_priority_arms_follow_up() {
        let f = fixture();
        let req = request(Priority::High);
        let outcome = f.dispatcher.dispatch(&req).await.unwrap();
        let DispatchOutcome::Delivered { follow_up, .. } = outcome else {
            panic!("expected delivery");
        };
        let task_id = follow_up.expect("follow-up armed");
        let task = f.store.get_follow_up(task_id).await.unwrap().unwrap();
        assert_eq!(task.current_channel, Channel::Email);
        assert_eq!(task.remaining_retries, FollowUpConfig::default().max_retries);
    }

    #[tokio::test]
    async fn test_slow_adapter_times_out() {
        let f = fixture_with(
            DispatchConfig {
                send_timeout_ms: 20,
                ..DispatchConfig::default()
            },
            FatigueConfig::default(),
        );
        let slow =
            Arc::new(MockAdapter::new(Channel::Email).with_delay(Duration::from_millis(200)));
        let mut dispatcher = f.dispatcher;
        dispatcher.adapters = AdapterRegistry::new()
            .register(slow)
            .register(f.push.clone());

        let req = request(Priority::Low);
        let DispatchOutcome::Delivered { attempt, .. } = dispatcher.dispatch(&req).await.unwrap()
        else {
            panic!("expected delivery");
        };
        assert_eq!(attempt.channel, Channel::Push);
        let attempts = f.store.attempts_for_request(req.id).await.unwrap();
        assert_eq!(attempts[0].failure, Some(FailureKind::Timeout));
    }

    #[tokio::test]
    async fn test_missing_address_is_permanent() {
        let f = fixture();
        let req = NotificationRequest::new("nobody", "welcome", Priority::Low, vec![Channel::Email])
            .with_variable("name", "X");
        let err = f.dispatcher.dispatch(&req).await.unwrap_err();
        let DispatchError::Undeliverable { attempts, .. } = err else {
            panic!("expected undeliverable");
        };
        assert_eq!(attempts[0].failure, Some(FailureKind::Permanent));
    }

    #[tokio::test]
    async fn test_dispatch_survives_store_outage() {
        let f = fixture();
        f.store.set_available(false);
        let req = request(Priority::Medium);
        let outcome = f.dispatcher.dispatch(&req).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Delivered { .. }));
        assert!(f.dispatcher.persistence.is_degraded());
    }

    #[test]
    fn test_attempt_id_is_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(
            attempt_id(id, Channel::Email, INITIAL_PASS),
            attempt_id(id, Channel::Email, INITIAL_PASS)
        );
        assert_ne!(
            attempt_id(id, Channel::Email, INITIAL_PASS),
            attempt_id(id, Channel::Push, INITIAL_PASS)
        );
    }
}
