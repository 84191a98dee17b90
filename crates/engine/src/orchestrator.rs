//! Wires the engine components together and owns their background loops.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use herald_common::config::AppConfig;
use herald_common::error::AppError;
use herald_common::types::{
    NotificationRequest, RecipientPreferences, ResponseEvent, ResponseType,
};
use herald_notifier::AdapterRegistry;

use crate::analytics::AnalyticsAggregator;
use crate::clock::Clock;
use crate::directory::AddressBook;
use crate::dispatch::{DispatchDeps, DispatchError, DispatchOutcome, Dispatcher};
use crate::events::EventBus;
use crate::fatigue::FatigueLimiter;
use crate::fatigue_store::{FatigueStore, MemoryFatigueStore};
use crate::followup::FollowUpScheduler;
use crate::health::HealthTracker;
use crate::policy::{PolicyHandle, RoutingPolicy};
use crate::preferences::{InMemoryPreferences, PreferenceStore};
use crate::queue::DispatchQueue;
use crate::rule_service::RuleService;
use crate::rules::RuleEngine;
use crate::store::{MemoryStore, PersistenceHealth, Store};
use crate::templates::TemplateStore;

/// External collaborators the engine runs against.
pub struct EngineDeps {
    pub store: Arc<dyn Store>,
    pub fatigue_store: Arc<dyn FatigueStore>,
    pub templates: Arc<dyn TemplateStore>,
    pub addresses: Arc<dyn AddressBook>,
    pub preferences: Arc<dyn PreferenceStore>,
    pub adapters: AdapterRegistry,
    pub clock: Arc<dyn Clock>,
}

impl EngineDeps {
    /// Keep history and fatigue counters in process memory.
    pub fn in_memory(
        templates: Arc<dyn TemplateStore>,
        addresses: Arc<dyn AddressBook>,
        adapters: AdapterRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            fatigue_store: Arc::new(MemoryFatigueStore::new()),
            templates,
            addresses,
            preferences: Arc::new(InMemoryPreferences::new()),
            adapters,
            clock,
        }
    }
}

pub struct Engine {
    config: AppConfig,
    pub store: Arc<dyn Store>,
    pub events: EventBus,
    pub clock: Arc<dyn Clock>,
    pub persistence: Arc<PersistenceHealth>,
    pub preferences: Arc<dyn PreferenceStore>,
    pub health: Arc<HealthTracker>,
    pub fatigue: Arc<FatigueLimiter>,
    pub policy: PolicyHandle,
    pub rules: Arc<RuleEngine>,
    pub rule_service: Arc<RuleService>,
    pub follow_ups: Arc<FollowUpScheduler>,
    pub dispatcher: Arc<Dispatcher>,
    pub analytics: Arc<AnalyticsAggregator>,
    pub queue: DispatchQueue,
}

impl Engine {
    pub fn new(config: AppConfig, deps: EngineDeps) -> Self {
        let events = EventBus::new();
        let clock = deps.clock;
        let store = deps.store;
        let preferences = deps.preferences;
        let persistence = Arc::new(PersistenceHealth::new());

        let health = Arc::new(HealthTracker::new(
            config.health.clone(),
            clock.clone(),
            events.clone(),
        ));
        // Fatigue counters live in their own store and degrade on their own.
        let fatigue = Arc::new(FatigueLimiter::new(
            config.fatigue.clone(),
            clock.clone(),
            events.clone(),
            deps.fatigue_store,
            Arc::new(PersistenceHealth::new()),
        ));
        let policy = PolicyHandle::new(RoutingPolicy::baseline(&config.follow_up));
        let rules = Arc::new(RuleEngine::new(
            config.rules.clone(),
            config.follow_up.clone(),
            store.clone(),
            health.clone(),
            fatigue.clone(),
            policy.clone(),
            clock.clone(),
            persistence.clone(),
        ));
        let rule_service = Arc::new(RuleService::new(
            store.clone(),
            events.clone(),
            clock.clone(),
        ));
        let follow_ups = Arc::new(FollowUpScheduler::new(
            store.clone(),
            clock.clone(),
            events.clone(),
            persistence.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            config.dispatch.clone(),
            DispatchDeps {
                store: store.clone(),
                templates: deps.templates,
                addresses: deps.addresses,
                preferences: preferences.clone(),
                adapters: deps.adapters,
                health: health.clone(),
                fatigue: fatigue.clone(),
                policy: policy.clone(),
                follow_ups: follow_ups.clone(),
                clock: clock.clone(),
                persistence: persistence.clone(),
            },
        ));
        let analytics = Arc::new(AnalyticsAggregator::new(
            config.analytics.clone(),
            store.clone(),
            clock.clone(),
            events.clone(),
            persistence.clone(),
            health.clone(),
            rules.clone(),
        ));
        let queue = DispatchQueue::new(config.dispatch.queue_capacity);

        Self {
            config,
            store,
            events,
            clock,
            persistence,
            preferences,
            health,
            fatigue,
            policy,
            rules,
            rule_service,
            follow_ups,
            dispatcher,
            analytics,
            queue,
        }
    }

    /// Restore persisted state and spawn the background loops. They stop
    /// when `shutdown` flips to `true`.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.follow_ups.recover().await;
        self.rules.reload_rules().await;
        self.rules.run_pass().await;
        self.recover_requests().await;

        let mut handles = vec![
            tokio::spawn(
                self.rules
                    .clone()
                    .run(self.events.subscribe(), shutdown.clone()),
            ),
            tokio::spawn(
                self.follow_ups
                    .clone()
                    .run(self.dispatcher.clone(), shutdown.clone()),
            ),
            tokio::spawn(self.analytics.clone().run(shutdown.clone())),
        ];
        handles.extend(self.queue.spawn_workers(
            self.config.dispatch.workers,
            self.dispatcher.clone(),
            self.clock.clone(),
            shutdown,
        ));

        tracing::info!(
            workers = self.config.dispatch.workers,
            policy_version = self.policy.current().version,
            "Engine started"
        );
        handles
    }

    pub async fn dispatch(
        &self,
        request: &NotificationRequest,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.dispatcher.dispatch(request).await
    }

    /// Queue a request for the worker pool. The request is stored as pending
    /// so a restart picks it up again.
    pub async fn submit(&self, request: NotificationRequest) -> Result<Uuid, AppError> {
        if request.channels.is_empty() {
            return Err(DispatchError::NoChannels.into());
        }
        let stored = request.clone();
        let id = self.queue.submit(request)?;
        self.persistence
            .observe("request.insert", self.store.insert_request(&stored).await);
        Ok(id)
    }

    /// Put requests a previous run left pending or deferred back on the
    /// queue, each deferred one at its retry time.
    pub async fn recover_requests(&self) -> usize {
        let Some(unfinished) = self.persistence.observe(
            "request.unfinished",
            self.store.unfinished_requests().await,
        ) else {
            return 0;
        };
        let now = self.clock.now();
        for entry in &unfinished {
            let wait = entry
                .retry_at
                .and_then(|at| (at - now).to_std().ok())
                .unwrap_or_default();
            self.queue.requeue_after(entry.request.clone(), wait);
        }
        if !unfinished.is_empty() {
            tracing::info!(count = unfinished.len(), "Recovered unfinished requests");
        }
        unfinished.len()
    }

    pub async fn preferences(
        &self,
        recipient_id: &str,
    ) -> Result<Option<RecipientPreferences>, AppError> {
        Ok(self.preferences.preferences(recipient_id).await?)
    }

    pub async fn save_preferences(
        &self,
        mut preferences: RecipientPreferences,
    ) -> Result<RecipientPreferences, AppError> {
        crate::preferences::validate(&preferences).map_err(AppError::Validation)?;
        preferences.opted_out.sort();
        preferences.opted_out.dedup();
        preferences.updated_at = self.clock.now();
        self.preferences.save_preferences(&preferences).await?;
        tracing::info!(
            recipient_id = %preferences.recipient_id,
            opted_out = ?preferences.opted_out,
            quiet_hours = preferences.do_not_disturb.is_some(),
            "Recipient preferences saved"
        );
        Ok(preferences)
    }

    /// Record that a recipient reacted to an attempt and settle its
    /// follow-ups.
    pub async fn record_response(
        &self,
        attempt_id: Uuid,
        response_type: ResponseType,
        responded_at: Option<DateTime<Utc>>,
    ) -> Result<ResponseEvent, AppError> {
        let attempt = self
            .dispatcher
            .attempt(attempt_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("attempt {}", attempt_id)))?;

        let response = ResponseEvent::new(
            attempt_id,
            response_type,
            responded_at.unwrap_or_else(|| self.clock.now()),
        );
        self.persistence.observe(
            "response.insert",
            self.store.insert_response(&response).await,
        );
        let settled = self.follow_ups.on_response(&attempt).await;

        tracing::info!(
            attempt_id = %attempt_id,
            request_id = %attempt.request_id,
            response_type = ?response_type,
            settled = settled.len(),
            "Response recorded"
        );
        Ok(response)
    }
}
