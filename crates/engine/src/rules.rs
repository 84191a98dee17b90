//! Automation rule engine.
//!
//! Rules are evaluated off the dispatch path. Each pass rebuilds the routing
//! policy from the configured baseline, applies every firing rule's actions
//! in precedence order, and publishes the result as a new snapshot.
//!
//! Within a pass the first rule to set a policy slot owns it; later (lower
//! precedence) rules cannot override it. A rule's actions are applied as a
//! batch on a draft: if any action is invalid the draft is discarded, the
//! rule's `last_error` is set, and the rest of the pass continues. A rule
//! that touches a slot another rule already owns is shadowed as a whole.
//!
//! Rules whose conditions read a recipient's fatigue, or that put a
//! recipient into fatigue mode, are recipient-scoped and evaluated when a
//! send is counted for that recipient. They may only set that recipient's
//! cooldown.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::{RwLock, broadcast, watch};
use uuid::Uuid;

use herald_common::config::{FollowUpConfig, MAX_DURATION_SECS, RuleEngineConfig};
use herald_common::types::{
    AutomationRule, Channel, FatigueRecord, Metric, PerformanceReport, Priority, RuleAction,
    RuleCondition,
};

use crate::clock::{Clock, seconds};
use crate::events::EngineEvent;
use crate::fatigue::FatigueLimiter;
use crate::health::HealthTracker;
use crate::policy::{PolicyHandle, RetryPolicy, RoutingPolicy};
use crate::store::{PersistenceHealth, Store, StoreError};

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("{0}")]
    InvalidAction(String),

    #[error("rule not found: {0}")]
    NotFound(Uuid),

    #[error("invalid rule: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<RuleError> for herald_common::error::AppError {
    fn from(err: RuleError) -> Self {
        use herald_common::error::AppError;
        match err {
            RuleError::NotFound(id) => AppError::NotFound(format!("rule {}", id)),
            RuleError::Validation(msg) | RuleError::InvalidAction(msg) => {
                AppError::Validation(msg)
            }
            RuleError::Store(e) => e.into(),
        }
    }
}

/// Inputs a rule's conditions are evaluated against.
pub struct RuleContext<'a> {
    pub now: DateTime<Utc>,
    pub health: &'a HealthTracker,
    pub report: Option<&'a PerformanceReport>,
    pub fatigue: Option<&'a FatigueRecord>,
}

impl RuleContext<'_> {
    /// Resolve a condition's metric. `None` when there is no data for it, in
    /// which case the condition does not hold.
    fn metric_value(&self, condition: &RuleCondition) -> Option<f64> {
        let window = match condition.window_secs {
            Some(secs) => Some(seconds(secs)?),
            None => None,
        };
        match condition.metric {
            Metric::ChannelSuccessRate { channel } => match window {
                Some(w) => self.health.window_stats(channel, w).map(|s| s.success_rate),
                None => {
                    let h = self.health.health(channel);
                    (h.sample_size > 0).then_some(h.success_rate)
                }
            },
            Metric::ChannelLatencyMs { channel } => match window {
                Some(w) => self
                    .health
                    .window_stats(channel, w)
                    .map(|s| s.avg_latency_ms),
                None => {
                    let h = self.health.health(channel);
                    (h.sample_size > 0).then_some(h.avg_latency_ms)
                }
            },
            Metric::ChannelResponseRate { channel } => self
                .report_within(window)?
                .channel(channel)
                .filter(|c| c.delivered > 0)
                .map(|c| c.response_rate),
            Metric::OverallSuccessRate => self
                .report_within(window)
                .filter(|r| r.metrics.total_attempts > 0)
                .map(|r| r.metrics.success_rate),
            Metric::ResponseRate => self
                .report_within(window)
                .filter(|r| r.metrics.delivered > 0)
                .map(|r| r.metrics.response_rate),
            Metric::AverageResponseTimeSecs => self
                .report_within(window)
                .filter(|r| r.metrics.responses > 0)
                .map(|r| r.metrics.avg_response_time_secs),
            Metric::FatigueScore => self.fatigue.map(|f| f.fatigue_score),
            Metric::DailyCount => self.fatigue.map(|f| f.daily_count as f64),
        }
    }

    /// The latest report, if it was generated inside the window.
    fn report_within(&self, window: Option<Duration>) -> Option<&PerformanceReport> {
        let report = self.report?;
        match window {
            Some(w) => {
                let cutoff = self.now.checked_sub_signed(w)?;
                (report.generated_at >= cutoff).then_some(report)
            }
            None => Some(report),
        }
    }

    pub fn holds(&self, condition: &RuleCondition) -> bool {
        self.metric_value(condition)
            .is_some_and(|value| condition.comparator.compare(value, condition.threshold))
    }
}

pub fn is_recipient_scoped(rule: &AutomationRule) -> bool {
    rule.actions
        .iter()
        .any(|a| matches!(a, RuleAction::EnterFatigueMode { .. }))
        || rule
            .conditions
            .iter()
            .any(|c| matches!(c.metric, Metric::FatigueScore | Metric::DailyCount))
}

/// Active rules in evaluation order: rule type precedence, then rule
/// priority (higher first), then age.
pub fn evaluation_order(rules: &[AutomationRule]) -> Vec<&AutomationRule> {
    let mut ordered: Vec<&AutomationRule> = rules.iter().filter(|r| r.active).collect();
    ordered.sort_by_key(|r| (r.rule_type.precedence(), Reverse(r.priority), r.created_at));
    ordered
}

/// Rules whose conditions all hold, in evaluation order. A rule without
/// conditions always fires.
pub fn evaluate<'r>(
    rules: &'r [AutomationRule],
    ctx: &RuleContext<'_>,
) -> Vec<&'r AutomationRule> {
    evaluation_order(rules)
        .into_iter()
        .filter(|rule| rule.conditions.iter().all(|c| ctx.holds(c)))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Slot {
    ChannelWeight(Channel),
    PriorityDelta,
    Retry(Priority),
    FatigueThreshold,
    RecipientCooldown,
}

/// Check an action on its own, independent of any policy.
pub fn validate_action(action: &RuleAction) -> Result<(), RuleError> {
    let invalid = |msg: String| Err(RuleError::InvalidAction(msg));
    match action {
        RuleAction::SwitchChannel { from, to } if from == to => {
            invalid(format!("switch_channel from and to are both {}", from))
        }
        RuleAction::AdjustPriority { delta } if *delta == 0 || delta.unsigned_abs() > 3 => {
            invalid(format!("adjust_priority delta {} must be within -3..=3 and non-zero", delta))
        }
        RuleAction::SetRetryPolicy { backoff_factor, .. }
            if !backoff_factor.is_finite() || *backoff_factor < 1.0 =>
        {
            invalid(format!("backoff_factor {} must be >= 1", backoff_factor))
        }
        RuleAction::SetRetryPolicy { delay_secs: 0, .. } => {
            invalid("retry delay must be positive".to_string())
        }
        RuleAction::SetRetryPolicy { delay_secs, .. } if *delay_secs > MAX_DURATION_SECS => {
            invalid(format!("retry delay must be at most {} seconds", MAX_DURATION_SECS))
        }
        RuleAction::SetRetryPolicy {
            priority: Some(p), ..
        } if !p.requires_ack() => invalid(format!("{} priority does not expect a response", p)),
        RuleAction::EnterFatigueMode { cooldown_secs: 0 } => {
            invalid("fatigue cooldown must be positive".to_string())
        }
        RuleAction::EnterFatigueMode { cooldown_secs } if *cooldown_secs > MAX_DURATION_SECS => {
            invalid(format!("fatigue cooldown must be at most {} seconds", MAX_DURATION_SECS))
        }
        RuleAction::SetFatigueThreshold { score } if !score.is_finite() || *score <= 0.0 => {
            invalid(format!("fatigue threshold {} must be positive", score))
        }
        _ => Ok(()),
    }
}

/// Applies firing rules onto a policy, one atomic batch per rule.
pub struct PolicyBuilder<'a> {
    policy: RoutingPolicy,
    owners: HashMap<Slot, Uuid>,
    recipient: Option<&'a str>,
    now: DateTime<Utc>,
}

/// Outcome of applying one rule.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyResult {
    Applied,
    /// Another rule already owns one of the slots; nothing was applied.
    Shadowed(Uuid),
    Failed(String),
}

impl<'a> PolicyBuilder<'a> {
    pub fn new(base: RoutingPolicy, recipient: Option<&'a str>, now: DateTime<Utc>) -> Self {
        Self {
            policy: base,
            owners: HashMap::new(),
            recipient,
            now,
        }
    }

    pub fn apply(&mut self, rule: &AutomationRule) -> ApplyResult {
        let mut claimed: Vec<Slot> = Vec::new();
        for action in &rule.actions {
            match self.slots(rule, action) {
                Ok(slots) => claimed.extend(slots),
                Err(err) => return ApplyResult::Failed(err.to_string()),
            }
        }
        let owner = claimed
            .iter()
            .find_map(|slot| self.owner_other_than(*slot, rule.id));
        if let Some(owner) = owner {
            return ApplyResult::Shadowed(owner);
        }

        let mut draft = self.policy.clone();
        for action in &rule.actions {
            if let Err(err) = self.apply_action(action, &mut draft) {
                return ApplyResult::Failed(err.to_string());
            }
        }

        self.policy = draft;
        for slot in claimed {
            self.owners.insert(slot, rule.id);
        }
        ApplyResult::Applied
    }

    /// The rule owning `slot` this pass, when it is not `rule_id`.
    fn owner_other_than(&self, slot: Slot, rule_id: Uuid) -> Option<Uuid> {
        self.owners.get(&slot).copied().filter(|owner| *owner != rule_id)
    }

    /// Check an action against the rule and this builder's scope, and name
    /// the slots it sets.
    fn slots(&self, rule: &AutomationRule, action: &RuleAction) -> Result<Vec<Slot>, RuleError> {
        if action.rule_type() != rule.rule_type {
            return Err(RuleError::InvalidAction(format!(
                "{:?} action not allowed in a {} rule",
                action,
                rule.rule_type
            )));
        }
        validate_action(action)?;

        match (action, self.recipient) {
            (RuleAction::EnterFatigueMode { .. }, None) => {
                return Err(RuleError::InvalidAction(
                    "enter_fatigue_mode needs a recipient in context".to_string(),
                ));
            }
            (RuleAction::EnterFatigueMode { .. }, Some(_)) => {}
            (_, Some(recipient)) => {
                return Err(RuleError::InvalidAction(format!(
                    "{:?} would change routing for every recipient, not just {}",
                    action, recipient
                )));
            }
            (_, None) => {}
        }

        Ok(match action {
            RuleAction::SwitchChannel { from, to } => {
                vec![Slot::ChannelWeight(*from), Slot::ChannelWeight(*to)]
            }
            RuleAction::AdjustPriority { .. } => vec![Slot::PriorityDelta],
            RuleAction::SetRetryPolicy { priority, .. } => match priority {
                Some(p) => vec![Slot::Retry(*p)],
                None => vec![Slot::Retry(Priority::High), Slot::Retry(Priority::Urgent)],
            },
            RuleAction::EnterFatigueMode { .. } => vec![Slot::RecipientCooldown],
            RuleAction::SetFatigueThreshold { .. } => vec![Slot::FatigueThreshold],
        })
    }

    fn apply_action(
        &self,
        action: &RuleAction,
        draft: &mut RoutingPolicy,
    ) -> Result<(), RuleError> {
        match action {
            RuleAction::SwitchChannel { from, to } => {
                *draft.channel_weights.entry(*from).or_insert(0) -= 1;
                *draft.channel_weights.entry(*to).or_insert(0) += 1;
            }
            RuleAction::AdjustPriority { delta } => {
                draft.priority_delta = *delta;
            }
            RuleAction::SetRetryPolicy {
                priority,
                max_retries,
                delay_secs,
                backoff_factor,
            } => {
                let retry = RetryPolicy {
                    max_retries: *max_retries,
                    delay_secs: *delay_secs,
                    backoff_factor: *backoff_factor,
                };
                match priority {
                    Some(p) => {
                        draft.retry.insert(*p, retry);
                    }
                    None => {
                        draft.retry.insert(Priority::High, retry.clone());
                        draft.retry.insert(Priority::Urgent, retry);
                    }
                }
            }
            RuleAction::EnterFatigueMode { cooldown_secs } => {
                let recipient = self.recipient.ok_or_else(|| {
                    RuleError::InvalidAction(
                        "enter_fatigue_mode needs a recipient in context".to_string(),
                    )
                })?;
                let until = seconds(*cooldown_secs)
                    .and_then(|d| self.now.checked_add_signed(d))
                    .ok_or_else(|| {
                        RuleError::InvalidAction(format!(
                            "fatigue cooldown of {} seconds is out of range",
                            cooldown_secs
                        ))
                    })?;
                let entry = draft
                    .recipient_cooldowns
                    .entry(recipient.to_string())
                    .or_insert(until);
                if *entry < until {
                    *entry = until;
                }
            }
            RuleAction::SetFatigueThreshold { score } => {
                draft.fatigue_threshold = Some(*score);
            }
        }
        Ok(())
    }

    pub fn finish(self) -> RoutingPolicy {
        self.policy
    }
}

/// Summary of one evaluation pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PassSummary {
    pub fired: Vec<Uuid>,
    /// Rules whose conditions held but that lost a slot, with the owner.
    pub shadowed: Vec<(Uuid, Uuid)>,
    pub failed: Vec<(Uuid, String)>,
    pub version: u64,
}

/// Runtime side of the rule engine: keeps the rule set and latest report,
/// runs passes and publishes policies.
pub struct RuleEngine {
    config: RuleEngineConfig,
    follow_up: FollowUpConfig,
    store: Arc<dyn Store>,
    health: Arc<HealthTracker>,
    fatigue: Arc<FatigueLimiter>,
    policy: PolicyHandle,
    clock: Arc<dyn Clock>,
    persistence: Arc<PersistenceHealth>,
    rules: RwLock<Vec<AutomationRule>>,
    latest_report: RwLock<Option<PerformanceReport>>,
    /// Recipient cooldowns set by recipient-scoped rules, carried across passes.
    cooldowns: Mutex<HashMap<String, DateTime<Utc>>>,
    pass_lock: tokio::sync::Mutex<()>,
}

impl RuleEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RuleEngineConfig,
        follow_up: FollowUpConfig,
        store: Arc<dyn Store>,
        health: Arc<HealthTracker>,
        fatigue: Arc<FatigueLimiter>,
        policy: PolicyHandle,
        clock: Arc<dyn Clock>,
        persistence: Arc<PersistenceHealth>,
    ) -> Self {
        Self {
            config,
            follow_up,
            store,
            health,
            fatigue,
            policy,
            clock,
            persistence,
            rules: RwLock::new(Vec::new()),
            latest_report: RwLock::new(None),
            cooldowns: Mutex::new(HashMap::new()),
            pass_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn policy(&self) -> Arc<RoutingPolicy> {
        self.policy.current()
    }

    /// Reload rules from the store. On failure the cached set is kept.
    pub async fn reload_rules(&self) {
        let loaded = self
            .persistence
            .observe("rules.list", self.store.list_rules().await);
        if let Some(rules) = loaded {
            tracing::debug!(count = rules.len(), "Loaded automation rules");
            *self.rules.write().await = rules;
        }
    }

    pub async fn set_latest_report(&self, report: PerformanceReport) {
        *self.latest_report.write().await = Some(report);
    }

    fn carried_cooldowns(&self, now: DateTime<Utc>) -> HashMap<String, DateTime<Utc>> {
        match self.cooldowns.lock() {
            Ok(mut cooldowns) => {
                cooldowns.retain(|_, until| *until > now);
                cooldowns.clone()
            }
            Err(_) => HashMap::new(),
        }
    }

    /// Global pass: every rule that is not recipient-scoped.
    pub async fn run_pass(&self) -> PassSummary {
        let _pass = self.pass_lock.lock().await;
        let now = self.clock.now();
        let rules = self.rules.read().await.clone();
        let report = self.latest_report.read().await.clone();
        let global: Vec<AutomationRule> = rules
            .into_iter()
            .filter(|r| !is_recipient_scoped(r))
            .collect();

        let ctx = RuleContext {
            now,
            health: self.health.as_ref(),
            report: report.as_ref(),
            fatigue: None,
        };
        let fired = evaluate(&global, &ctx);

        let mut base = RoutingPolicy::baseline(&self.follow_up);
        base.recipient_cooldowns = self.carried_cooldowns(now);
        let mut builder = PolicyBuilder::new(base, None, now);

        let mut summary = PassSummary::default();
        let mut outcomes = Vec::new();
        for rule in fired {
            let result = builder.apply(rule);
            outcomes.push((rule.clone(), result));
        }
        self.settle(&mut summary, outcomes).await;

        summary.version = self.policy.publish(builder.finish());
        tracing::debug!(
            version = summary.version,
            fired = summary.fired.len(),
            shadowed = summary.shadowed.len(),
            failed = summary.failed.len(),
            "Published routing policy"
        );
        summary
    }

    /// Recipient pass: recipient-scoped rules against one recipient's
    /// fatigue record, layered on the current policy.
    pub async fn evaluate_recipient(&self, recipient_id: &str) -> PassSummary {
        let rules: Vec<AutomationRule> = self
            .rules
            .read()
            .await
            .iter()
            .filter(|r| is_recipient_scoped(r))
            .cloned()
            .collect();
        if !rules.iter().any(|r| r.active) {
            return PassSummary::default();
        }

        let record = self.fatigue.current(recipient_id).await;
        let _pass = self.pass_lock.lock().await;
        let now = self.clock.now();
        let report = self.latest_report.read().await.clone();
        let ctx = RuleContext {
            now,
            health: self.health.as_ref(),
            report: report.as_ref(),
            fatigue: Some(&record),
        };
        let fired = evaluate(&rules, &ctx);
        if fired.is_empty() {
            return PassSummary::default();
        }

        let current = self.policy.current();
        let mut builder = PolicyBuilder::new((*current).clone(), Some(recipient_id), now);
        let mut summary = PassSummary::default();
        let mut outcomes = Vec::new();
        for rule in fired {
            let result = builder.apply(rule);
            outcomes.push((rule.clone(), result));
        }
        self.settle(&mut summary, outcomes).await;

        // Only the recipient's cooldown is carried onto the live policy.
        let until = builder.finish().recipient_cooldowns.get(recipient_id).copied();
        let Some(until) = until else {
            summary.version = current.version;
            return summary;
        };
        if let Ok(mut cooldowns) = self.cooldowns.lock() {
            cooldowns.insert(recipient_id.to_string(), until);
        }
        let mut policy = (*current).clone();
        policy
            .recipient_cooldowns
            .insert(recipient_id.to_string(), until);
        summary.version = self.policy.publish(policy);
        summary
    }

    /// Record per-rule outcomes: log failures and persist `last_error`.
    async fn settle(
        &self,
        summary: &mut PassSummary,
        outcomes: Vec<(AutomationRule, ApplyResult)>,
    ) {
        for (rule, result) in outcomes {
            let last_error = match result {
                ApplyResult::Applied => {
                    summary.fired.push(rule.id);
                    tracing::debug!(rule_id = %rule.id, name = %rule.name, "Rule applied");
                    None
                }
                ApplyResult::Shadowed(owner) => {
                    summary.shadowed.push((rule.id, owner));
                    tracing::info!(
                        rule_id = %rule.id,
                        name = %rule.name,
                        owner = %owner,
                        "Rule shadowed by a higher-precedence rule"
                    );
                    None
                }
                ApplyResult::Failed(reason) => {
                    tracing::warn!(
                        audit = true,
                        rule_id = %rule.id,
                        name = %rule.name,
                        reason = %reason,
                        "Rule failed to apply, batch rolled back"
                    );
                    summary.failed.push((rule.id, reason.clone()));
                    Some(reason)
                }
            };
            if rule.last_error != last_error {
                self.record_last_error(rule, last_error).await;
            }
        }
    }

    async fn record_last_error(&self, mut rule: AutomationRule, last_error: Option<String>) {
        rule.last_error = last_error;
        rule.updated_at = self.clock.now();
        {
            let mut cached = self.rules.write().await;
            if let Some(slot) = cached.iter_mut().find(|r| r.id == rule.id) {
                *slot = rule.clone();
            }
        }
        self.persistence
            .observe("rules.update", self.store.update_rule(&rule).await);
    }

    /// Drive the engine: a pass on every interval tick, health change,
    /// report and rule change; a recipient pass when a send is counted.
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<EngineEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker =
            tokio::time::interval(StdDuration::from_secs(self.config.eval_interval_secs.max(1)));
        tracing::info!(
            interval_secs = self.config.eval_interval_secs,
            "Rule engine started"
        );
        self.reload_rules().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_pass().await;
                }
                event = events.recv() => match event {
                    Ok(EngineEvent::HealthChanged { .. }) => {
                        self.run_pass().await;
                    }
                    Ok(EngineEvent::ReportGenerated { .. }) => {
                        self.run_pass().await;
                    }
                    Ok(EngineEvent::RulesChanged) => {
                        self.reload_rules().await;
                        self.run_pass().await;
                    }
                    Ok(EngineEvent::FatigueRecorded { recipient_id }) => {
                        self.evaluate_recipient(&recipient_id).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Rule engine lagged behind events");
                        self.run_pass().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Rule engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::EventBus;
    use crate::fatigue_store::MemoryFatigueStore;
    use crate::store::MemoryStore;
    use herald_common::config::{FatigueConfig, HealthConfig};
    use herald_common::types::{Comparator, RuleType};

    fn rule(
        rule_type: RuleType,
        conditions: Vec<RuleCondition>,
        actions: Vec<RuleAction>,
    ) -> AutomationRule {
        let now = Utc::now();
        AutomationRule {
            id: Uuid::new_v4(),
            name: format!("{}", rule_type),
            rule_type,
            conditions,
            actions,
            active: true,
            priority: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn success_below(channel: Channel, threshold: f64) -> RuleCondition {
        RuleCondition {
            metric: Metric::ChannelSuccessRate { channel },
            comparator: Comparator::Lt,
            threshold,
            window_secs: None,
        }
    }

    fn tracker(clock: Arc<ManualClock>) -> HealthTracker {
        HealthTracker::new(HealthConfig::default(), clock, EventBus::new())
    }

    #[test]
    fn test_all_conditions_must_hold() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let health = tracker(clock.clone());
        for _ in 0..4 {
            health.record_outcome(Channel::Email, false, None);
        }
        let ctx = RuleContext {
            now: clock.now(),
            health: &health,
            report: None,
            fatigue: None,
        };

        let both = rule(
            RuleType::ChannelSwitch,
            vec![
                success_below(Channel::Email, 0.5),
                success_below(Channel::Push, 0.5),
            ],
            vec![RuleAction::SwitchChannel {
                from: Channel::Email,
                to: Channel::Push,
            }],
        );
        let one = rule(
            RuleType::ChannelSwitch,
            vec![success_below(Channel::Email, 0.5)],
            both.actions.clone(),
        );
        let rules = vec![both, one.clone()];
        let fired = evaluate(&rules, &ctx);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].id, one.id);
    }

    #[test]
    fn test_evaluation_order_by_precedence() {
        let retry = rule(RuleType::RetryStrategy, vec![], vec![]);
        let fatigue = rule(RuleType::FatigueManagement, vec![], vec![]);
        let mut switch_low = rule(RuleType::ChannelSwitch, vec![], vec![]);
        switch_low.priority = 1;
        let mut switch_high = rule(RuleType::ChannelSwitch, vec![], vec![]);
        switch_high.priority = 5;
        let mut inactive = rule(RuleType::FatigueManagement, vec![], vec![]);
        inactive.active = false;

        let rules = vec![
            retry.clone(),
            switch_low.clone(),
            inactive,
            fatigue.clone(),
            switch_high.clone(),
        ];
        let ids: Vec<Uuid> = evaluation_order(&rules).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![fatigue.id, switch_high.id, switch_low.id, retry.id]);
    }

    #[test]
    fn test_higher_precedence_owns_slot() {
        let now = Utc::now();
        let first = rule(
            RuleType::RetryStrategy,
            vec![],
            vec![RuleAction::SetRetryPolicy {
                priority: Some(Priority::High),
                max_retries: 1,
                delay_secs: 60,
                backoff_factor: 1.0,
            }],
        );
        let second = rule(
            RuleType::RetryStrategy,
            vec![],
            vec![RuleAction::SetRetryPolicy {
                priority: None,
                max_retries: 7,
                delay_secs: 600,
                backoff_factor: 2.0,
            }],
        );
        let mut builder =
            PolicyBuilder::new(RoutingPolicy::baseline(&FollowUpConfig::default()), None, now);
        assert_eq!(builder.apply(&first), ApplyResult::Applied);
        assert_eq!(builder.apply(&second), ApplyResult::Shadowed(first.id));
        let policy = builder.finish();
        // The second rule touches High, which is owned, so it is skipped whole.
        assert_eq!(policy.retry_for(Priority::High).unwrap().max_retries, 1);
        assert_eq!(policy.retry_for(Priority::Urgent).unwrap().max_retries, 3);
    }

    #[test]
    fn test_shadowed_batch_applies_none_of_its_actions() {
        let now = Utc::now();
        let owner = rule(
            RuleType::ChannelSwitch,
            vec![],
            vec![RuleAction::SwitchChannel {
                from: Channel::Sms,
                to: Channel::Push,
            }],
        );
        let batch = rule(
            RuleType::ChannelSwitch,
            vec![],
            vec![
                RuleAction::SwitchChannel {
                    from: Channel::Email,
                    to: Channel::InApp,
                },
                RuleAction::SwitchChannel {
                    from: Channel::Push,
                    to: Channel::Email,
                },
            ],
        );
        let mut builder =
            PolicyBuilder::new(RoutingPolicy::baseline(&FollowUpConfig::default()), None, now);
        assert_eq!(builder.apply(&owner), ApplyResult::Applied);
        assert_eq!(builder.apply(&batch), ApplyResult::Shadowed(owner.id));

        // The Email -> InApp switch is free, but it belongs to a shadowed batch.
        let policy = builder.finish();
        assert_eq!(policy.weight(Channel::Email), 0);
        assert_eq!(policy.weight(Channel::InApp), 0);
        assert_eq!(policy.weight(Channel::Push), 1);
    }

    #[test]
    fn test_oversized_cooldown_is_invalid() {
        let action = RuleAction::EnterFatigueMode {
            cooldown_secs: u64::MAX,
        };
        assert!(matches!(
            validate_action(&action),
            Err(RuleError::InvalidAction(_))
        ));

        let r = rule(RuleType::FatigueManagement, vec![], vec![action]);
        let mut builder = PolicyBuilder::new(
            RoutingPolicy::baseline(&FollowUpConfig::default()),
            Some("r1"),
            Utc::now(),
        );
        assert!(matches!(builder.apply(&r), ApplyResult::Failed(_)));
    }

    #[test]
    fn test_oversized_window_does_not_hold() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let health = tracker(clock.clone());
        for _ in 0..4 {
            health.record_outcome(Channel::Email, false, None);
        }
        let ctx = RuleContext {
            now: clock.now(),
            health: &health,
            report: None,
            fatigue: None,
        };
        let mut condition = success_below(Channel::Email, 0.5);
        condition.window_secs = Some(3600);
        assert!(ctx.holds(&condition));
        condition.window_secs = Some(u64::MAX);
        assert!(!ctx.holds(&condition));
        condition.window_secs = Some(i64::MAX as u64 / 1000);
        assert!(!ctx.holds(&condition));
    }

    #[test]
    fn test_recipient_builder_only_sets_cooldowns() {
        let retry = rule(
            RuleType::RetryStrategy,
            vec![],
            vec![RuleAction::SetRetryPolicy {
                priority: None,
                max_retries: 0,
                delay_secs: 60,
                backoff_factor: 1.0,
            }],
        );
        let base = RoutingPolicy::baseline(&FollowUpConfig::default());
        let mut scoped = PolicyBuilder::new(base.clone(), Some("r1"), Utc::now());
        assert!(matches!(scoped.apply(&retry), ApplyResult::Failed(_)));
        assert_eq!(scoped.finish(), base);
    }

    #[test]
    fn test_failed_batch_is_rolled_back() {
        let now = Utc::now();
        let bad = rule(
            RuleType::ChannelSwitch,
            vec![],
            vec![
                RuleAction::SwitchChannel {
                    from: Channel::Email,
                    to: Channel::Push,
                },
                RuleAction::SwitchChannel {
                    from: Channel::Sms,
                    to: Channel::Sms,
                },
            ],
        );
        let baseline = RoutingPolicy::baseline(&FollowUpConfig::default());
        let mut builder = PolicyBuilder::new(baseline.clone(), None, now);
        assert!(matches!(builder.apply(&bad), ApplyResult::Failed(_)));
        assert_eq!(builder.finish(), baseline);
    }

    #[test]
    fn test_action_must_match_rule_type() {
        let wrong = rule(
            RuleType::PriorityAdjustment,
            vec![],
            vec![RuleAction::SetFatigueThreshold { score: 50.0 }],
        );
        let mut builder = PolicyBuilder::new(
            RoutingPolicy::baseline(&FollowUpConfig::default()),
            None,
            Utc::now(),
        );
        assert!(matches!(builder.apply(&wrong), ApplyResult::Failed(_)));
    }

    #[test]
    fn test_fatigue_mode_needs_recipient() {
        let now = Utc::now();
        let r = rule(
            RuleType::FatigueManagement,
            vec![],
            vec![RuleAction::EnterFatigueMode {
                cooldown_secs: 600,
            }],
        );
        let base = RoutingPolicy::baseline(&FollowUpConfig::default());

        let mut global = PolicyBuilder::new(base.clone(), None, now);
        assert!(matches!(global.apply(&r), ApplyResult::Failed(_)));

        let mut scoped = PolicyBuilder::new(base, Some("r1"), now);
        assert_eq!(scoped.apply(&r), ApplyResult::Applied);
        assert_eq!(
            scoped.finish().recipient_cooldowns.get("r1"),
            Some(&(now + Duration::seconds(600)))
        );
    }

    #[test]
    fn test_windowed_report_metric_requires_fresh_report() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let health = tracker(clock.clone());
        let report = PerformanceReport {
            id: Uuid::new_v4(),
            period_start: clock.now() - Duration::hours(2),
            period_end: clock.now() - Duration::hours(1),
            generated_at: clock.now() - Duration::hours(1),
            metrics: herald_common::types::ReportMetrics {
                total_attempts: 10,
                delivered: 10,
                success_rate: 1.0,
                responses: 1,
                response_rate: 0.1,
                ..Default::default()
            },
            channels: vec![],
            recipients: vec![],
            recommendations: vec![],
            provisional: false,
        };
        let ctx = RuleContext {
            now: clock.now(),
            health: &health,
            report: Some(&report),
            fatigue: None,
        };
        let mut condition = RuleCondition {
            metric: Metric::ResponseRate,
            comparator: Comparator::Lt,
            threshold: 0.3,
            window_secs: None,
        };
        assert!(ctx.holds(&condition));
        condition.window_secs = Some(1800);
        assert!(!ctx.holds(&condition));
    }

    struct Engine {
        engine: RuleEngine,
        store: Arc<MemoryStore>,
        health: Arc<HealthTracker>,
        fatigue: Arc<FatigueLimiter>,
    }

    fn engine() -> Engine {
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
            FatigueConfig::default(),
            clock.clone(),
            events.clone(),
            Arc::new(MemoryFatigueStore::new()),
            Arc::new(PersistenceHealth::new()),
        ));
        let follow_up = FollowUpConfig::default();
        let engine = RuleEngine::new(
            RuleEngineConfig::default(),
            follow_up.clone(),
            store.clone(),
            health.clone(),
            fatigue.clone(),
            PolicyHandle::new(RoutingPolicy::baseline(&follow_up)),
            clock,
            persistence,
        );
        Engine {
            engine,
            store,
            health,
            fatigue,
        }
    }

    #[tokio::test]
    async fn test_pass_publishes_switch_and_records_failure() {
        let e = engine();
        for _ in 0..6 {
            e.health.record_outcome(Channel::Email, false, None);
        }
        let switch = rule(
            RuleType::ChannelSwitch,
            vec![success_below(Channel::Email, 0.7)],
            vec![RuleAction::SwitchChannel {
                from: Channel::Email,
                to: Channel::InApp,
            }],
        );
        let broken = rule(
            RuleType::PriorityAdjustment,
            vec![success_below(Channel::Email, 0.7)],
            vec![RuleAction::AdjustPriority { delta: 0 }],
        );
        e.store.insert_rule(&switch).await.unwrap();
        e.store.insert_rule(&broken).await.unwrap();
        e.engine.reload_rules().await;

        let summary = e.engine.run_pass().await;
        assert_eq!(summary.fired, vec![switch.id]);
        assert_eq!(summary.failed.len(), 1);

        let policy = e.engine.policy();
        assert_eq!(
            policy.order_channels(&[Channel::Email, Channel::Push, Channel::InApp]),
            vec![Channel::InApp, Channel::Push, Channel::Email]
        );
        assert_eq!(policy.priority_delta, 0);

        let stored = e.store.get_rule(broken.id).await.unwrap().unwrap();
        assert!(stored.last_error.is_some());
    }

    #[tokio::test]
    async fn test_rule_stops_applying_when_conditions_clear() {
        let e = engine();
        let adjust = rule(
            RuleType::PriorityAdjustment,
            vec![success_below(Channel::Push, 0.9)],
            vec![RuleAction::AdjustPriority { delta: 1 }],
        );
        e.store.insert_rule(&adjust).await.unwrap();
        e.engine.reload_rules().await;

        for _ in 0..5 {
            e.health.record_outcome(Channel::Push, false, None);
        }
        e.engine.run_pass().await;
        assert_eq!(e.engine.policy().priority_delta, 1);

        for _ in 0..50 {
            e.health.record_outcome(Channel::Push, true, None);
        }
        e.engine.run_pass().await;
        assert_eq!(e.engine.policy().priority_delta, 0);
    }

    #[tokio::test]
    async fn test_recipient_rule_sets_cooldown() {
        let e = engine();
        let calm = rule(
            RuleType::FatigueManagement,
            vec![RuleCondition {
                metric: Metric::DailyCount,
                comparator: Comparator::Gte,
                threshold: 2.0,
                window_secs: None,
            }],
            vec![RuleAction::EnterFatigueMode {
                cooldown_secs: 3600,
            }],
        );
        e.store.insert_rule(&calm).await.unwrap();
        e.engine.reload_rules().await;

        let policy = e.engine.policy();
        for _ in 0..2 {
            e.fatigue
                .check_and_reserve("r1", Channel::Email, Priority::Low, &policy)
                .await;
            e.fatigue.record_sent("r1", Uuid::new_v4(), &policy).await;
        }
        let summary = e.engine.evaluate_recipient("r1").await;
        assert_eq!(summary.fired, vec![calm.id]);
        assert!(e.engine.policy().recipient_cooldowns.contains_key("r1"));

        // A later global pass keeps the recipient cooldown.
        e.engine.run_pass().await;
        assert!(e.engine.policy().recipient_cooldowns.contains_key("r1"));
    }

    #[tokio::test]
    async fn test_recipient_pass_leaves_global_slots_alone() {
        let e = engine();
        let busy = RuleCondition {
            metric: Metric::DailyCount,
            comparator: Comparator::Gte,
            threshold: 1.0,
            window_secs: None,
        };
        // Stored directly, as rules saved before validation tightened would be.
        let retry = rule(
            RuleType::RetryStrategy,
            vec![busy.clone()],
            vec![RuleAction::SetRetryPolicy {
                priority: None,
                max_retries: 0,
                delay_secs: 60,
                backoff_factor: 1.0,
            }],
        );
        let calm = rule(
            RuleType::FatigueManagement,
            vec![busy],
            vec![RuleAction::EnterFatigueMode {
                cooldown_secs: 600,
            }],
        );
        e.store.insert_rule(&retry).await.unwrap();
        e.store.insert_rule(&calm).await.unwrap();
        e.engine.reload_rules().await;

        let policy = e.engine.policy();
        e.fatigue
            .check_and_reserve("r1", Channel::Email, Priority::Low, &policy)
            .await;
        e.fatigue.record_sent("r1", Uuid::new_v4(), &policy).await;

        let summary = e.engine.evaluate_recipient("r1").await;
        assert_eq!(summary.fired, vec![calm.id]);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, retry.id);

        let published = e.engine.policy();
        assert_eq!(published.retry_for(Priority::High).unwrap().max_retries, 3);
        assert_eq!(published.retry_for(Priority::Urgent).unwrap().max_retries, 3);
        assert!(published.recipient_cooldowns.contains_key("r1"));
        let stored = e.store.get_rule(retry.id).await.unwrap().unwrap();
        assert!(stored.last_error.is_some());
    }

    #[tokio::test]
    async fn test_stored_rule_with_oversized_window_does_not_panic() {
        let e = engine();
        for _ in 0..6 {
            e.health.record_outcome(Channel::Email, false, None);
        }
        let mut condition = success_below(Channel::Email, 0.7);
        condition.window_secs = Some(u64::MAX);
        let switch = rule(
            RuleType::ChannelSwitch,
            vec![condition],
            vec![RuleAction::SwitchChannel {
                from: Channel::Email,
                to: Channel::Push,
            }],
        );
        e.store.insert_rule(&switch).await.unwrap();
        e.engine.reload_rules().await;

        let summary = e.engine.run_pass().await;
        assert!(summary.fired.is_empty());
        assert_eq!(e.engine.policy().weight(Channel::Push), 0);
    }

    #[tokio::test]
    async fn test_pass_reports_shadowed_rules() {
        let e = engine();
        let mut first = rule(
            RuleType::PriorityAdjustment,
            vec![],
            vec![RuleAction::AdjustPriority { delta: 1 }],
        );
        first.priority = 5;
        let second = rule(
            RuleType::PriorityAdjustment,
            vec![],
            vec![RuleAction::AdjustPriority { delta: -2 }],
        );
        e.store.insert_rule(&first).await.unwrap();
        e.store.insert_rule(&second).await.unwrap();
        e.engine.reload_rules().await;

        let summary = e.engine.run_pass().await;
        assert_eq!(summary.fired, vec![first.id]);
        assert_eq!(summary.shadowed, vec![(second.id, first.id)]);
        assert!(summary.failed.is_empty());
        assert_eq!(e.engine.policy().priority_delta, 1);
    }
}
