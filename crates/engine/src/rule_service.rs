//! Rule administration: create, list, update, toggle and delete automation
//! rules. Every change is validated and announced on the event bus so the
//! rule engine reloads.

use std::sync::Arc;

use serde::Deserialize;
use uuid::Uuid;

use herald_common::config::MAX_DURATION_SECS;
use herald_common::types::{AutomationRule, RuleAction, RuleCondition, RuleType};

use crate::clock::Clock;
use crate::events::{EngineEvent, EventBus};
use crate::rules::{RuleError, is_recipient_scoped, validate_action};
use crate::store::Store;

/// Parameters for creating a new rule.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRuleParams {
    pub name: String,
    pub rule_type: RuleType,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    pub actions: Vec<RuleAction>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub priority: Option<i32>,
}

/// Parameters for updating an existing rule; absent fields are kept.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateRuleParams {
    pub name: Option<String>,
    pub rule_type: Option<RuleType>,
    pub conditions: Option<Vec<RuleCondition>>,
    pub actions: Option<Vec<RuleAction>>,
    pub active: Option<bool>,
    pub priority: Option<i32>,
}

pub struct RuleService {
    store: Arc<dyn Store>,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl RuleService {
    pub fn new(store: Arc<dyn Store>, events: EventBus, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            events,
            clock,
        }
    }

    pub fn validate(rule: &AutomationRule) -> Result<(), RuleError> {
        if rule.name.trim().is_empty() {
            return Err(RuleError::Validation("name must not be empty".to_string()));
        }
        if rule.actions.is_empty() {
            return Err(RuleError::Validation(
                "a rule needs at least one action".to_string(),
            ));
        }
        for condition in &rule.conditions {
            if !condition.threshold.is_finite() {
                return Err(RuleError::Validation(format!(
                    "threshold for {} must be a finite number",
                    condition.metric
                )));
            }
            if condition.window_secs == Some(0) {
                return Err(RuleError::Validation(format!(
                    "window for {} must be positive",
                    condition.metric
                )));
            }
            if condition.window_secs.is_some_and(|w| w > MAX_DURATION_SECS) {
                return Err(RuleError::Validation(format!(
                    "window for {} must be at most {} seconds",
                    condition.metric, MAX_DURATION_SECS
                )));
            }
        }
        let scoped = is_recipient_scoped(rule);
        for action in &rule.actions {
            if action.rule_type() != rule.rule_type {
                return Err(RuleError::Validation(format!(
                    "{} rules cannot carry a {} action",
                    rule.rule_type,
                    action.rule_type()
                )));
            }
            validate_action(action).map_err(|e| RuleError::Validation(e.to_string()))?;
            if scoped && !matches!(action, RuleAction::EnterFatigueMode { .. }) {
                return Err(RuleError::Validation(format!(
                    "rules on recipient fatigue can only enter fatigue mode, got {:?}",
                    action
                )));
            }
        }
        Ok(())
    }

    pub async fn create(&self, params: CreateRuleParams) -> Result<AutomationRule, RuleError> {
        let now = self.clock.now();
        let rule = AutomationRule {
            id: Uuid::new_v4(),
            name: params.name,
            rule_type: params.rule_type,
            conditions: params.conditions,
            actions: params.actions,
            active: params.active.unwrap_or(true),
            priority: params.priority.unwrap_or(0),
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        Self::validate(&rule)?;
        self.store.insert_rule(&rule).await?;

        tracing::info!(
            rule_id = %rule.id,
            rule_type = %rule.rule_type,
            name = %rule.name,
            "Rule created"
        );
        self.events.publish(EngineEvent::RulesChanged);
        Ok(rule)
    }

    pub async fn list(&self) -> Result<Vec<AutomationRule>, RuleError> {
        Ok(self.store.list_rules().await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<AutomationRule, RuleError> {
        self.store
            .get_rule(id)
            .await?
            .ok_or(RuleError::NotFound(id))
    }

    pub async fn update(
        &self,
        id: Uuid,
        params: UpdateRuleParams,
    ) -> Result<AutomationRule, RuleError> {
        let mut rule = self.get(id).await?;
        if let Some(name) = params.name {
            rule.name = name;
        }
        if let Some(rule_type) = params.rule_type {
            rule.rule_type = rule_type;
        }
        if let Some(conditions) = params.conditions {
            rule.conditions = conditions;
        }
        if let Some(actions) = params.actions {
            rule.actions = actions;
        }
        if let Some(active) = params.active {
            rule.active = active;
        }
        if let Some(priority) = params.priority {
            rule.priority = priority;
        }
        // An edited rule gets a fresh chance to apply.
        rule.last_error = None;
        rule.updated_at = self.clock.now();
        Self::validate(&rule)?;

        if !self.store.update_rule(&rule).await? {
            return Err(RuleError::NotFound(id));
        }
        tracing::info!(rule_id = %id, active = rule.active, "Rule updated");
        self.events.publish(EngineEvent::RulesChanged);
        Ok(rule)
    }

    /// Flip the active flag.
    pub async fn toggle(&self, id: Uuid) -> Result<AutomationRule, RuleError> {
        let mut rule = self.get(id).await?;
        rule.active = !rule.active;
        rule.updated_at = self.clock.now();
        if !self.store.update_rule(&rule).await? {
            return Err(RuleError::NotFound(id));
        }
        tracing::info!(rule_id = %id, active = rule.active, "Rule toggled");
        self.events.publish(EngineEvent::RulesChanged);
        Ok(rule)
    }

    /// Returns `true` if the rule existed.
    pub async fn delete(&self, id: Uuid) -> Result<bool, RuleError> {
        let deleted = self.store.delete_rule(id).await?;
        if deleted {
            tracing::info!(rule_id = %id, "Rule deleted");
            self.events.publish(EngineEvent::RulesChanged);
        }
        Ok(deleted)
    }
}
