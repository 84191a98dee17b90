//! Routing policy snapshot shared between the rule engine and dispatch.
//!
//! The rule engine builds a fresh [`RoutingPolicy`] on every evaluation pass
//! and publishes it through a `watch` channel. Readers take an `Arc` of the
//! current snapshot and never wait on rule evaluation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use herald_common::config::FollowUpConfig;
use herald_common::types::{Channel, Priority};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay_secs: u64,
    /// Multiplier applied to the delay for every follow-up round.
    pub backoff_factor: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingPolicy {
    pub version: u64,
    /// Channel preference. Higher sorts first; absent means 0.
    pub channel_weights: HashMap<Channel, i32>,
    /// Applied to every non-urgent request's priority.
    pub priority_delta: i8,
    /// Follow-up policy per priority; priorities without an entry get none.
    pub retry: HashMap<Priority, RetryPolicy>,
    /// Overrides the configured fatigue score threshold.
    pub fatigue_threshold: Option<f64>,
    /// Rule-imposed cooldowns per recipient.
    pub recipient_cooldowns: HashMap<String, DateTime<Utc>>,
}

impl RoutingPolicy {
    /// Policy with no rule effects: declared channel order, no priority
    /// shift and the configured follow-up timing.
    pub fn baseline(follow_up: &FollowUpConfig) -> Self {
        let mut retry = HashMap::new();
        retry.insert(
            Priority::High,
            RetryPolicy {
                max_retries: follow_up.max_retries,
                delay_secs: follow_up.high_delay_secs,
                backoff_factor: follow_up.backoff_factor,
            },
        );
        retry.insert(
            Priority::Urgent,
            RetryPolicy {
                max_retries: follow_up.max_retries,
                delay_secs: follow_up.urgent_delay_secs,
                backoff_factor: follow_up.backoff_factor,
            },
        );
        Self {
            version: 0,
            channel_weights: HashMap::new(),
            priority_delta: 0,
            retry,
            fatigue_threshold: None,
            recipient_cooldowns: HashMap::new(),
        }
    }

    pub fn weight(&self, channel: Channel) -> i32 {
        self.channel_weights.get(&channel).copied().unwrap_or(0)
    }

    /// Reorder `channels` by weight, keeping the declared order among equals.
    pub fn order_channels(&self, channels: &[Channel]) -> Vec<Channel> {
        let mut ordered: Vec<Channel> = Vec::with_capacity(channels.len());
        for c in channels {
            if !ordered.contains(c) {
                ordered.push(*c);
            }
        }
        ordered.sort_by_key(|c| std::cmp::Reverse(self.weight(*c)));
        ordered
    }

    pub fn effective_priority(&self, priority: Priority) -> Priority {
        priority.shifted(self.priority_delta)
    }

    pub fn retry_for(&self, priority: Priority) -> Option<&RetryPolicy> {
        self.retry.get(&priority)
    }

    pub fn recipient_cooldown(
        &self,
        recipient_id: &str,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        self.recipient_cooldowns
            .get(recipient_id)
            .copied()
            .filter(|until| *until > now)
    }
}

/// Publisher side of the policy snapshot.
#[derive(Clone)]
pub struct PolicyHandle {
    tx: Arc<watch::Sender<Arc<RoutingPolicy>>>,
}

impl PolicyHandle {
    pub fn new(initial: RoutingPolicy) -> Self {
        let (tx, _) = watch::channel(Arc::new(initial));
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> Arc<RoutingPolicy> {
        self.tx.borrow().clone()
    }

    /// Publish a new snapshot, stamping it with the next version.
    pub fn publish(&self, mut policy: RoutingPolicy) -> u64 {
        let version = self.tx.borrow().version + 1;
        policy.version = version;
        self.tx.send_replace(Arc::new(policy));
        version
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<RoutingPolicy>> {
        self.tx.subscribe()
    }
}
