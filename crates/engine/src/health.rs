//! Channel health tracker.
//!
//! Keeps a sliding window of delivery outcomes per channel and classifies
//! each channel as active, degraded or inactive. Transitions are hysteresis
//! based: a channel only becomes inactive after it has been degraded and
//! stayed below the inactive floor for several consecutive outcomes, and it
//! only recovers after a streak of successes.
//!
//! An inactive channel is re-admitted as degraded once `readmit_after_secs`
//! have passed, so fresh traffic can prove it healthy again. The readmission is
//! evaluated lazily whenever the channel's health is read.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use herald_common::config::HealthConfig;
use herald_common::types::{Channel, ChannelHealth, HealthStatus, PerformanceReport};

use crate::clock::{Clock, seconds};
use crate::events::{EngineEvent, EventBus};

/// Attempt ids remembered per channel for replay detection.
const RECENT_IDS_CAP: usize = 1024;

#[derive(Debug, Clone)]
struct Sample {
    success: bool,
    latency_ms: Option<f64>,
    at: DateTime<Utc>,
}

#[derive(Debug)]
struct ChannelState {
    samples: VecDeque<Sample>,
    status: HealthStatus,
    below_floor_streak: u32,
    success_streak: u32,
    inactive_since: Option<DateTime<Utc>>,
    latency_ceiling_ms: f64,
    recent_ids: VecDeque<Uuid>,
    seen: HashSet<Uuid>,
    last_checked: DateTime<Utc>,
}

impl ChannelState {
    fn new(ceiling: f64, now: DateTime<Utc>) -> Self {
        Self {
            samples: VecDeque::new(),
            status: HealthStatus::Active,
            below_floor_streak: 0,
            success_streak: 0,
            inactive_since: None,
            latency_ceiling_ms: ceiling,
            recent_ids: VecDeque::new(),
            seen: HashSet::new(),
            last_checked: now,
        }
    }

    fn success_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 1.0;
        }
        let ok = self.samples.iter().filter(|s| s.success).count();
        ok as f64 / self.samples.len() as f64
    }

    fn avg_latency_ms(&self) -> f64 {
        let latencies: Vec<f64> = self.samples.iter().filter_map(|s| s.latency_ms).collect();
        if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        }
    }

    fn prune(&mut self, config: &HealthConfig, now: DateTime<Utc>) {
        // A window too long to subtract keeps every sample until the size cap.
        if let Some(horizon) = seconds(config.window_secs).and_then(|w| now.checked_sub_signed(w)) {
            while self.samples.front().is_some_and(|s| s.at < horizon) {
                self.samples.pop_front();
            }
        }
        while self.samples.len() > config.window_size {
            self.samples.pop_front();
        }
    }

    /// Returns `true` if the id was not seen before.
    fn remember(&mut self, id: Uuid) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.recent_ids.push_back(id);
        if self.recent_ids.len() > RECENT_IDS_CAP
            && let Some(old) = self.recent_ids.pop_front()
        {
            self.seen.remove(&old);
        }
        true
    }

    fn enter(&mut self, status: HealthStatus, now: DateTime<Utc>) {
        self.status = status;
        self.below_floor_streak = 0;
        self.success_streak = 0;
        self.inactive_since = (status == HealthStatus::Inactive).then_some(now);
    }

    /// Re-admit an inactive channel once its readmission delay has elapsed.
    fn maybe_readmit(&mut self, config: &HealthConfig, now: DateTime<Utc>) -> Option<HealthStatus> {
        let since = self.inactive_since?;
        if self.status != HealthStatus::Inactive
            || seconds(config.readmit_after_secs).is_none_or(|delay| now - since < delay)
        {
            return None;
        }
        self.samples.clear();
        self.enter(HealthStatus::Degraded, now);
        Some(HealthStatus::Inactive)
    }

    /// Apply the transition rules after a new sample. Returns the previous
    /// status when it changed.
    fn evaluate(&mut self, config: &HealthConfig, now: DateTime<Utc>) -> Option<HealthStatus> {
        let rate = self.success_rate();
        let latency = self.avg_latency_ms();
        let enough = self.samples.len() >= config.min_samples;
        let slow = latency > self.latency_ceiling_ms;

        if rate < config.inactive_threshold {
            self.below_floor_streak += 1;
        } else {
            self.below_floor_streak = 0;
        }

        let previous = self.status;
        let next = match self.status {
            HealthStatus::Active if enough && (rate < config.degraded_threshold || slow) => {
                HealthStatus::Degraded
            }
            HealthStatus::Degraded
                if rate < config.inactive_threshold
                    && self.below_floor_streak >= config.inactive_sustain =>
            {
                HealthStatus::Inactive
            }
            HealthStatus::Degraded
                if self.success_streak >= config.recovery_successes
                    && rate >= config.degraded_threshold
                    && !slow =>
            {
                HealthStatus::Active
            }
            current => current,
        };

        if next != previous {
            self.enter(next, now);
            Some(previous)
        } else {
            None
        }
    }

    fn view(&self, channel: Channel) -> ChannelHealth {
        ChannelHealth {
            channel,
            success_rate: self.success_rate(),
            avg_latency_ms: self.avg_latency_ms(),
            status: self.status,
            sample_size: self.samples.len(),
            last_checked: self.last_checked,
        }
    }
}

/// Success rate and latency of a channel over a trailing window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub samples: usize,
}

pub struct HealthTracker {
    config: HealthConfig,
    clock: Arc<dyn Clock>,
    events: EventBus,
    channels: HashMap<Channel, Mutex<ChannelState>>,
}

impl HealthTracker {
    pub fn new(config: HealthConfig, clock: Arc<dyn Clock>, events: EventBus) -> Self {
        let now = clock.now();
        let channels = Channel::ALL
            .into_iter()
            .map(|c| (c, Mutex::new(ChannelState::new(config.latency_ceiling_ms, now))))
            .collect();
        Self {
            config,
            clock,
            events,
            channels,
        }
    }

    /// Record an anonymous outcome.
    pub fn record_outcome(&self, channel: Channel, success: bool, latency_ms: Option<u64>) {
        self.record(None, channel, success, latency_ms);
    }

    /// Record the outcome of a specific attempt. Replays of the same attempt
    /// id are ignored; returns `false` in that case.
    pub fn record_attempt(
        &self,
        attempt_id: Uuid,
        channel: Channel,
        success: bool,
        latency_ms: Option<u64>,
    ) -> bool {
        self.record(Some(attempt_id), channel, success, latency_ms)
    }

    fn record(
        &self,
        attempt_id: Option<Uuid>,
        channel: Channel,
        success: bool,
        latency_ms: Option<u64>,
    ) -> bool {
        let Some(slot) = self.channels.get(&channel) else {
            return false;
        };
        let now = self.clock.now();

        let (recorded, transitions) = {
            let Ok(mut state) = slot.lock() else {
                return false;
            };
            if let Some(id) = attempt_id
                && !state.remember(id)
            {
                tracing::debug!(attempt_id = %id, channel = %channel, "Outcome already recorded");
                return false;
            }

            let mut transitions = Vec::new();
            if let Some(from) = state.maybe_readmit(&self.config, now) {
                transitions.push((from, state.status));
            }

            state.samples.push_back(Sample {
                success,
                latency_ms: latency_ms.map(|l| l as f64),
                at: now,
            });
            state.prune(&self.config, now);
            state.last_checked = now;
            if success {
                state.success_streak += 1;
            } else {
                state.success_streak = 0;
            }

            if let Some(from) = state.evaluate(&self.config, now) {
                transitions.push((from, state.status));
            }
            (true, transitions)
        };

        for (from, to) in transitions {
            self.announce(channel, from, to);
        }
        recorded
    }

    fn announce(&self, channel: Channel, from: HealthStatus, to: HealthStatus) {
        if to == HealthStatus::Active {
            tracing::info!(channel = %channel, from = %from, to = %to, "Channel health changed");
        } else {
            tracing::warn!(channel = %channel, from = %from, to = %to, "Channel health changed");
        }
        self.events
            .publish(EngineEvent::HealthChanged { channel, from, to });
    }

    /// Current health of one channel.
    pub fn health(&self, channel: Channel) -> ChannelHealth {
        let now = self.clock.now();
        let Some(slot) = self.channels.get(&channel) else {
            return ChannelState::new(self.config.latency_ceiling_ms, now).view(channel);
        };
        let (view, readmitted) = match slot.lock() {
            Ok(mut state) => {
                state.prune(&self.config, now);
                let readmitted = state.maybe_readmit(&self.config, now);
                (state.view(channel), readmitted)
            }
            Err(_) => (
                ChannelState::new(self.config.latency_ceiling_ms, now).view(channel),
                None,
            ),
        };
        if let Some(from) = readmitted {
            self.announce(channel, from, view.status);
        }
        view
    }

    /// Health of every channel, in `Channel::ALL` order.
    pub fn snapshot(&self) -> Vec<ChannelHealth> {
        Channel::ALL.into_iter().map(|c| self.health(c)).collect()
    }

    pub fn is_routable(&self, channel: Channel) -> bool {
        self.health(channel).status != HealthStatus::Inactive
    }

    /// Outcomes within the last `window` only. `None` when there are none.
    pub fn window_stats(&self, channel: Channel, window: Duration) -> Option<WindowStats> {
        let since = self.clock.now().checked_sub_signed(window)?;
        let state = self.channels.get(&channel)?.lock().ok()?;
        let recent: Vec<&Sample> = state.samples.iter().filter(|s| s.at >= since).collect();
        if recent.is_empty() {
            return None;
        }
        let ok = recent.iter().filter(|s| s.success).count();
        let latencies: Vec<f64> = recent.iter().filter_map(|s| s.latency_ms).collect();
        Some(WindowStats {
            success_rate: ok as f64 / recent.len() as f64,
            avg_latency_ms: if latencies.is_empty() {
                0.0
            } else {
                latencies.iter().sum::<f64>() / latencies.len() as f64
            },
            samples: recent.len(),
        })
    }

    /// Operator override of a channel's status.
    pub fn set_status(&self, channel: Channel, status: HealthStatus) {
        let now = self.clock.now();
        let previous = match self.channels.get(&channel).map(|s| s.lock()) {
            Some(Ok(mut state)) => {
                let previous = state.status;
                state.enter(status, now);
                state.last_checked = now;
                previous
            }
            _ => return,
        };
        if previous != status {
            self.announce(channel, previous, status);
        }
    }

    /// Raise per-channel latency ceilings for channels that are slow by
    /// nature, based on a generated report.
    pub fn adapt_to_report(&self, report: &PerformanceReport) {
        for breakdown in &report.channels {
            if breakdown.delivered == 0 || breakdown.avg_latency_ms <= 0.0 {
                continue;
            }
            let adapted = (breakdown.avg_latency_ms * self.config.adaptive_latency_factor)
                .max(self.config.latency_ceiling_ms);
            if let Some(Ok(mut state)) = self.channels.get(&breakdown.channel).map(|s| s.lock())
                && (state.latency_ceiling_ms - adapted).abs() > f64::EPSILON
            {
                tracing::debug!(
                    channel = %breakdown.channel,
                    ceiling_ms = adapted,
                    "Adjusted latency ceiling"
                );
                state.latency_ceiling_ms = adapted;
            }
        }
    }

    pub fn latency_ceiling_ms(&self, channel: Channel) -> f64 {
        self.channels
            .get(&channel)
            .and_then(|s| s.lock().ok().map(|s| s.latency_ceiling_ms))
            .unwrap_or(self.config.latency_ceiling_ms)
    }
}
