//! Per-recipient fatigue limiter.
//!
//! The fatigue score grows quadratically with the day's send count and is
//! weighted by how recent the last send was:
//!
//! `score = 100 * (count / cap)^2 * (1 + e^(-elapsed / decay)) / 2`
//!
//! When a send pushes the score above the threshold, the recipient enters a
//! cooldown proportional to the overage. Urgent requests bypass both the cap
//! and the cooldown; the bypass is logged for audit.
//!
//! Checks reserve a slot so two concurrent dispatches to the same recipient
//! cannot both slip under the cap. Every reservation is settled by either
//! [`FatigueLimiter::record_sent`] or [`FatigueLimiter::release`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Offset, Utc};
use uuid::Uuid;

use herald_common::config::FatigueConfig;
use herald_common::types::{Channel, FatigueRecord, Priority};

use crate::clock::Clock;
use crate::events::{EngineEvent, EventBus};
use crate::fatigue_store::FatigueStore;
use crate::policy::RoutingPolicy;
use crate::store::PersistenceHealth;

/// Counted attempt ids kept per record for replay detection.
const COUNTED_IDS_CAP: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FatigueDecision {
    Allowed,
    /// Urgent request let through despite the recipient being blocked.
    Bypassed,
    Blocked { until: DateTime<Utc> },
}

impl FatigueDecision {
    pub fn permits(&self) -> bool {
        !matches!(self, FatigueDecision::Blocked { .. })
    }
}

pub struct FatigueLimiter {
    config: FatigueConfig,
    clock: Arc<dyn Clock>,
    events: EventBus,
    store: Arc<dyn FatigueStore>,
    persistence: Arc<PersistenceHealth>,
    /// Last known record per recipient; used when the store is unreachable.
    cache: Mutex<HashMap<String, FatigueRecord>>,
    /// Outstanding reservations per recipient.
    reserved: Mutex<HashMap<String, u32>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FatigueLimiter {
    pub fn new(
        config: FatigueConfig,
        clock: Arc<dyn Clock>,
        events: EventBus,
        store: Arc<dyn FatigueStore>,
        persistence: Arc<PersistenceHealth>,
    ) -> Self {
        Self {
            config,
            clock,
            events,
            store,
            persistence,
            cache: Mutex::new(HashMap::new()),
            reserved: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.config.reset_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix())
    }

    /// The counter day `now` falls in.
    pub fn day_of(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.offset()).date_naive()
    }

    /// When the counter for `now`'s day resets.
    pub fn next_reset(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let tomorrow = self.day_of(now).succ_opt().unwrap_or(NaiveDate::MAX);
        tomorrow
            .and_hms_opt(0, 0, 0)
            .and_then(|midnight| midnight.and_local_timezone(self.offset()).single())
            .map(|local| local.with_timezone(&Utc))
            .unwrap_or(now + Duration::days(1))
    }

    pub fn score(
        &self,
        daily_count: u32,
        last_sent_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> f64 {
        if self.config.daily_cap == 0 || daily_count == 0 {
            return 0.0;
        }
        let ratio = daily_count as f64 / self.config.daily_cap as f64;
        let recency = match last_sent_at {
            Some(at) => {
                let elapsed = (now - at).num_seconds().max(0) as f64;
                (-elapsed / self.config.recency_decay_secs.max(1) as f64).exp()
            }
            None => 0.0,
        };
        100.0 * ratio * ratio * (1.0 + recency) / 2.0
    }

    fn lock_for(&self, recipient_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        match self.locks.lock() {
            Ok(mut locks) => locks
                .entry(recipient_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone(),
            Err(_) => Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn reserved_for(&self, recipient_id: &str) -> u32 {
        self.reserved
            .lock()
            .ok()
            .and_then(|r| r.get(recipient_id).copied())
            .unwrap_or(0)
    }

    fn adjust_reservation(&self, recipient_id: &str, add: bool) {
        if let Ok(mut reserved) = self.reserved.lock() {
            let entry = reserved.entry(recipient_id.to_string()).or_insert(0);
            if add {
                *entry += 1;
            } else {
                *entry = entry.saturating_sub(1);
                if *entry == 0 {
                    reserved.remove(recipient_id);
                }
            }
        }
    }

    /// Load a record, rolled over to today. Falls back to the in-memory copy
    /// when the store is unreachable.
    async fn load(&self, recipient_id: &str, now: DateTime<Utc>) -> FatigueRecord {
        let today = self.day_of(now);
        let loaded = self
            .persistence
            .observe("fatigue.load", self.store.load(recipient_id).await);
        let record = match loaded {
            Some(record) => record,
            None => self
                .cache
                .lock()
                .ok()
                .and_then(|c| c.get(recipient_id).cloned()),
        };

        match record {
            Some(record) if record.day == today => record,
            Some(stale) => {
                // Counters reset daily; a cooldown may still straddle midnight.
                let mut fresh = FatigueRecord::new(recipient_id, today);
                fresh.cooldown_until = stale.cooldown_until.filter(|until| *until > now);
                fresh
            }
            None => FatigueRecord::new(recipient_id, today),
        }
    }

    async fn save(&self, record: &FatigueRecord, now: DateTime<Utc>) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(record.recipient_id.clone(), record.clone());
        }
        let mut expires_at = self.next_reset(now);
        if let Some(until) = record.cooldown_until
            && until > expires_at
        {
            expires_at = until;
        }
        self.persistence
            .observe("fatigue.save", self.store.save(record, expires_at).await);
    }

    /// Decide whether `recipient_id` may receive a notification now.
    ///
    /// A permitting decision holds a reservation that must be settled with
    /// `record_sent` or `release`.
    pub async fn check_and_reserve(
        &self,
        recipient_id: &str,
        channel: Channel,
        priority: Priority,
        policy: &RoutingPolicy,
    ) -> FatigueDecision {
        let lock = self.lock_for(recipient_id);
        let _guard = lock.lock().await;
        let now = self.clock.now();
        let record = self.load(recipient_id, now).await;

        let pending = self.reserved_for(recipient_id);
        let mut blocked_until: Option<DateTime<Utc>> = None;
        if record.daily_count + pending >= self.config.daily_cap {
            blocked_until = Some(self.next_reset(now));
        }
        let cooldown = [
            record.cooldown_until.filter(|u| *u > now),
            policy.recipient_cooldown(recipient_id, now),
        ]
        .into_iter()
        .flatten()
        .max();
        if let Some(until) = cooldown {
            blocked_until = Some(blocked_until.map_or(until, |b| b.max(until)));
        }

        let decision = match blocked_until {
            None => FatigueDecision::Allowed,
            Some(_) if priority == Priority::Urgent => {
                tracing::info!(
                    audit = true,
                    recipient_id,
                    channel = %channel,
                    daily_count = record.daily_count,
                    "Urgent notification bypassed fatigue limits"
                );
                FatigueDecision::Bypassed
            }
            Some(until) => {
                tracing::debug!(
                    recipient_id,
                    channel = %channel,
                    daily_count = record.daily_count,
                    until = %until,
                    "Recipient fatigued, blocking send"
                );
                FatigueDecision::Blocked { until }
            }
        };

        if decision.permits() {
            self.adjust_reservation(recipient_id, true);
        }
        decision
    }

    /// Give back a reservation whose send did not happen or failed.
    pub fn release(&self, recipient_id: &str) {
        self.adjust_reservation(recipient_id, false);
    }

    /// Count a delivered attempt. Settles one reservation; replays of the
    /// same attempt id leave the record untouched.
    pub async fn record_sent(
        &self,
        recipient_id: &str,
        attempt_id: Uuid,
        policy: &RoutingPolicy,
    ) -> FatigueRecord {
        let lock = self.lock_for(recipient_id);
        let _guard = lock.lock().await;
        let now = self.clock.now();
        let mut record = self.load(recipient_id, now).await;

        if record.counted_attempts.contains(&attempt_id) {
            tracing::debug!(recipient_id, attempt_id = %attempt_id, "Send already counted");
            return record;
        }
        self.adjust_reservation(recipient_id, false);

        record.counted_attempts.push(attempt_id);
        if record.counted_attempts.len() > COUNTED_IDS_CAP {
            record.counted_attempts.remove(0);
        }
        record.daily_count += 1;
        record.last_sent_at = Some(now);
        record.fatigue_score = self.score(record.daily_count, record.last_sent_at, now);

        let threshold = policy
            .fatigue_threshold
            .unwrap_or(self.config.score_threshold);
        let mut entered_cooldown = None;
        if record.fatigue_score > threshold {
            let overage = record.fatigue_score - threshold;
            let secs = (self.config.cooldown_per_point_secs as f64 * overage).round() as i64;
            let until = Duration::try_seconds(secs).and_then(|d| now.checked_add_signed(d));
            if let Some(until) = until
                && record.cooldown_until.is_none_or(|current| current < until)
            {
                record.cooldown_until = Some(until);
                entered_cooldown = Some(until);
            }
        }

        self.save(&record, now).await;

        self.events.publish(EngineEvent::FatigueRecorded {
            recipient_id: recipient_id.to_string(),
        });
        if let Some(until) = entered_cooldown {
            tracing::info!(
                recipient_id,
                score = record.fatigue_score,
                threshold,
                until = %until,
                "Recipient entered fatigue cooldown"
            );
            self.events.publish(EngineEvent::FatigueCooldown {
                recipient_id: recipient_id.to_string(),
                until,
            });
        }
        record
    }

    /// Current record with the score decayed to now.
    pub async fn current(&self, recipient_id: &str) -> FatigueRecord {
        let now = self.clock.now();
        let mut record = self.load(recipient_id, now).await;
        record.fatigue_score = self.score(record.daily_count, record.last_sent_at, now);
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fatigue_store::MemoryFatigueStore;
    use chrono::TimeZone;
    use herald_common::config::FollowUpConfig;

    struct Fixture {
        limiter: FatigueLimiter,
        clock: Arc<ManualClock>,
        store: Arc<MemoryFatigueStore>,
        policy: RoutingPolicy,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryFatigueStore::new());
        let limiter = FatigueLimiter::new(
            FatigueConfig::default(),
            clock.clone(),
            EventBus::new(),
            store.clone(),
            Arc::new(PersistenceHealth::new()),
        );
        Fixture {
            limiter,
            clock,
            store,
            policy: RoutingPolicy::baseline(&FollowUpConfig::default()),
        }
    }

    async fn send(f: &Fixture, recipient: &str) -> FatigueRecord {
        let decision = f
            .limiter
            .check_and_reserve(recipient, Channel::Email, Priority::Low, &f.policy)
            .await;
        assert!(decision.permits());
        f.limiter
            .record_sent(recipient, Uuid::new_v4(), &f.policy)
            .await
    }

    #[test]
    fn test_score_grows_superlinearly() {
        let f = fixture();
        let now = f.clock.now();
        let s1 = f.limiter.score(1, Some(now), now);
        let s2 = f.limiter.score(2, Some(now), now);
        let s4 = f.limiter.score(4, Some(now), now);
        assert!((s1 - 4.0).abs() < 1e-9);
        assert!((s2 - 16.0).abs() < 1e-9);
        assert!((s4 - 64.0).abs() < 1e-9);
        // Recency decays toward half weight.
        let later = now + Duration::hours(12);
        assert!(f.limiter.score(4, Some(now), later) < 33.0);
    }

    #[tokio::test]
    async fn test_cap_blocks_non_urgent_but_not_urgent() {
        let f = fixture();
        for _ in 0..4 {
            send(&f, "r1").await;
        }
        // Fifth send reaches the cap and crosses the score threshold.
        let record = send(&f, "r1").await;
        assert_eq!(record.daily_count, 5);
        assert!(record.cooldown_until.is_some());

        let blocked = f
            .limiter
            .check_and_reserve("r1", Channel::Push, Priority::High, &f.policy)
            .await;
        assert!(matches!(blocked, FatigueDecision::Blocked { .. }));

        let urgent = f
            .limiter
            .check_and_reserve("r1", Channel::Push, Priority::Urgent, &f.policy)
            .await;
        assert_eq!(urgent, FatigueDecision::Bypassed);
    }

    #[tokio::test]
    async fn test_cooldown_proportional_to_overage() {
        let f = fixture();
        let mut record = None;
        for _ in 0..5 {
            record = Some(send(&f, "r1").await);
        }
        let record = record.unwrap();
        // score 100, threshold 80, 90s per point.
        assert_eq!(
            record.cooldown_until,
            Some(f.clock.now() + Duration::seconds(1800))
        );
    }

    #[tokio::test]
    async fn test_policy_threshold_override() {
        let mut f = fixture();
        f.policy.fatigue_threshold = Some(10.0);
        send(&f, "r1").await;
        let record = send(&f, "r1").await;
        // score 16 > 10
        assert_eq!(
            record.cooldown_until,
            Some(f.clock.now() + Duration::seconds(540))
        );
    }

    #[tokio::test]
    async fn test_reservations_count_toward_cap() {
        let f = fixture();
        for _ in 0..5 {
            let d = f
                .limiter
                .check_and_reserve("r1", Channel::Email, Priority::Medium, &f.policy)
                .await;
            assert!(d.permits());
        }
        let sixth = f
            .limiter
            .check_and_reserve("r1", Channel::Email, Priority::Medium, &f.policy)
            .await;
        assert!(!sixth.permits());

        f.limiter.release("r1");
        let retry = f
            .limiter
            .check_and_reserve("r1", Channel::Email, Priority::Medium, &f.policy)
            .await;
        assert!(retry.permits());
    }

    #[tokio::test]
    async fn test_replayed_attempt_counted_once() {
        let f = fixture();
        let id = Uuid::new_v4();
        f.limiter
            .check_and_reserve("r1", Channel::Email, Priority::Low, &f.policy)
            .await;
        f.limiter.record_sent("r1", id, &f.policy).await;
        let again = f.limiter.record_sent("r1", id, &f.policy).await;
        assert_eq!(again.daily_count, 1);
    }

    #[tokio::test]
    async fn test_daily_reset() {
        let f = fixture();
        for _ in 0..3 {
            send(&f, "r1").await;
        }
        f.clock.advance(Duration::hours(15));
        let record = f.limiter.current("r1").await;
        assert_eq!(record.daily_count, 0);
        assert_eq!(record.day, NaiveDate::from_ymd_opt(2024, 3, 2).unwrap());
    }

    #[tokio::test]
    async fn test_counts_survive_restart() {
        let f = fixture();
        send(&f, "r1").await;
        send(&f, "r1").await;

        let restarted = FatigueLimiter::new(
            FatigueConfig::default(),
            f.clock.clone(),
            EventBus::new(),
            f.store.clone(),
            Arc::new(PersistenceHealth::new()),
        );
        assert_eq!(restarted.current("r1").await.daily_count, 2);
    }

    #[tokio::test]
    async fn test_store_outage_uses_memory() {
        let f = fixture();
        send(&f, "r1").await;
        f.store.set_available(false);
        let record = send(&f, "r1").await;
        assert_eq!(record.daily_count, 2);
        assert!(f.limiter.persistence.is_degraded());
    }

    #[test]
    fn test_next_reset_respects_offset() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 23, 30, 0).unwrap(),
        ));
        let limiter = FatigueLimiter::new(
            FatigueConfig {
                reset_offset_minutes: 120,
                ..FatigueConfig::default()
            },
            clock.clone(),
            EventBus::new(),
            Arc::new(MemoryFatigueStore::new()),
            Arc::new(PersistenceHealth::new()),
        );
        let now = clock.now();
        // 23:30 UTC is 01:30 on March 2nd at UTC+2.
        assert_eq!(limiter.day_of(now), NaiveDate::from_ymd_opt(2024, 3, 2).unwrap());
        assert_eq!(
            limiter.next_reset(now),
            Utc.with_ymd_and_hms(2024, 3, 2, 22, 0, 0).unwrap()
        );
    }
}
