//! Analytics aggregator: rolls stored attempts and responses up into
//! performance reports with recommendations.
//!
//! Aggregation is a pure function of the attempts and responses in the
//! period, so the same inputs always give the same metrics and
//! recommendations. Reports are appended to the report log and handed to
//! the health tracker and rule engine, closing the feedback loop.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use herald_common::config::AnalyticsConfig;
use herald_common::error::AppError;
use herald_common::types::{
    Channel, ChannelBreakdown, Impact, NotificationAttempt, PerformanceReport, Recommendation,
    RecommendationType, RecipientEngagement, ReportMetrics, ResponseEvent, ResponseType,
};

use crate::clock::Clock;
use crate::events::{EngineEvent, EventBus};
use crate::health::HealthTracker;
use crate::rules::RuleEngine;
use crate::store::{PersistenceHealth, Store, StoreError};

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("period end {end} is not after start {start}")]
    InvalidPeriod {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<AnalyticsError> for AppError {
    fn from(err: AnalyticsError) -> Self {
        match err {
            AnalyticsError::InvalidPeriod { .. } => AppError::Validation(err.to_string()),
            AnalyticsError::Store(e) => e.into(),
        }
    }
}

/// Everything in a report except its identity and timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub metrics: ReportMetrics,
    pub channels: Vec<ChannelBreakdown>,
    pub recipients: Vec<RecipientEngagement>,
    pub recommendations: Vec<Recommendation>,
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Impact of missing a target by `gap` (a fraction).
pub fn impact_for_gap(gap: f64) -> Impact {
    if gap >= 0.3 {
        Impact::High
    } else if gap >= 0.15 {
        Impact::Medium
    } else {
        Impact::Low
    }
}

/// An ignored notification ends the wait for a response but is not
/// engagement.
fn is_engagement(response: &ResponseEvent) -> bool {
    response.response_type != ResponseType::Ignore
}

#[derive(Default)]
struct ChannelTally {
    attempts: u64,
    delivered: u64,
    failed: u64,
    latency_sum: f64,
    latency_samples: u64,
    responses: u64,
}

/// Aggregate `attempts` and `responses` against the configured targets.
pub fn aggregate(
    config: &AnalyticsConfig,
    attempts: &[NotificationAttempt],
    responses: &[ResponseEvent],
) -> Aggregate {
    let by_id: HashMap<Uuid, &NotificationAttempt> = attempts.iter().map(|a| (a.id, a)).collect();

    // First engaging response per attempt in the period.
    let mut first_response: HashMap<Uuid, DateTime<Utc>> = HashMap::new();
    for response in responses.iter().filter(|r| is_engagement(r)) {
        if !by_id.contains_key(&response.attempt_id) {
            continue;
        }
        first_response
            .entry(response.attempt_id)
            .and_modify(|at| *at = (*at).min(response.responded_at))
            .or_insert(response.responded_at);
    }

    let mut channels: BTreeMap<Channel, ChannelTally> = BTreeMap::new();
    let mut recipients: BTreeMap<&str, (u64, u64)> = BTreeMap::new();
    let mut requests: HashSet<Uuid> = HashSet::new();
    let mut delivered = 0u64;
    let mut response_secs = 0.0;

    for attempt in attempts {
        requests.insert(attempt.request_id);
        let tally = channels.entry(attempt.channel).or_default();
        tally.attempts += 1;
        if !attempt.is_delivered() {
            tally.failed += 1;
            continue;
        }
        delivered += 1;
        tally.delivered += 1;
        if let Some(latency) = attempt.latency_ms {
            tally.latency_sum += latency as f64;
            tally.latency_samples += 1;
        }
        let engagement = recipients.entry(attempt.recipient_id.as_str()).or_default();
        engagement.0 += 1;
        if let Some(responded_at) = first_response.get(&attempt.id) {
            tally.responses += 1;
            engagement.1 += 1;
            let sent_at = attempt.completed_at.unwrap_or(attempt.started_at);
            response_secs += (*responded_at - sent_at).num_milliseconds().max(0) as f64 / 1000.0;
        }
    }

    let total_attempts = attempts.len() as u64;
    let responded = first_response
        .keys()
        .filter(|id| by_id.get(*id).is_some_and(|a| a.is_delivered()))
        .count() as u64;
    let metrics = ReportMetrics {
        total_requests: requests.len() as u64,
        total_attempts,
        delivered,
        failed: total_attempts - delivered,
        success_rate: ratio(delivered, total_attempts),
        responses: responded,
        response_rate: ratio(responded, delivered),
        avg_response_time_secs: if responded == 0 {
            0.0
        } else {
            response_secs / responded as f64
        },
    };

    let channels: Vec<ChannelBreakdown> = channels
        .into_iter()
        .map(|(channel, t)| ChannelBreakdown {
            channel,
            attempts: t.attempts,
            delivered: t.delivered,
            failed: t.failed,
            success_rate: ratio(t.delivered, t.attempts),
            avg_latency_ms: if t.latency_samples == 0 {
                0.0
            } else {
                t.latency_sum / t.latency_samples as f64
            },
            responses: t.responses,
            response_rate: ratio(t.responses, t.delivered),
        })
        .collect();

    let recipients: Vec<RecipientEngagement> = recipients
        .into_iter()
        .map(|(recipient_id, (delivered, responses))| RecipientEngagement {
            recipient_id: recipient_id.to_string(),
            delivered,
            responses,
            engagement_rate: ratio(responses, delivered),
        })
        .collect();

    let recommendations = recommend(config, &metrics, &channels, &recipients);
    Aggregate {
        metrics,
        channels,
        recipients,
        recommendations,
    }
}

fn recommend(
    config: &AnalyticsConfig,
    metrics: &ReportMetrics,
    channels: &[ChannelBreakdown],
    recipients: &[RecipientEngagement],
) -> Vec<Recommendation> {
    let mut recommendations = Vec::new();
    if metrics.total_attempts == 0 {
        return recommendations;
    }

    for breakdown in channels {
        let gap = config.target_success_rate - breakdown.success_rate;
        if breakdown.attempts > 0 && gap > 0.0 {
            recommendations.push(Recommendation {
                kind: RecommendationType::Channel,
                channel: Some(breakdown.channel),
                description: format!(
                    "{} success rate {:.0}% is below the {:.0}% target; prefer another channel",
                    breakdown.channel,
                    breakdown.success_rate * 100.0,
                    config.target_success_rate * 100.0
                ),
                impact: impact_for_gap(gap),
            });
        }
    }

    if metrics.responses > 0
        && config.target_response_time_secs > 0.0
        && metrics.avg_response_time_secs > config.target_response_time_secs
    {
        let overage = metrics.avg_response_time_secs / config.target_response_time_secs - 1.0;
        recommendations.push(Recommendation {
            kind: RecommendationType::Timing,
            channel: None,
            description: format!(
                "recipients take {:.0}s on average to respond; send closer to when they are active",
                metrics.avg_response_time_secs
            ),
            impact: impact_for_gap(overage),
        });
    }

    if metrics.delivered > 0 && metrics.response_rate < config.target_response_rate {
        recommendations.push(Recommendation {
            kind: RecommendationType::Content,
            channel: None,
            description: format!(
                "response rate {:.0}% is below the {:.0}% target; revise notification content",
                metrics.response_rate * 100.0,
                config.target_response_rate * 100.0
            ),
            impact: impact_for_gap(config.target_response_rate - metrics.response_rate),
        });
    }

    let unengaged = recipients.iter().filter(|r| r.responses == 0).count();
    if recipients.len() >= 2 && unengaged * 2 > recipients.len() {
        let share = unengaged as f64 / recipients.len() as f64;
        recommendations.push(Recommendation {
            kind: RecommendationType::Priority,
            channel: None,
            description: format!(
                "{} of {} recipients never responded; lower the priority of their notifications",
                unengaged,
                recipients.len()
            ),
            impact: impact_for_gap(share - 0.5),
        });
    }

    recommendations
}

pub struct AnalyticsAggregator {
    config: AnalyticsConfig,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    persistence: Arc<PersistenceHealth>,
    health: Arc<HealthTracker>,
    rules: Arc<RuleEngine>,
}

impl AnalyticsAggregator {
    pub fn new(
        config: AnalyticsConfig,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        persistence: Arc<PersistenceHealth>,
        health: Arc<HealthTracker>,
        rules: Arc<RuleEngine>,
    ) -> Self {
        Self {
            config,
            store,
            clock,
            events,
            persistence,
            health,
            rules,
        }
    }

    /// Build, store and publish a report over `[start, end)`.
    pub async fn generate_report(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<PerformanceReport, AnalyticsError> {
        if end <= start {
            return Err(AnalyticsError::InvalidPeriod { start, end });
        }
        // Writes that failed earlier are missing from the log.
        let mut provisional = self.persistence.is_degraded();

        let attempts = self.store.attempts_between(start, end).await?;
        let responses = self.store.responses_between(start, end).await?;
        let aggregate = aggregate(&self.config, &attempts, &responses);

        let mut report = PerformanceReport {
            id: Uuid::new_v4(),
            period_start: start,
            period_end: end,
            generated_at: self.clock.now(),
            metrics: aggregate.metrics,
            channels: aggregate.channels,
            recipients: aggregate.recipients,
            recommendations: aggregate.recommendations,
            provisional,
        };
        if self
            .persistence
            .observe("report.insert", self.store.insert_report(&report).await)
            .is_none()
        {
            provisional = true;
            report.provisional = provisional;
        }

        tracing::info!(
            report_id = %report.id,
            attempts = report.metrics.total_attempts,
            success_rate = report.metrics.success_rate,
            recommendations = report.recommendations.len(),
            provisional,
            "Performance report generated"
        );

        self.health.adapt_to_report(&report);
        self.rules.set_latest_report(report.clone()).await;
        self.events.publish(EngineEvent::ReportGenerated {
            report_id: report.id,
        });
        Ok(report)
    }

    /// Newest reports first.
    pub async fn reports(&self, limit: usize) -> Result<Vec<PerformanceReport>, AnalyticsError> {
        Ok(self.store.list_reports(limit).await?)
    }

    /// Generate a report over the trailing period on every interval tick.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = StdDuration::from_secs(self.config.report_interval_secs.max(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        tracing::info!(
            interval_secs = self.config.report_interval_secs,
            "Analytics aggregator started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let end = self.clock.now();
                    let start = end - TimeDelta::seconds(self.config.report_period_secs as i64);
                    if let Err(e) = self.generate_report(start, end).await {
                        tracing::error!(error = %e, "Scheduled report failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Analytics aggregator stopped");
    }
}
