use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Delivery transport a notification can go out on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Push,
    InApp,
    Sms,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::Email, Channel::Push, Channel::InApp, Channel::Sms];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Push => "push",
            Channel::InApp => "in_app",
            Channel::Sms => "sms",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| AppError::Validation(format!("Unknown channel '{}'", s)))
    }
}

/// Notification priority. Ordering follows urgency (`Low < Urgent`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Medium,
        Priority::High,
        Priority::Urgent,
    ];

    /// High and urgent notifications expect the recipient to respond.
    pub fn requires_ack(&self) -> bool {
        matches!(self, Priority::High | Priority::Urgent)
    }

    /// Shift a priority by `delta` steps.
    ///
    /// Urgent is never produced or removed by a shift: urgent requests stay
    /// urgent and everything else is clamped to `Low..=High`.
    pub fn shifted(self, delta: i8) -> Priority {
        if self == Priority::Urgent {
            return self;
        }
        let idx = (self as i8 + delta).clamp(Priority::Low as i8, Priority::High as i8);
        Priority::ALL[idx as usize]
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Urgent => write!(f, "urgent"),
        }
    }
}

/// A request to notify one recipient. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub id: Uuid,
    pub recipient_id: String,
    pub template_id: String,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    pub priority: Priority,
    /// Candidate channels in the caller's preferred order.
    pub channels: Vec<Channel>,
    pub created_at: DateTime<Utc>,
}

impl NotificationRequest {
    pub fn new(
        recipient_id: impl Into<String>,
        template_id: impl Into<String>,
        priority: Priority,
        channels: Vec<Channel>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            recipient_id: recipient_id.into(),
            template_id: template_id.into(),
            variables: HashMap::new(),
            priority,
            channels,
            created_at: Utc::now(),
        }
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// Lifecycle of a request as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Deferred,
    Delivered,
    Undeliverable,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::Pending => write!(f, "pending"),
            RequestStatus::Deferred => write!(f, "deferred"),
            RequestStatus::Delivered => write!(f, "delivered"),
            RequestStatus::Undeliverable => write!(f, "undeliverable"),
        }
    }
}

/// Status of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
}

impl AttemptStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptStatus::Delivered | AttemptStatus::Failed)
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptStatus::Pending => write!(f, "pending"),
            AttemptStatus::Sent => write!(f, "sent"),
            AttemptStatus::Delivered => write!(f, "delivered"),
            AttemptStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Why an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Transport hiccup (5xx, connection reset); other channels are tried.
    Transient,
    /// The adapter did not answer within the per-attempt timeout.
    Timeout,
    /// The channel rejected the recipient (bad or missing address).
    Permanent,
}

/// One delivery attempt of a request on one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationAttempt {
    pub id: Uuid,
    pub request_id: Uuid,
    pub recipient_id: String,
    pub channel: Channel,
    pub attempt_number: u32,
    pub status: AttemptStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub latency_ms: Option<u64>,
    pub failure: Option<FailureKind>,
    pub error_detail: Option<String>,
    /// Set when the attempt was made by a follow-up task.
    pub follow_up_id: Option<Uuid>,
}

impl NotificationAttempt {
    pub fn is_delivered(&self) -> bool {
        self.status == AttemptStatus::Delivered
    }
}

/// Health classification of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Active,
    Degraded,
    Inactive,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Active => write!(f, "active"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Inactive => write!(f, "inactive"),
        }
    }
}

/// Rolling health of one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelHealth {
    pub channel: Channel,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub status: HealthStatus,
    pub sample_size: usize,
    pub last_checked: DateTime<Utc>,
}

/// Per-recipient fatigue state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FatigueRecord {
    pub recipient_id: String,
    /// Reset day the counter belongs to.
    pub day: NaiveDate,
    pub daily_count: u32,
    pub fatigue_score: f64,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Attempt ids already counted, newest last.
    #[serde(default)]
    pub counted_attempts: Vec<Uuid>,
}

impl FatigueRecord {
    pub fn new(recipient_id: impl Into<String>, day: NaiveDate) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            day,
            daily_count: 0,
            fatigue_score: 0.0,
            last_sent_at: None,
            cooldown_until: None,
            counted_attempts: Vec::new(),
        }
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }
}

/// Largest UTC offset a recipient's local time may have.
pub const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;

/// Quiet hours in the recipient's local time. `start == end` is an empty
/// window and `start > end` wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoNotDisturb {
    pub start: NaiveTime,
    pub end: NaiveTime,
    /// Offset of the recipient's local time from UTC.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl DoNotDisturb {
    fn offset(&self) -> TimeDelta {
        let minutes = self
            .utc_offset_minutes
            .clamp(-MAX_UTC_OFFSET_MINUTES, MAX_UTC_OFFSET_MINUTES);
        TimeDelta::minutes(i64::from(minutes))
    }

    fn local(&self, now: DateTime<Utc>) -> NaiveDateTime {
        now.naive_utc() + self.offset()
    }

    pub fn covers(&self, now: DateTime<Utc>) -> bool {
        let time = self.local(now).time();
        if self.start <= self.end {
            self.start <= time && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }

    /// The first moment after `now` at which the window closes.
    pub fn ends_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = self.local(now);
        let mut end = local.date().and_time(self.end);
        if end <= local {
            end += TimeDelta::days(1);
        }
        (end - self.offset()).and_utc()
    }
}

/// Delivery preferences a recipient controls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientPreferences {
    pub recipient_id: String,
    /// Channels the recipient does not want to be reached on.
    #[serde(default)]
    pub opted_out: Vec<Channel>,
    #[serde(default)]
    pub do_not_disturb: Option<DoNotDisturb>,
    pub updated_at: DateTime<Utc>,
}

impl RecipientPreferences {
    pub fn new(recipient_id: impl Into<String>, updated_at: DateTime<Utc>) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            opted_out: Vec::new(),
            do_not_disturb: None,
            updated_at,
        }
    }

    pub fn allows(&self, channel: Channel) -> bool {
        !self.opted_out.contains(&channel)
    }

    /// When a send at `priority` may go out if quiet hours hold it back.
    /// Urgent sends ignore quiet hours.
    pub fn quiet_until(&self, priority: Priority, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if priority == Priority::Urgent {
            return None;
        }
        let dnd = self.do_not_disturb?;
        dnd.covers(now).then(|| dnd.ends_after(now))
    }
}

/// Kind of automation rule. Also fixes evaluation precedence.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    FatigueManagement,
    ChannelSwitch,
    PriorityAdjustment,
    RetryStrategy,
}

impl RuleType {
    /// Lower runs first; earlier rules own what they set within a pass.
    pub fn precedence(&self) -> u8 {
        match self {
            RuleType::FatigueManagement => 0,
            RuleType::ChannelSwitch => 1,
            RuleType::PriorityAdjustment => 2,
            RuleType::RetryStrategy => 3,
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleType::FatigueManagement => write!(f, "fatigue_management"),
            RuleType::ChannelSwitch => write!(f, "channel_switch"),
            RuleType::PriorityAdjustment => write!(f, "priority_adjustment"),
            RuleType::RetryStrategy => write!(f, "retry_strategy"),
        }
    }
}

/// A metric a rule condition can read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Metric {
    ChannelSuccessRate { channel: Channel },
    ChannelLatencyMs { channel: Channel },
    ChannelResponseRate { channel: Channel },
    OverallSuccessRate,
    ResponseRate,
    AverageResponseTimeSecs,
    FatigueScore,
    DailyCount,
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::ChannelSuccessRate { channel } => write!(f, "{}.success_rate", channel),
            Metric::ChannelLatencyMs { channel } => write!(f, "{}.latency_ms", channel),
            Metric::ChannelResponseRate { channel } => write!(f, "{}.response_rate", channel),
            Metric::OverallSuccessRate => write!(f, "success_rate"),
            Metric::ResponseRate => write!(f, "response_rate"),
            Metric::AverageResponseTimeSecs => write!(f, "avg_response_time_secs"),
            Metric::FatigueScore => write!(f, "fatigue_score"),
            Metric::DailyCount => write!(f, "daily_count"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    Ne,
}

impl Comparator {
    pub fn compare(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::Lt => value < threshold,
            Comparator::Lte => value <= threshold,
            Comparator::Gt => value > threshold,
            Comparator::Gte => value >= threshold,
            Comparator::Eq => (value - threshold).abs() < f64::EPSILON,
            Comparator::Ne => (value - threshold).abs() >= f64::EPSILON,
        }
    }
}

/// `metric <comparator> threshold`, optionally over a trailing window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCondition {
    pub metric: Metric,
    pub comparator: Comparator,
    pub threshold: f64,
    #[serde(default)]
    pub window_secs: Option<u64>,
}

/// Typed effect of a fired rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    SwitchChannel {
        from: Channel,
        to: Channel,
    },
    AdjustPriority {
        delta: i8,
    },
    SetRetryPolicy {
        /// `None` applies to every priority that expects a response.
        #[serde(default)]
        priority: Option<Priority>,
        max_retries: u32,
        delay_secs: u64,
        #[serde(default = "default_backoff_factor")]
        backoff_factor: f64,
    },
    EnterFatigueMode {
        cooldown_secs: u64,
    },
    SetFatigueThreshold {
        score: f64,
    },
}

fn default_backoff_factor() -> f64 {
    1.0
}

impl RuleAction {
    /// The rule type this action belongs to.
    pub fn rule_type(&self) -> RuleType {
        match self {
            RuleAction::SwitchChannel { .. } => RuleType::ChannelSwitch,
            RuleAction::AdjustPriority { .. } => RuleType::PriorityAdjustment,
            RuleAction::SetRetryPolicy { .. } => RuleType::RetryStrategy,
            RuleAction::EnterFatigueMode { .. } | RuleAction::SetFatigueThreshold { .. } => {
                RuleType::FatigueManagement
            }
        }
    }
}

/// Operator-defined condition -> action policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: Uuid,
    pub name: String,
    pub rule_type: RuleType,
    pub conditions: Vec<RuleCondition>,
    pub actions: Vec<RuleAction>,
    pub active: bool,
    /// Tie-breaker among rules of the same type; higher runs first.
    pub priority: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FollowUpStatus {
    Scheduled,
    Due,
    Dispatched,
    Succeeded,
    Exhausted,
    Canceled,
}

impl FollowUpStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FollowUpStatus::Succeeded | FollowUpStatus::Exhausted | FollowUpStatus::Canceled
        )
    }
}

impl fmt::Display for FollowUpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FollowUpStatus::Scheduled => write!(f, "scheduled"),
            FollowUpStatus::Due => write!(f, "due"),
            FollowUpStatus::Dispatched => write!(f, "dispatched"),
            FollowUpStatus::Succeeded => write!(f, "succeeded"),
            FollowUpStatus::Exhausted => write!(f, "exhausted"),
            FollowUpStatus::Canceled => write!(f, "canceled"),
        }
    }
}

impl FromStr for FollowUpStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(FollowUpStatus::Scheduled),
            "due" => Ok(FollowUpStatus::Due),
            "dispatched" => Ok(FollowUpStatus::Dispatched),
            "succeeded" => Ok(FollowUpStatus::Succeeded),
            "exhausted" => Ok(FollowUpStatus::Exhausted),
            "canceled" => Ok(FollowUpStatus::Canceled),
            other => Err(AppError::Validation(format!(
                "Unknown follow-up status '{}'",
                other
            ))),
        }
    }
}

/// A pending re-dispatch for a notification nobody responded to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUpTask {
    pub id: Uuid,
    pub request_id: Uuid,
    pub origin_attempt_id: Uuid,
    /// Most recent attempt made for this task (the origin until it fires).
    pub last_attempt_id: Uuid,
    pub recipient_id: String,
    pub priority: Priority,
    pub current_channel: Channel,
    pub target_channel: Option<Channel>,
    /// Channel order used to pick the next channel.
    pub escalation: Vec<Channel>,
    pub due_at: DateTime<Utc>,
    pub remaining_retries: u32,
    pub rounds: u32,
    pub delay_secs: u64,
    pub backoff_factor: f64,
    pub status: FollowUpStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    Read,
    Click,
    Dismiss,
    Ignore,
}

/// A recipient reacted to an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEvent {
    pub id: Uuid,
    pub attempt_id: Uuid,
    pub response_type: ResponseType,
    pub responded_at: DateTime<Utc>,
}

impl ResponseEvent {
    pub fn new(attempt_id: Uuid, response_type: ResponseType, responded_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            attempt_id,
            response_type,
            responded_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationType {
    Channel,
    Timing,
    Content,
    Priority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub kind: RecommendationType,
    pub channel: Option<Channel>,
    pub description: String,
    pub impact: Impact,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelBreakdown {
    pub channel: Channel,
    pub attempts: u64,
    pub delivered: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub responses: u64,
    pub response_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientEngagement {
    pub recipient_id: String,
    pub delivered: u64,
    pub responses: u64,
    pub engagement_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportMetrics {
    pub total_requests: u64,
    pub total_attempts: u64,
    pub delivered: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub responses: u64,
    pub response_rate: f64,
    pub avg_response_time_secs: f64,
}

/// Aggregated outcomes over a period. Immutable once generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub metrics: ReportMetrics,
    pub channels: Vec<ChannelBreakdown>,
    pub recipients: Vec<RecipientEngagement>,
    pub recommendations: Vec<Recommendation>,
    /// Generated while persistence was unavailable; may be incomplete.
    pub provisional: bool,
}

impl PerformanceReport {
    pub fn channel(&self, channel: Channel) -> Option<&ChannelBreakdown> {
        self.channels.iter().find(|c| c.channel == channel)
    }
}

/// Template output handed to a channel adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub subject: Option<String>,
    pub body: String,
}
