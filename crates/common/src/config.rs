use std::str::FromStr;

use serde::Deserialize;

/// Upper bound for any configured or rule-supplied length of time.
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 3600;

/// Sliding-window and hysteresis settings for channel health.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Maximum outcomes kept per channel.
    pub window_size: usize,
    /// Outcomes older than this fall out of the window.
    pub window_secs: u64,
    /// `active -> degraded` below this success rate.
    pub degraded_threshold: f64,
    /// `degraded -> inactive` below this success rate, once sustained.
    pub inactive_threshold: f64,
    /// `active -> degraded` when average latency exceeds this.
    pub latency_ceiling_ms: f64,
    /// No transitions before a channel has this many outcomes.
    pub min_samples: usize,
    /// Consecutive below-floor outcomes needed for `degraded -> inactive`.
    pub inactive_sustain: u32,
    /// Consecutive successes needed for `degraded -> active`.
    pub recovery_successes: u32,
    /// An inactive channel is re-admitted (as degraded) after this long.
    pub readmit_after_secs: u64,
    /// Latency ceiling grows to this multiple of a channel's reported average.
    pub adaptive_latency_factor: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_size: 50,
            window_secs: 900,
            degraded_threshold: 0.8,
            inactive_threshold: 0.5,
            latency_ceiling_ms: 60_000.0,
            min_samples: 5,
            inactive_sustain: 3,
            recovery_successes: 5,
            readmit_after_secs: 300,
            adaptive_latency_factor: 2.0,
        }
    }
}

/// Per-recipient throttling settings.
#[derive(Debug, Clone, Deserialize)]
pub struct FatigueConfig {
    pub daily_cap: u32,
    /// Default score above which a recipient enters cooldown (rules may override).
    pub score_threshold: f64,
    /// Cooldown length per score point above the threshold.
    pub cooldown_per_point_secs: u64,
    /// Decay constant for the recency component of the score.
    pub recency_decay_secs: u64,
    /// Offset from UTC of the daily counter reset.
    pub reset_offset_minutes: i32,
}

impl Default for FatigueConfig {
    fn default() -> Self {
        Self {
            daily_cap: 5,
            score_threshold: 80.0,
            cooldown_per_point_secs: 90,
            recency_decay_secs: 3600,
            reset_offset_minutes: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Upper bound on a single adapter call.
    pub send_timeout_ms: u64,
    /// In-flight attempts allowed per channel.
    pub max_in_flight_per_channel: usize,
    pub queue_capacity: usize,
    pub workers: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: 10_000,
            max_in_flight_per_channel: 64,
            queue_capacity: 1024,
            workers: 4,
        }
    }
}

/// Baseline follow-up policy before any retry-strategy rule applies.
#[derive(Debug, Clone, Deserialize)]
pub struct FollowUpConfig {
    pub high_delay_secs: u64,
    pub urgent_delay_secs: u64,
    pub max_retries: u32,
    pub backoff_factor: f64,
}

impl Default for FollowUpConfig {
    fn default() -> Self {
        Self {
            high_delay_secs: 24 * 3600,
            urgent_delay_secs: 3600,
            max_retries: 3,
            backoff_factor: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleEngineConfig {
    pub eval_interval_secs: u64,
}

impl Default for RuleEngineConfig {
    fn default() -> Self {
        Self {
            eval_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyticsConfig {
    /// Channels below this success rate get a switch recommendation.
    pub target_success_rate: f64,
    /// Below this response rate a content recommendation is made.
    pub target_response_rate: f64,
    /// Above this average response time a timing recommendation is made.
    pub target_response_time_secs: f64,
    /// How often the scheduled report runs.
    pub report_interval_secs: u64,
    /// Length of the trailing period a scheduled report covers.
    pub report_period_secs: u64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            target_success_rate: 0.7,
            target_response_rate: 0.3,
            target_response_time_secs: 3600.0,
            report_interval_secs: 3600,
            report_period_secs: 24 * 3600,
        }
    }
}

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string; without it everything is kept in memory
    pub database_url: Option<String>,

    /// Redis connection string for fatigue counters
    pub redis_url: Option<String>,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// HTTP listen port (default: 3000)
    pub http_port: u16,

    /// Emit JSON logs instead of the human formatter
    pub log_json: bool,

    /// Resend API key for email delivery
    pub resend_api_key: Option<String>,

    /// Email sender address
    pub email_from: Option<String>,

    /// Push gateway endpoint
    pub push_gateway_url: Option<String>,

    /// In-app socket gateway endpoint
    pub inapp_gateway_url: Option<String>,

    /// JSON file with notification templates
    pub templates_path: Option<String>,

    pub health: HealthConfig,
    pub fatigue: FatigueConfig,
    pub dispatch: DispatchConfig,
    pub follow_up: FollowUpConfig,
    pub rules: RuleEngineConfig,
    pub analytics: AnalyticsConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: None,
            db_max_connections: 20,
            http_port: 3000,
            log_json: false,
            resend_api_key: None,
            email_from: None,
            push_gateway_url: None,
            inapp_gateway_url: None,
            templates_path: None,
            health: HealthConfig::default(),
            fatigue: FatigueConfig::default(),
            dispatch: DispatchConfig::default(),
            follow_up: FollowUpConfig::default(),
            rules: RuleEngineConfig::default(),
            analytics: AnalyticsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let d = Self::default();

        let config = Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            redis_url: std::env::var("REDIS_URL").ok(),
            db_max_connections: env_or("DB_MAX_CONNECTIONS", d.db_max_connections)?,
            http_port: env_or("HTTP_PORT", d.http_port)?,
            log_json: std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")),
            resend_api_key: std::env::var("RESEND_API_KEY").ok(),
            email_from: std::env::var("EMAIL_FROM").ok(),
            push_gateway_url: std::env::var("PUSH_GATEWAY_URL").ok(),
            inapp_gateway_url: std::env::var("INAPP_GATEWAY_URL").ok(),
            templates_path: std::env::var("TEMPLATES_PATH").ok(),
            health: HealthConfig {
                window_size: env_or("HEALTH_WINDOW_SIZE", d.health.window_size)?,
                window_secs: env_or("HEALTH_WINDOW_SECS", d.health.window_secs)?,
                degraded_threshold: env_or(
                    "HEALTH_DEGRADED_THRESHOLD",
                    d.health.degraded_threshold,
                )?,
                inactive_threshold: env_or(
                    "HEALTH_INACTIVE_THRESHOLD",
                    d.health.inactive_threshold,
                )?,
                latency_ceiling_ms: env_or(
                    "HEALTH_LATENCY_CEILING_MS",
                    d.health.latency_ceiling_ms,
                )?,
                min_samples: env_or("HEALTH_MIN_SAMPLES", d.health.min_samples)?,
                inactive_sustain: env_or("HEALTH_INACTIVE_SUSTAIN", d.health.inactive_sustain)?,
                recovery_successes: env_or(
                    "HEALTH_RECOVERY_SUCCESSES",
                    d.health.recovery_successes,
                )?,
                readmit_after_secs: env_or(
                    "HEALTH_READMIT_AFTER_SECS",
                    d.health.readmit_after_secs,
                )?,
                adaptive_latency_factor: d.health.adaptive_latency_factor,
            },
            fatigue: FatigueConfig {
                daily_cap: env_or("FATIGUE_DAILY_CAP", d.fatigue.daily_cap)?,
                score_threshold: env_or("FATIGUE_SCORE_THRESHOLD", d.fatigue.score_threshold)?,
                cooldown_per_point_secs: env_or(
                    "FATIGUE_COOLDOWN_PER_POINT_SECS",
                    d.fatigue.cooldown_per_point_secs,
                )?,
                recency_decay_secs: env_or(
                    "FATIGUE_RECENCY_DECAY_SECS",
                    d.fatigue.recency_decay_secs,
                )?,
                reset_offset_minutes: env_or(
                    "FATIGUE_RESET_OFFSET_MINUTES",
                    d.fatigue.reset_offset_minutes,
                )?,
            },
            dispatch: DispatchConfig {
                send_timeout_ms: env_or("DISPATCH_SEND_TIMEOUT_MS", d.dispatch.send_timeout_ms)?,
                max_in_flight_per_channel: env_or(
                    "DISPATCH_MAX_IN_FLIGHT",
                    d.dispatch.max_in_flight_per_channel,
                )?,
                queue_capacity: env_or("DISPATCH_QUEUE_CAPACITY", d.dispatch.queue_capacity)?,
                workers: env_or("DISPATCH_WORKERS", d.dispatch.workers)?,
            },
            follow_up: FollowUpConfig {
                high_delay_secs: env_or("FOLLOWUP_HIGH_DELAY_SECS", d.follow_up.high_delay_secs)?,
                urgent_delay_secs: env_or(
                    "FOLLOWUP_URGENT_DELAY_SECS",
                    d.follow_up.urgent_delay_secs,
                )?,
                max_retries: env_or("FOLLOWUP_MAX_RETRIES", d.follow_up.max_retries)?,
                backoff_factor: env_or("FOLLOWUP_BACKOFF_FACTOR", d.follow_up.backoff_factor)?,
            },
            rules: RuleEngineConfig {
                eval_interval_secs: env_or("RULES_EVAL_INTERVAL_SECS", d.rules.eval_interval_secs)?,
            },
            analytics: AnalyticsConfig {
                target_success_rate: env_or(
                    "ANALYTICS_TARGET_SUCCESS_RATE",
                    d.analytics.target_success_rate,
                )?,
                report_interval_secs: env_or(
                    "REPORT_INTERVAL_SECS",
                    d.analytics.report_interval_secs,
                )?,
                ..d.analytics
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject lengths of time the engine cannot represent as a date offset.
    pub fn validate(&self) -> anyhow::Result<()> {
        let durations = [
            ("HEALTH_WINDOW_SECS", self.health.window_secs),
            ("HEALTH_READMIT_AFTER_SECS", self.health.readmit_after_secs),
            ("FATIGUE_COOLDOWN_PER_POINT_SECS", self.fatigue.cooldown_per_point_secs),
            ("FATIGUE_RECENCY_DECAY_SECS", self.fatigue.recency_decay_secs),
            ("FOLLOWUP_HIGH_DELAY_SECS", self.follow_up.high_delay_secs),
            ("FOLLOWUP_URGENT_DELAY_SECS", self.follow_up.urgent_delay_secs),
            ("RULES_EVAL_INTERVAL_SECS", self.rules.eval_interval_secs),
            ("REPORT_INTERVAL_SECS", self.analytics.report_interval_secs),
            ("REPORT_PERIOD_SECS", self.analytics.report_period_secs),
        ];
        for (key, secs) in durations {
            if secs > MAX_DURATION_SECS {
                anyhow::bail!(
                    "{} must be at most {} seconds, got {}",
                    key,
                    MAX_DURATION_SECS,
                    secs
                );
            }
        }
        Ok(())
    }
}

/// Read `key` from the environment, falling back to `default` when unset.
fn env_or<T: FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> anyhow::Result<T> {
    raw.trim().parse().map_err(|_| {
        anyhow::anyhow!(
            "{} must be a valid {}, got '{}'",
            key,
            std::any::type_name::<T>(),
            raw
        )
    })
}
