use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::time::TargetZone;
use crate::types::UserId;

pub const DEFAULT_USER_ID: &str = "adm";
pub const DEFAULT_UTC_OFFSET: &str = "+07:00";
pub const DEFAULT_INITIAL_DELAY_SECS: u64 = 5 * 3600;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 3600;
pub const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 7;
pub const DEFAULT_TICK_MS: u64 = 1_000;
pub const DEFAULT_ABORT_TIMEOUT_SECS: u64 = 13 * 3600;
pub const DEFAULT_INACTIVITY_TIMEOUT_SECS: u64 = 2 * 3600;

/// Top-level config (dayclose.toml + DAYCLOSE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaycloseConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub closing: ClosingConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// When the daily trigger fires, expressed in the target zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
    #[serde(default)]
    pub hour: u32,
    #[serde(default)]
    pub minute: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            utc_offset: default_utc_offset(),
            hour: 0,
            minute: 0,
        }
    }
}

impl ScheduleConfig {
    pub fn zone(&self) -> Result<TargetZone> {
        self.utc_offset.parse()
    }
}

/// Poll budget for the external closing job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosingConfig {
    /// Warm-up before the first status check.
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
    #[serde(default = "default_user_id")]
    pub default_user_id: String,
}

impl Default for ClosingConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: DEFAULT_INITIAL_DELAY_SECS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            max_poll_attempts: DEFAULT_MAX_POLL_ATTEMPTS,
            default_user_id: default_user_id(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Timer polling cadence of the engine loop.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// An invocation older than this is killed regardless of progress.
    #[serde(default = "default_abort_timeout_secs")]
    pub abort_timeout_secs: u64,
    /// An attempt that records no progress for this long is aborted and retried.
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
    #[serde(default = "default_workflow_retention_days")]
    pub workflow_retention_days: u32,
    #[serde(default = "default_journal_retention_days")]
    pub journal_retention_days: u32,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_ms: DEFAULT_TICK_MS,
            abort_timeout_secs: DEFAULT_ABORT_TIMEOUT_SECS,
            inactivity_timeout_secs: DEFAULT_INACTIVITY_TIMEOUT_SECS,
            workflow_retention_days: default_workflow_retention_days(),
            journal_retention_days: default_journal_retention_days(),
            retry: RetryConfig::default(),
        }
    }
}

/// Instance-level retry policy for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_initial_secs")]
    pub initial_interval_secs: u64,
    #[serde(default = "default_retry_max_secs")]
    pub max_interval_secs: u64,
    /// Total attempts including the first one.
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval_secs: default_retry_initial_secs(),
            max_interval_secs: default_retry_max_secs(),
            max_attempts: default_retry_attempts(),
        }
    }
}

/// Knobs for the in-process simulated collaborators used by `dayclose serve`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Status checks that report "running" before the job completes.
    #[serde(default = "default_polls_until_complete")]
    pub polls_until_complete: u32,
    /// When true the simulated job reports failure instead of completion.
    #[serde(default)]
    pub fail_job: bool,
    #[serde(default = "default_metrics_total_steps")]
    pub metrics_total_steps: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            polls_until_complete: default_polls_until_complete(),
            fail_job: false,
            metrics_total_steps: default_metrics_total_steps(),
        }
    }
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.dayclose/dayclose.db", home)
}
fn default_utc_offset() -> String {
    DEFAULT_UTC_OFFSET.to_string()
}
fn default_initial_delay_secs() -> u64 {
    DEFAULT_INITIAL_DELAY_SECS
}
fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_max_poll_attempts() -> u32 {
    DEFAULT_MAX_POLL_ATTEMPTS
}
fn default_user_id() -> String {
    DEFAULT_USER_ID.to_string()
}
fn default_tick_ms() -> u64 {
    DEFAULT_TICK_MS
}
fn default_abort_timeout_secs() -> u64 {
    DEFAULT_ABORT_TIMEOUT_SECS
}
fn default_inactivity_timeout_secs() -> u64 {
    DEFAULT_INACTIVITY_TIMEOUT_SECS
}
fn default_workflow_retention_days() -> u32 {
    7
}
fn default_journal_retention_days() -> u32 {
    30
}
fn default_retry_initial_secs() -> u64 {
    5
}
fn default_retry_max_secs() -> u64 {
    60
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_polls_until_complete() -> u32 {
    3
}
fn default_metrics_total_steps() -> u32 {
    12
}

impl DaycloseConfig {
    /// Load config from a TOML file with DAYCLOSE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. `DAYCLOSE_CONFIG`
    ///   3. ~/.dayclose/dayclose.toml
    ///
    /// Nested keys use a double underscore in env vars, e.g.
    /// `DAYCLOSE_CLOSING__MAX_POLL_ATTEMPTS=9`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = Self::resolve_path(config_path);

        Self::figment(&path)
            .extract::<DaycloseConfig>()
            .map_err(|e| CoreError::Config(e.to_string()))
            .and_then(|config| {
                config.validate()?;
                Ok(config)
            })
    }

    /// The file [`DaycloseConfig::load`] reads for `config_path`.
    pub fn resolve_path(config_path: Option<&str>) -> String {
        config_path
            .map(String::from)
            .unwrap_or_else(default_config_path)
    }

    fn figment(path: &str) -> Figment {
        Figment::from(Serialized::defaults(DaycloseConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("DAYCLOSE_").split("__"))
    }

    /// Reject values that would make the schedule or poll budget meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.schedule.hour > 23 || self.schedule.minute > 59 {
            return Err(CoreError::Config(format!(
                "schedule time {:02}:{:02} is not a valid time of day",
                self.schedule.hour, self.schedule.minute
            )));
        }
        self.schedule.zone()?;
        UserId::parse(&self.closing.default_user_id)?;
        if self.closing.max_poll_attempts == 0 {
            return Err(CoreError::Config(
                "closing.max_poll_attempts must be at least 1".to_string(),
            ));
        }
        if self.engine.retry.max_attempts == 0 {
            return Err(CoreError::Config(
                "engine.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.engine.tick_ms == 0 {
            return Err(CoreError::Config("engine.tick_ms must be positive".to_string()));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    if let Ok(path) = std::env::var("DAYCLOSE_CONFIG") {
        return path;
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.dayclose/dayclose.toml", home)
}
