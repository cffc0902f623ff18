use std::time::Duration;

use chrono::{DateTime, Utc};
use dayclose_core::config::ClosingConfig;
use dayclose_core::UserId;
use dayclose_engine::InvocationStatus;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::collaborators::MetricsProgress;
use crate::error::{ErrorKind, Result};

/// Phase of a closing instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClosingStep {
    Idle,
    OracleClosing,
    FinancialMetrics,
    Completed,
    Failed,
}

impl ClosingStep {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ClosingStep::Completed | ClosingStep::Failed)
    }
}

/// Durable snapshot of a closing instance, written only by its own execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub current_step: ClosingStep,
    pub external_job_name: Option<String>,
    pub metrics_run_id: Option<Uuid>,
    pub step_start_time: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
}

/// Input of `DailyClosing/run`.
///
/// Fields are kept raw so malformed values surface as validation failures of
/// the run instead of deserialization errors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClosingInput {
    /// Defaults to the instance key.
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub skip_oracle_closing: bool,
    #[serde(default)]
    pub skip_financial_metrics: bool,
    /// Defaults to the configured operator.
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Summary of one executed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub success: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_secs: f64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub kind: ErrorKind,
    pub message: String,
}

/// Final output of a closing instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosingResult {
    pub workflow_id: String,
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oracle_closing: Option<StepReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub financial_metrics: Option<StepReport>,
    pub overall_success: bool,
    pub total_duration_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReport>,
}

/// Read-only view returned by the status query.
#[derive(Debug, Clone, Serialize)]
pub struct ClosingStatus {
    pub workflow_id: String,
    pub current_step: ClosingStep,
    pub state: Option<WorkflowState>,
    /// Engine-level status of the instance, `None` if it never started.
    pub invocation_status: Option<InvocationStatus>,
    pub wake_at: Option<DateTime<Utc>>,
    pub result: Option<ClosingResult>,
    /// Fetched live on every call.
    pub metrics_progress: Option<MetricsProgress>,
}

/// Poll budget and defaults of the closing workflow.
#[derive(Debug, Clone)]
pub struct ClosingOptions {
    pub initial_delay: Duration,
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    pub default_user: UserId,
}

impl ClosingOptions {
    pub fn from_config(config: &ClosingConfig) -> Result<Self> {
        Ok(Self {
            initial_delay: Duration::from_secs(config.initial_delay_secs),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            max_poll_attempts: config.max_poll_attempts.max(1),
            default_user: UserId::parse(&config.default_user_id)?,
        })
    }

    /// Longest a job may be waited on: `initial_delay + max_poll_attempts * poll_interval`.
    pub fn poll_budget(&self) -> Duration {
        self.initial_delay + self.poll_interval * self.max_poll_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_budget_is_twelve_hours() {
        let options = ClosingOptions::from_config(&ClosingConfig::default()).unwrap();
        assert_eq!(options.poll_budget(), Duration::from_secs(12 * 3600));
        assert_eq!(options.default_user.as_str(), "adm");
    }

    #[test]
    fn input_fields_default() {
        let input: ClosingInput = serde_json::from_str("{}").unwrap();
        assert_eq!(input, ClosingInput::default());
        let input: ClosingInput =
            serde_json::from_str(r#"{"skip_oracle_closing": true, "date": "2025-01-31"}"#).unwrap();
        assert!(input.skip_oracle_closing);
        assert!(!input.skip_financial_metrics);
    }

    #[test]
    fn steps_use_kebab_case() {
        assert_eq!(
            serde_json::to_value(ClosingStep::OracleClosing).unwrap(),
            "oracle-closing"
        );
    }
}
