use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dayclose_core::{ClosingDate, JobName, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Outcome of asking the external job system to start a closing run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobSubmission {
    Submitted { job_name: String, message: String },
    /// The job system refused the request; nothing was started.
    Rejected { message: String },
}

/// One status check of a submitted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PollResult {
    Running { message: String },
    Completed { message: String },
    Failed { message: String },
}

/// Result of a metrics computation. `success == false` is a business failure
/// reported by the backend, not an infrastructure fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsOutcome {
    pub success: bool,
    pub duration_secs: f64,
    pub message: String,
}

/// Live progress of a metrics run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsProgress {
    pub status: String,
    pub completed_steps: u32,
    pub total_steps: u32,
    pub error_count: u32,
    pub warning_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaboratorErrorKind {
    /// Connection reset, timeout, unspecified driver error. Worth retrying.
    Transient,
    /// Constraint violation class; retrying cannot help.
    DataIntegrity,
    /// The collaborator understood the request and refused it.
    Rejected,
}

/// Failure raised by a collaborator call.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct CollaboratorError {
    pub kind: CollaboratorErrorKind,
    pub message: String,
}

/// SQLSTATE codes of the integrity-constraint-violation class that are
/// reported as data-integrity failures: not-null, foreign-key, unique, check.
pub const DATA_INTEGRITY_SQLSTATES: [&str; 4] = ["23502", "23503", "23505", "23514"];

impl CollaboratorError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: CollaboratorErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn data_integrity(message: impl Into<String>) -> Self {
        Self {
            kind: CollaboratorErrorKind::DataIntegrity,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            kind: CollaboratorErrorKind::Rejected,
            message: message.into(),
        }
    }

    /// Classify a database error by its SQLSTATE code.
    pub fn from_sqlstate(code: &str, message: impl Into<String>) -> Self {
        if DATA_INTEGRITY_SQLSTATES.contains(&code) {
            Self::data_integrity(message)
        } else {
            Self::transient(message)
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == CollaboratorErrorKind::Transient
    }
}

/// The external closing-job system.
///
/// Implementations own their connections; the workflow never issues more than
/// one outstanding call per instance.
#[async_trait]
pub trait ClosingJobs: Send + Sync {
    async fn submit_job(
        &self,
        date: &ClosingDate,
        user: &UserId,
    ) -> Result<JobSubmission, CollaboratorError>;

    async fn check_job_status(&self, job: &JobName) -> Result<PollResult, CollaboratorError>;
}

/// The financial metrics backend.
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    async fn compute_metrics(
        &self,
        date: &ClosingDate,
        run_id: Uuid,
        as_of: DateTime<Utc>,
    ) -> Result<MetricsOutcome, CollaboratorError>;

    /// `Ok(None)` when the backend has no record of `run_id`.
    async fn get_metrics_progress(
        &self,
        run_id: Uuid,
    ) -> Result<Option<MetricsProgress>, CollaboratorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_sqlstates_are_not_transient() {
        for code in DATA_INTEGRITY_SQLSTATES {
            let err = CollaboratorError::from_sqlstate(code, "violation");
            assert_eq!(err.kind, CollaboratorErrorKind::DataIntegrity);
        }
        assert!(CollaboratorError::from_sqlstate("08006", "connection failure").is_transient());
    }

    #[test]
    fn poll_results_are_tagged() {
        let json = serde_json::to_value(PollResult::Completed {
            message: "done".into(),
        })
        .unwrap();
        assert_eq!(json["status"], "completed");
    }
}
