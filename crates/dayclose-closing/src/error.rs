use dayclose_core::CoreError;
use dayclose_engine::EngineError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::collaborators::{CollaboratorError, CollaboratorErrorKind};

/// Failure classes of a closing run. Every [`ClosingError`] carries one and
/// results report it, so callers never need to parse messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Validation,
    Submission,
    JobFailed,
    Timeout,
    BusinessFailure,
    DataIntegrity,
    Transient,
    Engine,
}

impl ErrorKind {
    /// Whether a failure of this kind ends the run without retry.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ErrorKind::Transient)
    }
}

#[derive(Debug, Error)]
pub enum ClosingError {
    #[error("validation failed: {0}")]
    Validation(#[from] CoreError),

    #[error("validation failed: date {date} does not match instance key {key}")]
    DateMismatch { date: String, key: String },

    #[error("failed to submit closing job: {message}")]
    Submission { message: String },

    #[error("closing job {job_name} failed: {message}")]
    JobFailed { job_name: String, message: String },

    #[error("closing job timed out after {}. Job: {job_name}", human_budget(.budget_secs))]
    Timeout { job_name: String, budget_secs: u64 },

    #[error("financial metrics calculation failed: {message}")]
    BusinessFailure { message: String },

    #[error("data integrity violation: {message}")]
    DataIntegrity { message: String },

    #[error("transient failure: {message}")]
    Transient { message: String },

    #[error("engine error: {0}")]
    Engine(String),
}

impl ClosingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClosingError::Validation(_) | ClosingError::DateMismatch { .. } => {
                ErrorKind::Validation
            }
            ClosingError::Submission { .. } => ErrorKind::Submission,
            ClosingError::JobFailed { .. } => ErrorKind::JobFailed,
            ClosingError::Timeout { .. } => ErrorKind::Timeout,
            ClosingError::BusinessFailure { .. } => ErrorKind::BusinessFailure,
            ClosingError::DataIntegrity { .. } => ErrorKind::DataIntegrity,
            ClosingError::Transient { .. } => ErrorKind::Transient,
            ClosingError::Engine(_) => ErrorKind::Engine,
        }
    }

    /// Map a collaborator failure; `on_rejected` builds the step's own error
    /// for outright refusals.
    pub(crate) fn from_collaborator(err: CollaboratorError, on_rejected: impl FnOnce(String) -> Self) -> Self {
        match err.kind {
            CollaboratorErrorKind::DataIntegrity => ClosingError::DataIntegrity {
                message: err.message,
            },
            CollaboratorErrorKind::Transient => ClosingError::Transient {
                message: err.message,
            },
            CollaboratorErrorKind::Rejected => on_rejected(err.message),
        }
    }
}

impl From<EngineError> for ClosingError {
    fn from(err: EngineError) -> Self {
        ClosingError::Engine(err.to_string())
    }
}

/// `12 hours`, `90 minutes`, `45 seconds`: whichever unit divides evenly.
fn human_budget(secs: &u64) -> String {
    let secs = *secs;
    if secs > 0 && secs % 3600 == 0 {
        format!("{} hours", secs / 3600)
    } else if secs > 0 && secs % 60 == 0 {
        format!("{} minutes", secs / 60)
    } else {
        format!("{secs} seconds")
    }
}

pub type Result<T> = std::result::Result<T, ClosingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_reports_budget_and_job() {
        let err = ClosingError::Timeout {
            job_name: "CLOSING_2025_01_1738281600000".into(),
            budget_secs: 12 * 3600,
        };
        assert_eq!(
            err.to_string(),
            "closing job timed out after 12 hours. Job: CLOSING_2025_01_1738281600000"
        );
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn only_transient_is_retryable() {
        assert!(!ErrorKind::Transient.is_terminal());
        assert!(ErrorKind::DataIntegrity.is_terminal());
        assert!(ErrorKind::Validation.is_terminal());
    }

    #[test]
    fn budget_units() {
        assert_eq!(human_budget(&150), "150 seconds");
        assert_eq!(human_budget(&120), "2 minutes");
        assert_eq!(human_budget(&7200), "2 hours");
    }
}
