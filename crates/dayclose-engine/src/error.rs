use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::JournalKind;

/// Errors raised by the engine's persistence and bookkeeping.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted column could not be decoded back into its Rust type.
    #[error("Corrupt {column} value: {value}")]
    Corrupt { column: &'static str, value: String },

    #[error("Invocation not found: {id}")]
    InvocationNotFound { id: String },

    #[error("No handler registered for {service}/{handler}")]
    UnknownHandler { service: String, handler: String },

    #[error("No service registered as {service}")]
    UnknownService { service: String },

    /// Replay reached a journal entry of a different kind than the handler asked for.
    #[error("Journal mismatch at '{name}': handler expected {expected}, journal holds {found}")]
    Nondeterminism {
        name: String,
        expected: JournalKind,
        found: JournalKind,
    },

    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl EngineError {
    /// Whether retrying the same attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Database(_) | EngineError::LockPoisoned(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Outcome classification for handler code.
///
/// Handlers never inspect messages to decide what happens next: the variant
/// alone tells the runtime whether to finish, retry or park the invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Ends the invocation; never retried.
    #[error("{0}")]
    Terminal(String),

    /// Retried by the instance-level retry policy.
    #[error("{0}")]
    Retryable(String),

    /// Raised by `Context::sleep` while the wake time lies in the future.
    /// Handlers must propagate it untouched.
    #[error("suspended until {wake_at}")]
    Suspended { wake_at: DateTime<Utc> },
}

impl HandlerError {
    pub fn terminal(message: impl Into<String>) -> Self {
        HandlerError::Terminal(message.into())
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        HandlerError::Retryable(message.into())
    }

    pub fn is_suspension(&self) -> bool {
        matches!(self, HandlerError::Suspended { .. })
    }
}

impl From<EngineError> for HandlerError {
    fn from(err: EngineError) -> Self {
        if err.is_transient() {
            HandlerError::Retryable(err.to_string())
        } else {
            HandlerError::Terminal(err.to_string())
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Terminal(format!("Serialization error: {err}"))
    }
}
