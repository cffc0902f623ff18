use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The configured trigger time cannot be placed on the calendar.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Config error: {0}")]
    Config(#[from] dayclose_core::CoreError),

    #[error("Engine error: {0}")]
    Engine(#[from] dayclose_engine::EngineError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
