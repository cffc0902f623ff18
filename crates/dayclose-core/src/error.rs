use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid closing date '{value}': expected YYYY-MM-DD")]
    InvalidDate { value: String },

    #[error("Invalid user id '{value}': must be alphanumeric with underscores only")]
    InvalidUserId { value: String },

    #[error("Invalid job name '{value}': must be upper-case alphanumeric with underscores only")]
    InvalidJobName { value: String },

    #[error("Invalid UTC offset '{value}': expected +HH:MM, -HH:MM or Z")]
    InvalidOffset { value: String },
}

impl CoreError {
    /// Short error code string, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "CONFIG_ERROR",
            CoreError::InvalidDate { .. } => "INVALID_DATE",
            CoreError::InvalidUserId { .. } => "INVALID_USER_ID",
            CoreError::InvalidJobName { .. } => "INVALID_JOB_NAME",
            CoreError::InvalidOffset { .. } => "INVALID_OFFSET",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
