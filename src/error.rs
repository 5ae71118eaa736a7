use thiserror::Error;

/// Main error type for the sentinel control plane
///
/// Capacity outcomes (bus full, buffer full) and stale recovery run ids are
/// not errors; they are reported through boolean returns and counters.
#[derive(Error, Debug)]
pub enum SentinelError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Malformed operator input (force_mode, start_recovery)
    #[error("Validation failed: {0}")]
    Validation(String),

    // State machine errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl SentinelError {
    pub fn validation(msg: impl Into<String>) -> Self {
        SentinelError::Validation(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        SentinelError::InvalidState(msg.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, SentinelError::Validation(_))
    }

    pub fn is_invalid_state(&self) -> bool {
        matches!(self, SentinelError::InvalidState(_))
    }
}

/// Result type alias for SentinelError
pub type Result<T> = std::result::Result<T, SentinelError>;
