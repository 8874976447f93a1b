//! Error types for the remote prompt server.

use std::time::Duration;

use uuid::Uuid;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Job-related errors.
///
/// Only errors raised before a job exists reach the caller. Anything that
/// goes wrong while a job executes is recorded on the job itself.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Unsupported runner: {0}")]
    UnsupportedRunner(String),

    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("thread_id is required when threads compatibility mode is disabled")]
    ThreadRequired,

    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job manager is shutting down")]
    ShuttingDown,

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl JobError {
    /// Whether this error was caused by the caller's input.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedRunner(_) | Self::MissingField(_) | Self::ThreadRequired
        )
    }
}

/// Notification delivery errors. Never affect job state.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Relay request failed: {0}")]
    Request(String),

    #[error("Relay rejected notification with status {status}")]
    Rejected { status: u16 },

    #[error("Relay timed out after {0:?}")]
    Timeout(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_classified() {
        assert!(JobError::UnsupportedRunner("llama".into()).is_validation());
        assert!(JobError::MissingField("device_id").is_validation());
        assert!(JobError::ThreadRequired.is_validation());
        assert!(!JobError::NotFound { id: Uuid::new_v4() }.is_validation());
        assert!(!JobError::ShuttingDown.is_validation());
    }

    #[test]
    fn config_error_names_the_variable() {
        let err = ConfigError::InvalidValue {
            key: "REMOTE_PROMPT_MAX_CONCURRENT_JOBS".into(),
            message: "must be at least 1".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid configuration value for REMOTE_PROMPT_MAX_CONCURRENT_JOBS: must be at least 1"
        );
    }

    #[test]
    fn missing_field_message() {
        assert_eq!(
            JobError::MissingField("room_id").to_string(),
            "room_id is required"
        );
    }
}
