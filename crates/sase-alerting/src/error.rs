//! Error types for the alert pipeline

use thiserror::Error;

pub use crate::channels::ChannelError;
pub use crate::config::ConfigError;
pub use crate::dispatcher::DispatchError;
pub use crate::repository::RepositoryError;
pub use crate::rules::RuleError;

/// Alert pipeline error type
#[derive(Error, Debug)]
pub enum AlertingError {
    /// Persistence failure
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// Rule evaluation failure
    #[error(transparent)]
    Rule(#[from] RuleError),

    /// Dispatch failure
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Malformed input event
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// Operation not allowed in the alert's current state
    #[error("alert {alert_id} is {status}: {reason}")]
    InvalidState {
        alert_id: String,
        status: crate::model::AlertStatus,
        reason: String,
    },
}

/// Result type for the alert pipeline
pub type AlertingResult<T> = Result<T, AlertingError>;
