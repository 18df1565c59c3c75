//! Error types shared across the automation engine.

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(String),

    #[error("record {0} not found")]
    RecordNotFound(Uuid),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Caller error: a malformed or out-of-sequence request (e.g. acting on
    /// a non-pending approval). Distinct from business-rule outcomes such as
    /// a rejected approval or a disallowed transition, which are ordinary
    /// return values.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("dispatch error ({service}): {message}")]
    Dispatch { service: String, message: String },

    #[error("action failed: {0}")]
    ActionFailed(String),

    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn dispatch(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Dispatch {
            service: service.into(),
            message: message.into(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::dispatch("email", "connection refused");
        assert_eq!(err.to_string(), "dispatch error (email): connection refused");

        let id = Uuid::new_v4();
        let err = EngineError::RecordNotFound(id);
        assert!(err.to_string().contains(&id.to_string()));
    }
}
