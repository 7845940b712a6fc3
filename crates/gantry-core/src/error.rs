//! Error types for gantry

use thiserror::Error;

use crate::SessionStatus;

/// Main error type for gantry
#[derive(Error, Debug)]
pub enum GantryError {
    /// Malformed caller input (filter values, session payloads)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Caller does not own the session
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// A model instance could not be started
    #[error("Provisioning error: {0}")]
    Provisioning(String),

    /// A model instance's worker process could not be reached
    #[error("Instance state unavailable: {0}")]
    StateUnavailable(String),

    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Instance not found
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// Session is assigned to a live instance or runner
    #[error("Session in use: {0}")]
    SessionInUse(String),

    /// Illegal session status change
    #[error("Invalid session transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: SessionStatus,
        to: SessionStatus,
    },

    /// Resource exhausted
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Runtime error
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GantryError {
    /// Errors the scheduler recovers from locally (requeue, poll again)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GantryError::Provisioning(_)
                | GantryError::StateUnavailable(_)
                | GantryError::ResourceExhausted(_)
        )
    }
}

/// Result type for gantry operations
pub type GantryResult<T> = Result<T, GantryError>;

impl From<serde_json::Error> for GantryError {
    fn from(err: serde_json::Error) -> Self {
        GantryError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for GantryError {
    fn from(err: toml::de::Error) -> Self {
        GantryError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GantryError::Validation("invalid reject pair: foo".to_string());
        assert_eq!(err.to_string(), "Validation error: invalid reject pair: foo");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: GantryError = io_err.into();
        assert!(matches!(err, GantryError::Io(_)));
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = GantryError::InvalidTransition {
            id: "s1".to_string(),
            from: SessionStatus::Complete,
            to: SessionStatus::Assigned,
        };
        assert_eq!(
            err.to_string(),
            "Invalid session transition for s1: complete -> assigned"
        );
    }

    #[test]
    fn test_recoverable() {
        assert!(GantryError::Provisioning("spawn failed".into()).is_recoverable());
        assert!(!GantryError::Internal("db down".into()).is_recoverable());
        assert!(!GantryError::AccessDenied("nope".into()).is_recoverable());
    }
}
