//! Error types for the recovery core
//!
//! - [`RecoveryError`]: failures of the orchestrator and its stores
//! - [`ActionError`]: failures reported by caller-supplied callbacks
//! - [`ConfigError`]: configuration loading and validation

use crate::types::OperationId;
use recovery_sync::SyncError;
use std::path::PathBuf;

/// Main recovery error type
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// State machine edge missing
    #[error(transparent)]
    InvalidTransition(#[from] SyncError),

    /// Mutation attempted after shutdown began
    #[error("recovery core is shutting down")]
    ShuttingDown,

    /// Rollback requested with no matching checkpoint
    #[error("no checkpoint found for context: {context}")]
    NoCheckpoint { context: String },

    /// Compensation requested with nothing registered
    #[error("no compensation actions registered for component: {component}")]
    NoCompensationActions { component: String },

    /// Compensation dependency cycle
    #[error("circular dependency detected at compensation action: {action_id}")]
    CircularDependency { action_id: String },

    /// Unknown operation
    #[error("operation not found: {0}")]
    OperationNotFound(OperationId),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl RecoveryError {
    /// Whether this error escapes `initiate_recovery` instead of being
    /// recorded on the operation
    #[inline]
    #[must_use]
    pub fn is_initiation_failure(&self) -> bool {
        matches!(self, Self::InvalidTransition(_) | Self::ShuttingDown)
    }
}

/// Failure reported by a recovery, rollback or compensation callback
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ActionError {
    message: String,
}

impl ActionError {
    /// Create from a message
    #[inline]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Capture any error's display text
    #[inline]
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        Self::new(error.to_string())
    }

    /// Error message
    #[inline]
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for ActionError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for ActionError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML could not be parsed
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config could not be rendered
    #[error("failed to render TOML: {0}")]
    Render(#[from] toml::ser::Error),

    /// Config file could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Value out of range
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovery_error_display() {
        let err = RecoveryError::NoCheckpoint {
            context: "svc-x".to_string(),
        };
        assert!(err.to_string().contains("svc-x"));
    }

    #[test]
    fn initiation_failures() {
        assert!(RecoveryError::ShuttingDown.is_initiation_failure());
        assert!(RecoveryError::from(SyncError::invalid_transition("a", "b")).is_initiation_failure());
        assert!(!RecoveryError::NoCompensationActions {
            component: "db".to_string()
        }
        .is_initiation_failure());
    }

    #[test]
    fn action_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = ActionError::from_error(&io);
        assert_eq!(err.message(), "disk gone");
    }
}
