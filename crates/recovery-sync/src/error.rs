//! Error types for the concurrency toolkit

/// Errors raised by the sync primitives
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// No edge registered from the current state to the requested one
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        /// State the machine was in
        from: String,
        /// State that was requested
        to: String,
    },
}

impl SyncError {
    /// Create an invalid transition error from any displayable states
    #[inline]
    pub fn invalid_transition(from: impl std::fmt::Display, to: impl std::fmt::Display) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_display() {
        let err = SyncError::invalid_transition("monitoring", "failed");
        assert_eq!(err.to_string(), "invalid transition: monitoring -> failed");
    }
}
