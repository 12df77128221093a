//! Caller-supplied recovery and rollback effects
//!
//! The orchestrator decides *how* to recover; what a retry or a rollback
//! actually does to the failing component is plugged in through these traits.

use crate::error::ActionError;
use crate::types::{RecoveryCheckpoint, RecoveryOperation};
use serde_json::Value;
use std::fmt;
use std::future::Future;

/// Effect re-run by the retry strategy
#[async_trait::async_trait]
pub trait RecoveryAction: Send + Sync {
    /// Make one recovery attempt
    ///
    /// `operation.current_attempt` is the 1-based attempt number. The returned
    /// value becomes the operation's result on success.
    async fn attempt(&self, operation: &RecoveryOperation) -> Result<Value, ActionError>;
}

/// Adapter turning an async closure into a [`RecoveryAction`]
pub struct RecoveryFn<F> {
    f: F,
}

/// Wrap an async closure as a [`RecoveryAction`]
pub fn recovery_fn<F, Fut>(f: F) -> RecoveryFn<F>
where
    F: Fn(RecoveryOperation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ActionError>> + Send + 'static,
{
    RecoveryFn { f }
}

#[async_trait::async_trait]
impl<F, Fut> RecoveryAction for RecoveryFn<F>
where
    F: Fn(RecoveryOperation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ActionError>> + Send + 'static,
{
    async fn attempt(&self, operation: &RecoveryOperation) -> Result<Value, ActionError> {
        (self.f)(operation.clone()).await
    }
}

impl<F> fmt::Debug for RecoveryFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryFn").finish_non_exhaustive()
    }
}

/// Effect applied by the rollback strategy
#[async_trait::async_trait]
pub trait RollbackHandler: Send + Sync {
    /// Restore `component` to `checkpoint`
    async fn rollback(
        &self,
        component: &str,
        checkpoint: &RecoveryCheckpoint,
    ) -> Result<(), ActionError>;
}

/// Default rollback effect: records the restore in the log and succeeds
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingRollback;

#[async_trait::async_trait]
impl RollbackHandler for LoggingRollback {
    async fn rollback(
        &self,
        component: &str,
        checkpoint: &RecoveryCheckpoint,
    ) -> Result<(), ActionError> {
        tracing::info!(
            component,
            checkpoint = %checkpoint.id,
            keys = checkpoint.state.len(),
            "restoring checkpoint"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContextMap, RecoveryStrategy};

    #[tokio::test]
    async fn recovery_fn_sees_attempt_number() {
        let action = recovery_fn(|op: RecoveryOperation| async move {
            Ok(Value::from(op.current_attempt))
        });
        let mut op = RecoveryOperation::new(RecoveryStrategy::Retry, "svc", ContextMap::new(), 3);
        op.current_attempt = 2;
        assert_eq!(action.attempt(&op).await.unwrap(), Value::from(2));
    }
}
