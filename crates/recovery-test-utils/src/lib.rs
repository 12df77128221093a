//! Testing utilities for the recovery workspace
//!
//! Scripted recovery actions, recording rollback and compensation fixtures,
//! and orchestrator setup helpers.

#![allow(missing_docs)]

use parking_lot::Mutex;
use recovery_core::{
    ActionError, CompensationActionSpec, ContextMap, RecoveryAction, RecoveryCheckpoint,
    RecoveryConfig, RecoveryOperation, RollbackHandler,
};
use serde_json::{json, Value};
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing_subscriber::fmt::MakeWriter;

/// Fails a fixed number of times, then succeeds; records when each attempt ran
#[derive(Debug, Clone, Default)]
pub struct ScriptedAction {
    failures: u32,
    calls: Arc<AtomicU32>,
    attempts: Arc<Mutex<Vec<Instant>>>,
}

impl ScriptedAction {
    #[must_use]
    pub fn failing_times(failures: u32) -> Self {
        Self {
            failures,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn succeeding() -> Self {
        Self::failing_times(0)
    }

    #[must_use]
    pub fn always_failing() -> Self {
        Self::failing_times(u32::MAX)
    }

    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().clone()
    }

    /// Gaps between consecutive attempts
    #[must_use]
    pub fn gaps(&self) -> Vec<Duration> {
        self.attempt_times()
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect()
    }
}

#[async_trait::async_trait]
impl RecoveryAction for ScriptedAction {
    async fn attempt(&self, operation: &RecoveryOperation) -> Result<Value, ActionError> {
        self.attempts.lock().push(Instant::now());
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            Err(ActionError::new(format!("scripted failure {call}")))
        } else {
            Ok(json!({ "attempt": operation.current_attempt }))
        }
    }
}

/// Never succeeds
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysFail;

#[async_trait::async_trait]
impl RecoveryAction for AlwaysFail {
    async fn attempt(&self, _operation: &RecoveryOperation) -> Result<Value, ActionError> {
        Err(ActionError::new("component still unavailable"))
    }
}

/// Sleeps before succeeding
#[derive(Debug, Clone, Copy)]
pub struct DelayedAction(pub Duration);

#[async_trait::async_trait]
impl RecoveryAction for DelayedAction {
    async fn attempt(&self, _operation: &RecoveryOperation) -> Result<Value, ActionError> {
        tokio::time::sleep(self.0).await;
        Ok(Value::Null)
    }
}

/// Rollback handler that remembers every restore
#[derive(Debug, Clone, Default)]
pub struct RecordingRollback {
    restored: Arc<Mutex<Vec<(String, RecoveryCheckpoint)>>>,
}

impl RecordingRollback {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn restored(&self) -> Vec<(String, RecoveryCheckpoint)> {
        self.restored.lock().clone()
    }
}

#[async_trait::async_trait]
impl RollbackHandler for RecordingRollback {
    async fn rollback(
        &self,
        component: &str,
        checkpoint: &RecoveryCheckpoint,
    ) -> Result<(), ActionError> {
        self.restored
            .lock()
            .push((component.to_string(), checkpoint.clone()));
        Ok(())
    }
}

/// Shared log of compensation action ids in execution order
pub type ExecutionLog = Arc<Mutex<Vec<String>>>;

#[must_use]
pub fn execution_log() -> ExecutionLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Compensation action `id` that appends its id to `log`
#[must_use]
pub fn recording_compensation(log: &ExecutionLog, id: &str) -> CompensationActionSpec {
    let log = Arc::clone(log);
    let name = id.to_string();
    CompensationActionSpec::new(format!("undo-{id}"), move |_context: ContextMap| {
        let log = Arc::clone(&log);
        let name = name.clone();
        async move {
            log.lock().push(name);
            Ok(())
        }
    })
    .with_id(id)
}

/// Compensation action `id` that always fails
#[must_use]
pub fn failing_compensation(id: &str) -> CompensationActionSpec {
    let message = format!("undo of {id} rejected");
    CompensationActionSpec::new(format!("undo-{id}"), move |_context: ContextMap| {
        let message = message.clone();
        async move { Err(ActionError::new(message)) }
    })
    .with_id(id)
}

/// Build a context map from literal pairs
#[must_use]
pub fn state_map<const N: usize>(pairs: [(&str, Value); N]) -> ContextMap {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

/// Config with short stabilization and backoff for fast tests
#[must_use]
pub fn fast_config() -> RecoveryConfig {
    RecoveryConfig::new()
        .with_stabilization(Duration::from_millis(10), Duration::from_millis(10))
        .with_backoff(Duration::from_millis(5), Duration::from_millis(50))
}

#[must_use]
pub fn setup_test_orchestrator() -> recovery_core::RecoveryOrchestrator {
    recovery_core::RecoveryOrchestrator::new(fast_config())
}

/// In-memory sink for `tracing` output
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route this thread's `tracing` output here until the guard drops
    #[must_use]
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
