//! Core types for the recovery layer
//!
//! Defines:
//! - Identifiers for checkpoints and operations
//! - The global recovery state and the strategies that drive it
//! - Checkpoint and operation records
//! - The statistics snapshot

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use ulid::Ulid;

/// Opaque key/value snapshot used for checkpoint state, metadata and operation context
pub type ContextMap = serde_json::Map<String, Value>;

/// Unique checkpoint identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CheckpointId(pub Ulid);

impl CheckpointId {
    /// Generate new checkpoint ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for CheckpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique recovery operation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(pub Ulid);

impl OperationId {
    /// Generate new operation ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Global state of the recovery orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryState {
    /// Idle, watching for failures
    Monitoring,
    /// A failure has been reported and is being classified
    Detecting,
    /// Retry or compensation in progress
    Recovering,
    /// Restoring a checkpoint
    RollingBack,
    /// Recovery finished, waiting out the stabilization period
    Stabilizing,
    /// Last recovery failed
    Failed,
}

impl RecoveryState {
    /// Every state, in declaration order
    pub const ALL: [RecoveryState; 6] = [
        Self::Monitoring,
        Self::Detecting,
        Self::Recovering,
        Self::RollingBack,
        Self::Stabilizing,
        Self::Failed,
    ];

    /// The fixed transition table
    #[must_use]
    pub fn allowed_transitions(self) -> &'static [RecoveryState] {
        match self {
            Self::Monitoring => &[Self::Detecting],
            Self::Detecting => &[Self::Recovering, Self::RollingBack],
            Self::Recovering => &[Self::Stabilizing, Self::RollingBack, Self::Failed],
            Self::RollingBack => &[Self::Stabilizing, Self::Failed],
            Self::Stabilizing => &[Self::Monitoring],
            Self::Failed => &[Self::Monitoring, Self::RollingBack],
        }
    }

    /// Kebab-case name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Monitoring => "monitoring",
            Self::Detecting => "detecting",
            Self::Recovering => "recovering",
            Self::RollingBack => "rolling-back",
            Self::Stabilizing => "stabilizing",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recovery strategy chosen by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryStrategy {
    /// Re-run a recovery action with exponential backoff
    Retry,
    /// Restore the component's most recent checkpoint
    Rollback,
    /// Run the component's registered undo actions
    Compensate,
    /// Open the component's circuit breaker
    CircuitBreak,
}

impl RecoveryStrategy {
    /// Default attempt budget for this strategy
    #[inline]
    #[must_use]
    pub fn default_max_attempts(self, retry_attempts: u32) -> u32 {
        match self {
            Self::Retry => retry_attempts,
            Self::Rollback | Self::Compensate | Self::CircuitBreak => 1,
        }
    }

    /// Kebab-case name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Rollback => "rollback",
            Self::Compensate => "compensate",
            Self::CircuitBreak => "circuit-break",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a single recovery operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationStatus {
    /// Recorded, not yet dispatched
    Pending,
    /// Strategy handler running
    Executing,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully
    Failed,
}

impl OperationStatus {
    /// Whether the operation has reached a final status
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Immutable snapshot of state tied to a logical context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryCheckpoint {
    /// Checkpoint ID
    pub id: CheckpointId,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Store-wide creation sequence; breaks timestamp ties
    pub sequence: u64,
    /// Deep copy of the caller's state
    pub state: ContextMap,
    /// Logical subject, usually a component name
    pub context: String,
    /// Most recent earlier checkpoint with the same context
    pub previous_checkpoint_id: Option<CheckpointId>,
    /// Caller metadata
    pub metadata: ContextMap,
}

impl RecoveryCheckpoint {
    /// Sort key giving creation order
    #[inline]
    #[must_use]
    pub fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.timestamp, self.sequence)
    }
}

/// A single recovery attempt, tracked from initiation to terminal status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryOperation {
    /// Operation ID
    pub id: OperationId,
    /// Strategy being applied
    #[serde(rename = "type")]
    pub strategy: RecoveryStrategy,
    /// Component the failure was reported for
    pub target_component: String,
    /// Caller context plus the triggering error under `"error"`
    pub context: ContextMap,
    /// Attempt budget
    pub max_attempts: u32,
    /// Attempts made so far
    pub current_attempt: u32,
    /// Lifecycle status
    pub status: OperationStatus,
    /// When the operation was recorded
    pub start_time: DateTime<Utc>,
    /// When the operation reached a terminal status
    pub end_time: Option<DateTime<Utc>>,
    /// Failure description for failed operations
    pub error: Option<String>,
    /// Strategy-specific result for completed operations
    pub result: Option<Value>,
}

impl RecoveryOperation {
    /// Create a pending operation
    #[must_use]
    pub fn new(
        strategy: RecoveryStrategy,
        target_component: impl Into<String>,
        context: ContextMap,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: OperationId::new(),
            strategy,
            target_component: target_component.into(),
            context,
            max_attempts,
            current_attempt: 0,
            status: OperationStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            error: None,
            result: None,
        }
    }

    /// Mark completed; returns false if already terminal
    pub fn complete(&mut self, result: Value) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = OperationStatus::Completed;
        self.result = Some(result);
        self.end_time = Some(Utc::now());
        true
    }

    /// Mark failed; returns false if already terminal
    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = OperationStatus::Failed;
        self.error = Some(error.into());
        self.end_time = Some(Utc::now());
        true
    }
}

/// Point-in-time view of orchestrator health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryStats {
    /// Current global state
    pub state: RecoveryState,
    /// Recoveries currently in flight
    pub active_operations: u64,
    /// Stored checkpoints
    pub checkpoint_count: usize,
    /// Operations that completed
    pub successful_recoveries: u64,
    /// Operations that failed
    pub failed_recoveries: u64,
    /// successful / (successful + failed), or 0 with no terminal operations
    pub success_rate: f64,
    /// Known circuit breakers
    pub circuit_breaker_count: usize,
    /// Whether shutdown has begun
    pub is_shutting_down: bool,
}

impl RecoveryStats {
    /// Compute the success rate from terminal counts
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rate(successful: u64, failed: u64) -> f64 {
        let total = successful + failed;
        if total == 0 {
            0.0
        } else {
            successful as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_default_attempts() {
        assert_eq!(RecoveryStrategy::Retry.default_max_attempts(3), 3);
        assert_eq!(RecoveryStrategy::Rollback.default_max_attempts(3), 1);
        assert_eq!(RecoveryStrategy::Compensate.default_max_attempts(3), 1);
        assert_eq!(RecoveryStrategy::CircuitBreak.default_max_attempts(3), 1);
    }

    #[test]
    fn state_serializes_kebab_case() {
        let json = serde_json::to_string(&RecoveryState::RollingBack).unwrap();
        assert_eq!(json, "\"rolling-back\"");
        assert_eq!(RecoveryStrategy::CircuitBreak.to_string(), "circuit-break");
    }

    #[test]
    fn no_path_from_detecting_to_failed_or_monitoring() {
        let edges = RecoveryState::Detecting.allowed_transitions();
        assert!(!edges.contains(&RecoveryState::Failed));
        assert!(!edges.contains(&RecoveryState::Monitoring));
    }

    #[test]
    fn operation_terminal_once() {
        let mut op = RecoveryOperation::new(RecoveryStrategy::Retry, "svc", ContextMap::new(), 3);
        assert!(op.complete(Value::Null));
        assert!(!op.fail("late"));
        assert_eq!(op.status, OperationStatus::Completed);
        assert!(op.error.is_none());
    }

    #[test]
    fn success_rate() {
        assert!((RecoveryStats::rate(0, 0) - 0.0).abs() < f64::EPSILON);
        assert!((RecoveryStats::rate(3, 1) - 0.75).abs() < f64::EPSILON);
    }
}
