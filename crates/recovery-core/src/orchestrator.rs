//! Recovery orchestrator
//!
//! The top-level service. Owns the global recovery state machine and the
//! three stores, and applies one recovery strategy per request:
//! - **retry**: re-run a caller action with exponential backoff
//! - **rollback**: restore the component's most recent checkpoint
//! - **compensate**: run the component's undo actions in dependency order
//! - **circuit-break**: open the component's circuit breaker
//!
//! # Concurrency
//!
//! `initiate_recovery` holds the operation mutex for the whole recovery, so
//! recoveries run one at a time and the state machine always sees complete
//! episodes (`monitoring -> detecting -> ... -> monitoring`). Rollbacks also
//! take a dedicated rollback mutex; breaker changes go through the
//! registry's own mutex.
//!
//! # Lifecycle
//!
//! ```text
//! new() -> start() -> initiate_recovery()* -> shutdown()
//! ```
//!
//! `start` spawns the maintenance task (breaker sweep, checkpoint pruning,
//! operation retention). `shutdown` refuses new work, waits for in-flight
//! recoveries up to a timeout, then clears every store.

use crate::checkpoint::CheckpointStore;
use crate::circuit::{CircuitBreakerRegistry, CircuitBreakerState, CircuitState};
use crate::compensation::{ActionId, CompensationActionSpec, CompensationRegistry};
use crate::config::{CircuitBreakerConfig, RecoveryConfig};
use crate::error::RecoveryError;
use crate::events::{EventBus, RecoveryEvent};
use crate::handlers::{LoggingRollback, RecoveryAction, RollbackHandler};
use crate::types::{
    CheckpointId, ContextMap, OperationId, OperationStatus, RecoveryCheckpoint, RecoveryOperation,
    RecoveryState, RecoveryStats, RecoveryStrategy,
};
use recovery_sync::{AtomicBoolean, AtomicCounter, ConcurrentMap, GuardedStateMachine, Mutex};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument;

/// A failure report handed to [`RecoveryOrchestrator::initiate_recovery`]
#[derive(Clone)]
pub struct RecoveryRequest {
    /// Component that failed
    pub component: String,
    /// Triggering error message
    pub error: String,
    /// Caller context
    pub context: ContextMap,
    /// Strategy to apply
    pub strategy: RecoveryStrategy,
    /// Attempt budget override
    pub max_attempts: Option<u32>,
    /// Effect re-run by the retry strategy
    pub action: Option<Arc<dyn RecoveryAction>>,
    /// Breaker tuning for the circuit-break strategy
    pub breaker_config: Option<CircuitBreakerConfig>,
}

impl RecoveryRequest {
    /// Report `error` on `component`, to be handled with `strategy`
    pub fn new(
        component: impl Into<String>,
        error: impl fmt::Display,
        strategy: RecoveryStrategy,
    ) -> Self {
        Self {
            component: component.into(),
            error: error.to_string(),
            context: ContextMap::new(),
            strategy,
            max_attempts: None,
            action: None,
            breaker_config: None,
        }
    }

    /// Retry request driven by `action`
    pub fn retry(
        component: impl Into<String>,
        error: impl fmt::Display,
        action: impl RecoveryAction + 'static,
    ) -> Self {
        Self::new(component, error, RecoveryStrategy::Retry).with_action(action)
    }

    /// Replace the caller context
    #[inline]
    #[must_use]
    pub fn with_context(mut self, context: ContextMap) -> Self {
        self.context = context;
        self
    }

    /// Add one context entry
    #[inline]
    #[must_use]
    pub fn with_context_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Override the attempt budget
    #[inline]
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Set the retry effect
    #[inline]
    #[must_use]
    pub fn with_action(mut self, action: impl RecoveryAction + 'static) -> Self {
        self.action = Some(Arc::new(action));
        self
    }

    /// Set a shared retry effect
    #[inline]
    #[must_use]
    pub fn with_shared_action(mut self, action: Arc<dyn RecoveryAction>) -> Self {
        self.action = Some(action);
        self
    }

    /// Set breaker tuning
    #[inline]
    #[must_use]
    pub fn with_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = Some(config);
        self
    }
}

impl fmt::Debug for RecoveryRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryRequest")
            .field("component", &self.component)
            .field("error", &self.error)
            .field("strategy", &self.strategy)
            .field("max_attempts", &self.max_attempts)
            .field("has_action", &self.action.is_some())
            .field("breaker_config", &self.breaker_config)
            .finish_non_exhaustive()
    }
}

/// Outcome of [`RecoveryOrchestrator::shutdown`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every in-flight recovery finished before the stores were cleared
    pub drained: bool,
    /// Recoveries still running when the timeout elapsed
    pub remaining_operations: u64,
    /// Time spent waiting for the drain
    pub waited: Duration,
    /// This call found shutdown already under way and did nothing
    pub already_shut_down: bool,
}

struct Maintenance {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Decrements the active-operation counter on every exit path
struct ActiveOperation<'a> {
    counter: &'a AtomicCounter,
}

impl<'a> ActiveOperation<'a> {
    fn enter(counter: &'a AtomicCounter) -> Self {
        counter.increment();
        Self { counter }
    }
}

impl Drop for ActiveOperation<'_> {
    fn drop(&mut self) {
        self.counter.decrement();
    }
}

/// The recovery service
pub struct RecoveryOrchestrator {
    config: RecoveryConfig,
    state: GuardedStateMachine<RecoveryState>,
    operation_mutex: Mutex,
    rollback_mutex: Mutex,
    checkpoints: CheckpointStore,
    breakers: CircuitBreakerRegistry,
    compensations: CompensationRegistry,
    operations: ConcurrentMap<OperationId, RecoveryOperation>,
    active_operations: AtomicCounter,
    successful_recoveries: AtomicCounter,
    failed_recoveries: AtomicCounter,
    shutting_down: AtomicBoolean,
    events: EventBus,
    rollback_handler: Arc<dyn RollbackHandler>,
    maintenance: parking_lot::Mutex<Option<Maintenance>>,
}

impl RecoveryOrchestrator {
    /// Create an orchestrator sitting in `monitoring`
    #[must_use]
    pub fn new(config: RecoveryConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            state: recovery_state_machine(),
            operation_mutex: Mutex::new(),
            rollback_mutex: Mutex::new(),
            checkpoints: CheckpointStore::new(config.max_checkpoints, events.clone()),
            breakers: CircuitBreakerRegistry::new(config.circuit_breaker, events.clone()),
            compensations: CompensationRegistry::new(),
            operations: ConcurrentMap::new(),
            active_operations: AtomicCounter::new(),
            successful_recoveries: AtomicCounter::new(),
            failed_recoveries: AtomicCounter::new(),
            shutting_down: AtomicBoolean::new(false),
            events,
            rollback_handler: Arc::new(LoggingRollback),
            maintenance: parking_lot::Mutex::new(None),
            config,
        }
    }

    /// Use `handler` to apply rollbacks
    #[must_use]
    pub fn with_rollback_handler(mut self, handler: Arc<dyn RollbackHandler>) -> Self {
        self.rollback_handler = handler;
        self
    }

    /// Spawn the maintenance task on the current tokio runtime
    ///
    /// Every `maintenance_interval` it sweeps circuit breakers, prunes
    /// checkpoints and trims retained operations. Calling `start` twice, or
    /// after shutdown began, does nothing.
    pub fn start(self: &Arc<Self>) {
        if self.is_shutting_down() {
            tracing::warn!("start ignored: shutdown already requested");
            return;
        }
        let mut slot = self.maintenance.lock();
        if slot.is_some() {
            return;
        }

        let (stop, mut stopped) = watch::channel(false);
        let orchestrator = Arc::downgrade(self);
        let period = self.config.maintenance_interval().max(Duration::from_millis(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(orchestrator) = orchestrator.upgrade() else { break };
                        orchestrator.run_maintenance().await;
                    }
                    _ = stopped.changed() => break,
                }
            }
            tracing::debug!("maintenance task stopped");
        });

        tracing::info!(interval_ms = self.config.maintenance_interval_ms, "recovery maintenance started");
        *slot = Some(Maintenance { stop, task });
    }

    /// One maintenance pass
    pub async fn run_maintenance(&self) {
        let half_open = self.sweep_circuit_breakers().await;
        let pruned = self.prune_checkpoints().await;
        let trimmed = self.prune_operations();
        tracing::debug!(
            half_open = half_open.len(),
            pruned_checkpoints = pruned,
            trimmed_operations = trimmed,
            "maintenance pass"
        );
    }

    /// Report a failure and recover from it with the requested strategy
    ///
    /// Returns once the recovery reaches a terminal status (including the
    /// stabilization period). Strategy failures such as exhausted retries,
    /// missing checkpoints or missing compensation actions are recorded on
    /// the operation, counted and published as `recovery-failed`; they do not
    /// make this call fail.
    ///
    /// # Errors
    /// - `RecoveryError::ShuttingDown` if shutdown has begun, or if a forced
    ///   shutdown cleared the stores while this recovery was still running
    /// - `RecoveryError::InvalidTransition` if the global state machine
    ///   rejects a step; the operation is marked failed
    pub async fn initiate_recovery(
        &self,
        request: RecoveryRequest,
    ) -> Result<OperationId, RecoveryError> {
        self.ensure_accepting()?;
        let _lock = self.operation_mutex.acquire().await;
        // Shutdown may have begun while this call was queued
        self.ensure_accepting()?;
        let _active = ActiveOperation::enter(&self.active_operations);

        self.enter_detection()?;

        let mut context = request.context.clone();
        context.insert("error".to_string(), Value::String(request.error.clone()));
        let max_attempts = request
            .max_attempts
            .unwrap_or_else(|| {
                request
                    .strategy
                    .default_max_attempts(self.config.retry_max_attempts)
            })
            .max(1);
        let operation =
            RecoveryOperation::new(request.strategy, &request.component, context, max_attempts);
        let id = operation.id;
        self.operations.set(id, operation);

        let span = tracing::info_span!(
            "recovery",
            operation_id = %id,
            component = %request.component,
            strategy = %request.strategy,
        );
        async {
            tracing::info!(error = %request.error, max_attempts, "recovery initiated");
            self.operations
                .update(&id, |op| op.status = OperationStatus::Executing);

            match self.dispatch(id, &request).await {
                Ok(()) => Ok(id),
                // Shutdown cleared the stores underneath this recovery
                Err(e) if self.is_shutting_down() && self.operations.get(&id).is_none() => {
                    tracing::warn!(error = %e, "recovery outlived shutdown");
                    Err(RecoveryError::ShuttingDown)
                }
                Err(e) => {
                    tracing::error!(error = %e, "recovery aborted");
                    self.abort(id, &request, &e);
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn dispatch(&self, id: OperationId, request: &RecoveryRequest) -> Result<(), RecoveryError> {
        match request.strategy {
            RecoveryStrategy::Retry => self.run_retry(id, request).await,
            RecoveryStrategy::Rollback => self.run_rollback(id, request).await,
            RecoveryStrategy::Compensate => self.run_compensation(id, request).await,
            RecoveryStrategy::CircuitBreak => self.run_circuit_break(id, request).await,
        }
    }

    async fn run_retry(&self, id: OperationId, request: &RecoveryRequest) -> Result<(), RecoveryError> {
        self.transition(RecoveryState::Recovering)?;

        let Some(action) = request.action.clone() else {
            return self.finish_failed(id, request, "no recovery action supplied for retry");
        };
        let max_attempts = self.operations.get(&id).map_or(1, |op| op.max_attempts);

        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            let snapshot = self
                .operations
                .update(&id, |op| {
                    op.current_attempt = attempt;
                    op.clone()
                })
                .ok_or(RecoveryError::OperationNotFound(id))?;

            match action.attempt(&snapshot).await {
                Ok(result) => {
                    tracing::info!(attempt, "recovery attempt succeeded");
                    self.finish_completed(id, request, result);
                    return self.stabilize(self.config.stabilization()).await;
                }
                Err(e) => {
                    tracing::warn!(attempt, max_attempts, error = %e, "recovery attempt failed");
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        tokio::time::sleep(self.config.backoff_for(attempt)).await;
                    }
                }
            }
        }

        self.finish_failed(
            id,
            request,
            format!("retry exhausted after {max_attempts} attempts: {last_error}"),
        )
    }

    async fn run_rollback(&self, id: OperationId, request: &RecoveryRequest) -> Result<(), RecoveryError> {
        self.transition(RecoveryState::RollingBack)?;
        let _rollback = self.rollback_mutex.acquire().await;

        let Some(checkpoint) = self.checkpoints.latest_for(&request.component) else {
            let err = RecoveryError::NoCheckpoint {
                context: request.component.clone(),
            };
            return self.finish_failed(id, request, err.to_string());
        };

        if let Err(e) = self
            .rollback_handler
            .rollback(&request.component, &checkpoint)
            .await
        {
            return self.finish_failed(
                id,
                request,
                format!("rollback to checkpoint {} failed: {e}", checkpoint.id),
            );
        }

        tracing::info!(checkpoint = %checkpoint.id, "rolled back");
        self.finish_completed(
            id,
            request,
            json!({
                "rolledBackTo": checkpoint.id,
                "checkpointTime": checkpoint.timestamp,
            }),
        );
        self.events.publish(RecoveryEvent::RollbackCompleted {
            operation_id: id,
            component: request.component.clone(),
            checkpoint_id: checkpoint.id,
        });
        self.stabilize(self.config.rollback_stabilization()).await
    }

    async fn run_compensation(
        &self,
        id: OperationId,
        request: &RecoveryRequest,
    ) -> Result<(), RecoveryError> {
        self.transition(RecoveryState::Recovering)?;

        let context = self
            .operations
            .get(&id)
            .map(|op| op.context)
            .unwrap_or_default();
        match self.compensations.execute(&request.component, &context).await {
            Ok(results) => {
                let failures = results.iter().filter(|r| !r.success).count();
                tracing::info!(actions = results.len(), failures, "compensation finished");
                let result = serde_json::to_value(&results).unwrap_or_default();
                self.events.publish(RecoveryEvent::CompensationCompleted {
                    operation_id: id,
                    component: request.component.clone(),
                    results,
                });
                self.finish_completed(id, request, result);
                self.stabilize(self.config.stabilization()).await
            }
            Err(e) => self.finish_failed(id, request, e.to_string()),
        }
    }

    async fn run_circuit_break(
        &self,
        id: OperationId,
        request: &RecoveryRequest,
    ) -> Result<(), RecoveryError> {
        let breaker = self
            .breakers
            .open(&request.component, request.breaker_config)
            .await;
        self.finish_completed(
            id,
            request,
            json!({
                "circuitState": CircuitState::Open,
                "resetTime": breaker.reset_at,
                "failureCount": breaker.failure_count,
            }),
        );
        Ok(())
    }

    fn enter_detection(&self) -> Result<(), RecoveryError> {
        match self.state.state() {
            // Left there by a circuit-break recovery
            RecoveryState::Detecting => {
                tracing::debug!("resuming from detecting");
                Ok(())
            }
            RecoveryState::Failed => {
                self.transition(RecoveryState::Monitoring)?;
                self.transition(RecoveryState::Detecting)
            }
            _ => self.transition(RecoveryState::Detecting),
        }
    }

    fn transition(&self, to: RecoveryState) -> Result<(), RecoveryError> {
        let change = self.state.transition(to)?;
        self.events.publish(RecoveryEvent::StateChanged {
            from: change.from,
            to: change.to,
            timestamp: change.timestamp,
        });
        Ok(())
    }

    async fn stabilize(&self, delay: Duration) -> Result<(), RecoveryError> {
        self.transition(RecoveryState::Stabilizing)?;
        tokio::time::sleep(delay).await;
        self.transition(RecoveryState::Monitoring)
    }

    fn finish_completed(&self, id: OperationId, request: &RecoveryRequest, result: Value) {
        let newly_terminal = self
            .operations
            .update(&id, |op| op.complete(result))
            .unwrap_or(false);
        if newly_terminal {
            self.successful_recoveries.increment();
            tracing::info!("recovery completed");
            self.events.publish(RecoveryEvent::RecoveryCompleted {
                operation_id: id,
                component: request.component.clone(),
                strategy: request.strategy,
            });
        }
    }

    fn finish_failed(
        &self,
        id: OperationId,
        request: &RecoveryRequest,
        error: impl Into<String>,
    ) -> Result<(), RecoveryError> {
        self.mark_failed(id, request, error.into());
        self.transition(RecoveryState::Failed)
    }

    fn mark_failed(&self, id: OperationId, request: &RecoveryRequest, error: String) {
        let newly_terminal = self
            .operations
            .update(&id, |op| op.fail(error.clone()))
            .unwrap_or(false);
        if newly_terminal {
            self.failed_recoveries.increment();
            tracing::warn!(%error, "recovery failed");
            self.events.publish(RecoveryEvent::RecoveryFailed {
                operation_id: id,
                component: request.component.clone(),
                strategy: request.strategy,
                error,
            });
        }
    }

    fn abort(&self, id: OperationId, request: &RecoveryRequest, error: &RecoveryError) {
        self.mark_failed(id, request, error.to_string());
        let current = self.state.state();
        if current == RecoveryState::Failed {
            return;
        }
        if let Err(e) = self.transition(RecoveryState::Failed) {
            tracing::warn!(state = %current, error = %e, "could not move to failed");
        }
    }

    /// Store a checkpoint for `context`
    ///
    /// # Errors
    /// - `RecoveryError::ShuttingDown` if shutdown has begun
    pub async fn create_checkpoint(
        &self,
        context: &str,
        state: &ContextMap,
        metadata: ContextMap,
    ) -> Result<CheckpointId, RecoveryError> {
        self.ensure_accepting()?;
        self.checkpoints.create(context, state, metadata).await
    }

    /// Replace `component`'s compensation actions
    ///
    /// # Errors
    /// - `RecoveryError::ShuttingDown` if shutdown has begun
    pub fn register_compensation_actions(
        &self,
        component: &str,
        actions: Vec<CompensationActionSpec>,
    ) -> Result<Vec<ActionId>, RecoveryError> {
        self.ensure_accepting()?;
        Ok(self.compensations.register(component, actions))
    }

    /// Close `component`'s breaker after a successful trial call
    ///
    /// # Errors
    /// - `RecoveryError::ShuttingDown` if shutdown has begun
    pub async fn close_circuit_breaker(&self, component: &str) -> Result<bool, RecoveryError> {
        self.ensure_accepting()?;
        Ok(self.breakers.close(component).await)
    }

    /// Count a failed call against `component`'s breaker
    ///
    /// # Errors
    /// - `RecoveryError::ShuttingDown` if shutdown has begun
    pub async fn record_call_failure(&self, component: &str) -> Result<CircuitState, RecoveryError> {
        self.ensure_accepting()?;
        Ok(self.breakers.record_failure(component).await)
    }

    /// Whether a call to `component` may proceed
    #[inline]
    #[must_use]
    pub fn try_acquire_call(&self, component: &str) -> bool {
        self.breakers.try_acquire_call(component)
    }

    /// Snapshot of `component`'s breaker
    #[inline]
    #[must_use]
    pub fn circuit_breaker(&self, component: &str) -> Option<CircuitBreakerState> {
        self.breakers.get(component)
    }

    /// Move due breakers to half-open
    pub async fn sweep_circuit_breakers(&self) -> Vec<String> {
        self.breakers.sweep().await
    }

    /// Enforce the checkpoint ceiling
    pub async fn prune_checkpoints(&self) -> usize {
        self.checkpoints.prune_if_needed().await
    }

    /// Drop the oldest terminal operations beyond `max_retained_operations`
    pub fn prune_operations(&self) -> usize {
        let mut terminal: Vec<RecoveryOperation> = self
            .operations
            .values()
            .into_iter()
            .filter(|op| op.status.is_terminal())
            .collect();
        let excess = terminal
            .len()
            .saturating_sub(self.config.max_retained_operations);
        if excess == 0 {
            return 0;
        }
        terminal.sort_by_key(|op| op.end_time);
        for op in terminal.iter().take(excess) {
            self.operations.delete(&op.id);
        }
        excess
    }

    /// Most recent checkpoint for `context`
    #[inline]
    #[must_use]
    pub fn latest_checkpoint(&self, context: &str) -> Option<RecoveryCheckpoint> {
        self.checkpoints.latest_for(context)
    }

    /// Checkpoint history for `context`, newest first
    #[inline]
    #[must_use]
    pub fn checkpoint_history(&self, context: &str) -> Vec<RecoveryCheckpoint> {
        self.checkpoints.history(context)
    }

    /// Snapshot of one operation
    #[inline]
    #[must_use]
    pub fn operation(&self, id: OperationId) -> Option<RecoveryOperation> {
        self.operations.get(&id)
    }

    /// Snapshot of all retained operations, oldest first
    #[must_use]
    pub fn operations(&self) -> Vec<RecoveryOperation> {
        let mut operations = self.operations.values();
        operations.sort_by_key(|op| (op.start_time, op.id));
        operations
    }

    /// Current global state
    #[inline]
    #[must_use]
    pub fn state(&self) -> RecoveryState {
        self.state.state()
    }

    /// Subscribe to lifecycle events
    #[inline]
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RecoveryEvent> {
        self.events.subscribe()
    }

    /// Get configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Whether shutdown has begun
    #[inline]
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.get()
    }

    /// Health snapshot; never blocks and stays available during shutdown
    #[must_use]
    pub fn stats(&self) -> RecoveryStats {
        let successful = self.successful_recoveries.get();
        let failed = self.failed_recoveries.get();
        RecoveryStats {
            state: self.state.state(),
            active_operations: self.active_operations.get(),
            checkpoint_count: self.checkpoints.len(),
            successful_recoveries: successful,
            failed_recoveries: failed,
            success_rate: RecoveryStats::rate(successful, failed),
            circuit_breaker_count: self.breakers.len(),
            is_shutting_down: self.shutting_down.get(),
        }
    }

    /// Shut down with the configured drain timeout
    pub async fn shutdown(&self) -> ShutdownReport {
        self.shutdown_with_timeout(self.config.shutdown_timeout()).await
    }

    /// Refuse new work, wait up to `timeout` for in-flight recoveries, then
    /// clear every store and counter
    ///
    /// In-flight recoveries are not cancelled: if the timeout elapses they
    /// keep running against the cleared stores. Calling this again once
    /// shutdown has begun returns immediately.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> ShutdownReport {
        if !self.shutting_down.set_once() {
            tracing::debug!("shutdown already requested");
            let remaining = self.active_operations.get();
            return ShutdownReport {
                drained: remaining == 0,
                remaining_operations: remaining,
                waited: Duration::ZERO,
                already_shut_down: true,
            };
        }

        tracing::info!(timeout_ms = timeout.as_millis(), "recovery core shutting down");
        self.checkpoints.begin_drain();
        self.stop_maintenance().await;

        let started = Instant::now();
        let deadline = started + timeout;
        let poll = self.config.shutdown_poll();
        loop {
            let active = self.active_operations.get();
            if active == 0 {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    active,
                    timeout_ms = timeout.as_millis(),
                    "shutdown timeout elapsed with recoveries still active; proceeding"
                );
                break;
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
        let remaining = self.active_operations.get();
        let waited = started.elapsed();

        self.checkpoints.clear().await;
        self.breakers.clear().await;
        self.compensations.clear();
        self.operations.clear();
        self.successful_recoveries.reset();
        self.failed_recoveries.reset();
        self.active_operations.reset();
        self.state.reset();

        tracing::info!(drained = remaining == 0, waited_ms = waited.as_millis(), "recovery core shut down");
        ShutdownReport {
            drained: remaining == 0,
            remaining_operations: remaining,
            waited,
            already_shut_down: false,
        }
    }

    async fn stop_maintenance(&self) {
        let maintenance = self.maintenance.lock().take();
        if let Some(Maintenance { stop, task }) = maintenance {
            let _ = stop.send(true);
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "maintenance task ended abnormally");
            }
        }
    }

    fn ensure_accepting(&self) -> Result<(), RecoveryError> {
        if self.shutting_down.get() {
            Err(RecoveryError::ShuttingDown)
        } else {
            Ok(())
        }
    }
}

impl Default for RecoveryOrchestrator {
    fn default() -> Self {
        Self::new(RecoveryConfig::default())
    }
}

impl fmt::Debug for RecoveryOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryOrchestrator")
            .field("state", &self.state.state())
            .field("active_operations", &self.active_operations.get())
            .field("checkpoints", &self.checkpoints.len())
            .field("circuit_breakers", &self.breakers.len())
            .field("shutting_down", &self.shutting_down.get())
            .finish_non_exhaustive()
    }
}

impl Drop for RecoveryOrchestrator {
    fn drop(&mut self) {
        if let Some(maintenance) = self.maintenance.get_mut().take() {
            maintenance.task.abort();
        }
    }
}

fn recovery_state_machine() -> GuardedStateMachine<RecoveryState> {
    let mut machine = GuardedStateMachine::new(RecoveryState::Monitoring);
    for from in RecoveryState::ALL {
        for &to in from.allowed_transitions() {
            machine.add_transition(from, to);
        }
    }
    machine
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ActionError;
    use crate::handlers::recovery_fn;

    fn fast_config() -> RecoveryConfig {
        RecoveryConfig::default()
            .with_stabilization(Duration::from_millis(10), Duration::from_millis(10))
            .with_backoff(Duration::from_millis(5), Duration::from_millis(20))
    }

    #[test]
    fn state_machine_matches_table() {
        let machine = recovery_state_machine();
        for from in RecoveryState::ALL {
            for to in RecoveryState::ALL {
                assert_eq!(
                    machine.is_allowed(from, to),
                    from.allowed_transitions().contains(&to),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[tokio::test]
    async fn new_orchestrator_is_idle() {
        let orchestrator = RecoveryOrchestrator::default();
        let stats = orchestrator.stats();
        assert_eq!(stats.state, RecoveryState::Monitoring);
        assert_eq!(stats.active_operations, 0);
        assert!((stats.success_rate - 0.0).abs() < f64::EPSILON);
        assert!(!stats.is_shutting_down);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_on_second_attempt() {
        let orchestrator = RecoveryOrchestrator::new(fast_config());
        let action = recovery_fn(|op: RecoveryOperation| async move {
            if op.current_attempt < 2 {
                Err(ActionError::new("still down"))
            } else {
                Ok(json!({ "attempt": op.current_attempt }))
            }
        });

        let id = orchestrator
            .initiate_recovery(RecoveryRequest::retry("svc", "timeout", action))
            .await
            .unwrap();

        let op = orchestrator.operation(id).unwrap();
        assert_eq!(op.status, OperationStatus::Completed);
        assert_eq!(op.current_attempt, 2);
        assert_eq!(op.result, Some(json!({ "attempt": 2 })));
        assert_eq!(op.context["error"], json!("timeout"));
        assert_eq!(orchestrator.state(), RecoveryState::Monitoring);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_without_action_fails_fast() {
        let orchestrator = RecoveryOrchestrator::new(fast_config());
        let id = orchestrator
            .initiate_recovery(RecoveryRequest::new("svc", "boom", RecoveryStrategy::Retry))
            .await
            .unwrap();

        let op = orchestrator.operation(id).unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.current_attempt, 0);
        assert_eq!(orchestrator.state(), RecoveryState::Failed);
        assert_eq!(orchestrator.stats().failed_recoveries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_state_recovers_on_next_request() {
        let orchestrator = RecoveryOrchestrator::new(fast_config());
        orchestrator
            .initiate_recovery(RecoveryRequest::new("svc", "boom", RecoveryStrategy::Rollback))
            .await
            .unwrap();
        assert_eq!(orchestrator.state(), RecoveryState::Failed);

        orchestrator
            .create_checkpoint("svc", &ContextMap::new(), ContextMap::new())
            .await
            .unwrap();
        let id = orchestrator
            .initiate_recovery(RecoveryRequest::new("svc", "boom", RecoveryStrategy::Rollback))
            .await
            .unwrap();

        assert_eq!(orchestrator.operation(id).unwrap().status, OperationStatus::Completed);
        assert_eq!(orchestrator.state(), RecoveryState::Monitoring);
    }

    #[tokio::test]
    async fn circuit_break_leaves_detecting_and_next_recovery_resumes() {
        let orchestrator = RecoveryOrchestrator::new(fast_config());
        orchestrator
            .initiate_recovery(RecoveryRequest::new("payments", "5xx", RecoveryStrategy::CircuitBreak))
            .await
            .unwrap();
        assert_eq!(orchestrator.state(), RecoveryState::Detecting);

        orchestrator
            .create_checkpoint("payments", &ContextMap::new(), ContextMap::new())
            .await
            .unwrap();
        orchestrator
            .initiate_recovery(RecoveryRequest::new("payments", "5xx", RecoveryStrategy::Rollback))
            .await
            .unwrap();
        assert_eq!(orchestrator.state(), RecoveryState::Monitoring);
    }

    #[tokio::test]
    async fn circuit_break_leaves_failure_count_unchanged() {
        let orchestrator = RecoveryOrchestrator::new(fast_config());
        orchestrator.record_call_failure("payments").await.unwrap();

        for _ in 0..2 {
            let id = orchestrator
                .initiate_recovery(RecoveryRequest::new("payments", "5xx", RecoveryStrategy::CircuitBreak))
                .await
                .unwrap();
            let result = orchestrator.operation(id).unwrap().result.unwrap();
            assert_eq!(result["failureCount"], json!(1));
        }
        assert_eq!(orchestrator.circuit_breaker("payments").unwrap().failure_count, 1);
    }

    #[tokio::test]
    async fn prune_operations_keeps_newest() {
        let mut config = fast_config();
        config.max_retained_operations = 2;
        let orchestrator = RecoveryOrchestrator::new(config);

        for i in 0..4 {
            orchestrator
                .initiate_recovery(RecoveryRequest::new(
                    format!("svc-{i}"),
                    "down",
                    RecoveryStrategy::CircuitBreak,
                ))
                .await
                .unwrap();
        }

        assert_eq!(orchestrator.prune_operations(), 2);
        assert_eq!(orchestrator.operations().len(), 2);
        assert_eq!(orchestrator.prune_operations(), 0);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_blocks_mutation() {
        let orchestrator = RecoveryOrchestrator::new(fast_config());
        let first = orchestrator.shutdown().await;
        assert!(first.drained);
        assert!(!first.already_shut_down);

        let second = orchestrator.shutdown().await;
        assert!(second.already_shut_down);

        let err = orchestrator
            .create_checkpoint("svc", &ContextMap::new(), ContextMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RecoveryError::ShuttingDown));
        assert!(matches!(
            orchestrator.register_compensation_actions("db", Vec::new()),
            Err(RecoveryError::ShuttingDown)
        ));
        assert!(orchestrator.stats().is_shutting_down);
    }
}
