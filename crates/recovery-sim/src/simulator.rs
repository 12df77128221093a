//! Recovery simulator
//!
//! Drives a seeded mix of checkpoints, call failures and recoveries through a
//! live orchestrator with scaled-down timings, then checks the bookkeeping:
//! - every recovery call returns an operation id
//! - successful + failed counters equal the number of terminal operations
//! - every checkpoint chain links back through all checkpoints of its context
//! - shutdown drains cleanly once the run is over

use async_trait::async_trait;
use rand::{rngs::StdRng, Rng, SeedableRng};
use recovery_core::{
    spawn_event_logger, ActionError, CompensationActionSpec, ContextMap, OperationStatus,
    RecoveryAction, RecoveryConfig, RecoveryOperation, RecoveryOrchestrator, RecoveryRequest,
    RecoveryStrategy, ShutdownReport,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

const COMPONENTS: [&str; 4] = ["api", "db", "cache", "payments"];

/// Simulator configuration
#[derive(Debug, Clone, Serialize)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Operations to drive through the orchestrator
    pub operations: u64,
    /// Stop at the first violation
    pub stop_on_first_violation: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            operations: 200,
            stop_on_first_violation: false,
        }
    }
}

/// A violation detected during simulation
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Violation {
    /// A recovery call returned an error instead of an operation id
    RecoveryRejected { step: u64, error: String },
    /// A checkpoint write was refused while the orchestrator was running
    CheckpointRejected { step: u64, error: String },
    /// Terminal counters disagree with the retained operations
    CounterMismatch {
        successful: u64,
        failed: u64,
        terminal: u64,
    },
    /// A context's history is shorter than the checkpoints written for it
    BrokenChain {
        context: String,
        created: usize,
        linked: usize,
    },
    /// Shutdown could not drain
    ShutdownNotDrained { remaining: u64 },
}

/// Statistics for simulation
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulatorStats {
    pub checkpoints_created: u64,
    pub call_failures_recorded: u64,
    pub retries: u64,
    pub rollbacks: u64,
    pub compensations: u64,
    pub circuit_breaks: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Final report from simulator
#[derive(Debug, Clone, Serialize)]
pub struct SimulatorReport {
    pub config: SimulatorConfig,
    pub stats: SimulatorStats,
    pub violations: Vec<Violation>,
    pub success_rate: f64,
    pub shutdown_waited_ms: u128,
}

impl SimulatorReport {
    /// Check if simulation passed all criteria
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Generate text report
    #[must_use]
    pub fn generate_text(&self) -> String {
        use std::fmt::Write;

        let mut report = String::new();
        let _ = writeln!(report, "=== Recovery Simulator Report ===\n");
        let _ = writeln!(report, "Seed: {}", self.config.seed);
        let _ = writeln!(report, "Operations: {}", self.config.operations);
        let _ = writeln!(report, "Checkpoints Created: {}", self.stats.checkpoints_created);
        let _ = writeln!(report, "Call Failures Recorded: {}", self.stats.call_failures_recorded);
        let _ = writeln!(report, "Retries: {}", self.stats.retries);
        let _ = writeln!(report, "Rollbacks: {}", self.stats.rollbacks);
        let _ = writeln!(report, "Compensations: {}", self.stats.compensations);
        let _ = writeln!(report, "Circuit Breaks: {}", self.stats.circuit_breaks);
        let _ = writeln!(report, "Completed: {}", self.stats.completed);
        let _ = writeln!(report, "Failed: {}", self.stats.failed);
        let _ = writeln!(report, "Success Rate: {:.2}", self.success_rate);
        let _ = writeln!(report, "Shutdown Wait: {}ms", self.shutdown_waited_ms);
        let _ = writeln!(report, "Violations: {}", self.violations.len());

        if !self.violations.is_empty() {
            report.push_str("\n=== Violations ===\n");
            for (i, v) in self.violations.iter().enumerate() {
                let _ = writeln!(report, "{}. {:?}", i + 1, v);
            }
        }

        let _ = writeln!(
            report,
            "\n=== Result: {} ===",
            if self.passed() { "PASS" } else { "FAIL" }
        );
        report
    }
}

/// Recovery action that fails a fixed number of times before succeeding
#[derive(Debug)]
struct FlakyAction {
    failures: u32,
    calls: AtomicU32,
}

impl FlakyAction {
    fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl RecoveryAction for FlakyAction {
    async fn attempt(&self, operation: &RecoveryOperation) -> Result<Value, ActionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            Err(ActionError::new(format!(
                "{} unavailable (call {call})",
                operation.target_component
            )))
        } else {
            Ok(json!({ "recoveredOnAttempt": operation.current_attempt }))
        }
    }
}

/// Orchestrator settings with every delay scaled down to milliseconds
#[must_use]
pub fn simulation_config(operations: u64) -> RecoveryConfig {
    let retained = usize::try_from(operations).unwrap_or(usize::MAX).max(1);
    let mut config = RecoveryConfig::new()
        .with_max_checkpoints(retained)
        .with_maintenance_interval(Duration::from_millis(20))
        .with_stabilization(Duration::from_millis(1), Duration::from_millis(2))
        .with_backoff(Duration::from_millis(1), Duration::from_millis(8));
    config.max_retained_operations = retained;
    config.circuit_breaker.reset_timeout_ms = 10;
    config
}

fn compensation_actions(rng: &mut StdRng, component: &str) -> Vec<CompensationActionSpec> {
    let steps = rng.gen_range(1..=3);
    let broken = rng.gen_bool(0.2).then(|| rng.gen_range(0..steps));
    (0..steps)
        .map(|step| {
            let id = format!("{component}-undo-{step}");
            let fails = broken == Some(step);
            let spec = CompensationActionSpec::new(id.clone(), move |_context: ContextMap| async move {
                if fails {
                    Err(ActionError::new("undo rejected"))
                } else {
                    Ok(())
                }
            })
            .with_id(id)
            .with_priority(rng.gen_range(1..=10));
            if step > 0 {
                spec.depends_on(format!("{component}-undo-{}", step - 1))
            } else {
                spec
            }
        })
        .collect()
}

/// Run the recovery simulator
pub async fn run_simulator(config: SimulatorConfig) -> SimulatorReport {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let orchestrator = Arc::new(RecoveryOrchestrator::new(simulation_config(config.operations)));
    orchestrator.start();
    let logger = spawn_event_logger(orchestrator.subscribe());

    let mut stats = SimulatorStats::default();
    let mut violations = Vec::new();
    let mut created: HashMap<&'static str, usize> = HashMap::new();

    for component in ["db", "cache"] {
        let actions = compensation_actions(&mut rng, component);
        if let Err(e) = orchestrator.register_compensation_actions(component, actions) {
            tracing::error!(component, error = %e, "could not register compensation actions");
        }
    }

    for step in 0..config.operations {
        let component = COMPONENTS[rng.gen_range(0..COMPONENTS.len())];
        let request = match rng.gen_range(0..6) {
            0 => {
                let mut state = ContextMap::new();
                state.insert("step".to_string(), json!(step));
                match orchestrator
                    .create_checkpoint(component, &state, ContextMap::new())
                    .await
                {
                    Ok(_) => {
                        stats.checkpoints_created += 1;
                        *created.entry(component).or_default() += 1;
                    }
                    Err(e) => violations.push(Violation::CheckpointRejected {
                        step,
                        error: e.to_string(),
                    }),
                }
                None
            }
            1 => {
                if orchestrator.record_call_failure(component).await.is_ok() {
                    stats.call_failures_recorded += 1;
                }
                None
            }
            2 => {
                stats.retries += 1;
                let action = FlakyAction::new(rng.gen_range(0..=4));
                Some(RecoveryRequest::retry(component, "request timed out", action))
            }
            3 => {
                stats.rollbacks += 1;
                Some(RecoveryRequest::new(component, "state corrupted", RecoveryStrategy::Rollback))
            }
            4 => {
                stats.compensations += 1;
                Some(RecoveryRequest::new(component, "partial write", RecoveryStrategy::Compensate))
            }
            _ => {
                stats.circuit_breaks += 1;
                Some(RecoveryRequest::new(component, "upstream 5xx", RecoveryStrategy::CircuitBreak))
            }
        };

        let Some(request) = request else { continue };
        let request = request.with_context_value("step", step);
        match orchestrator.initiate_recovery(request).await {
            Ok(id) => match orchestrator.operation(id).map(|op| op.status) {
                Some(OperationStatus::Completed) => stats.completed += 1,
                Some(OperationStatus::Failed) => stats.failed += 1,
                _ => {}
            },
            Err(e) => violations.push(Violation::RecoveryRejected {
                step,
                error: e.to_string(),
            }),
        }

        if config.stop_on_first_violation && !violations.is_empty() {
            break;
        }
    }

    let snapshot = orchestrator.stats();
    let terminal = orchestrator
        .operations()
        .iter()
        .filter(|op| op.status.is_terminal())
        .count() as u64;
    if snapshot.successful_recoveries + snapshot.failed_recoveries != terminal {
        violations.push(Violation::CounterMismatch {
            successful: snapshot.successful_recoveries,
            failed: snapshot.failed_recoveries,
            terminal,
        });
    }

    for (context, count) in &created {
        let linked = orchestrator.checkpoint_history(context).len();
        if linked != *count {
            violations.push(Violation::BrokenChain {
                context: (*context).to_string(),
                created: *count,
                linked,
            });
        }
    }

    let ShutdownReport {
        drained,
        remaining_operations,
        waited,
        ..
    } = orchestrator.shutdown().await;
    if !drained {
        violations.push(Violation::ShutdownNotDrained {
            remaining: remaining_operations,
        });
    }
    drop(orchestrator);
    if let Err(e) = logger.await {
        tracing::warn!(error = %e, "event logger ended abnormally");
    }

    SimulatorReport {
        config,
        stats,
        violations,
        success_rate: snapshot.success_rate,
        shutdown_waited_ms: waited.as_millis(),
    }
}
