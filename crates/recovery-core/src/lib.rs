//! Recovery Core - error recovery and resilience layer
//!
//! Lets a long-running system survive component failures:
//! - Checkpoints snapshot component state for later rollback
//! - Circuit breakers stop calls to repeatedly failing components
//! - Compensation actions undo completed work in dependency order
//! - Retries re-run a recovery action with exponential backoff
//!
//! A single global state machine (`monitoring -> detecting -> recovering /
//! rolling-back -> stabilizing -> monitoring`, plus `failed`) tracks what the
//! orchestrator is doing at any moment.
//!
//! # Example
//!
//! ```rust,ignore
//! use recovery_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), RecoveryError> {
//! let orchestrator = Arc::new(RecoveryOrchestrator::new(RecoveryConfig::new()));
//! orchestrator.start();
//!
//! let mut state = ContextMap::new();
//! state.insert("version".into(), 2.into());
//! orchestrator.create_checkpoint("svc", &state, ContextMap::new()).await?;
//!
//! let id = orchestrator
//!     .initiate_recovery(RecoveryRequest::new("svc", "crashed", RecoveryStrategy::Rollback))
//!     .await?;
//! println!("{:?}", orchestrator.operation(id));
//!
//! orchestrator.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod checkpoint;
pub mod circuit;
pub mod compensation;
pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod orchestrator;
pub mod types;

pub use checkpoint::CheckpointStore;
pub use circuit::{CircuitBreakerRegistry, CircuitBreakerState, CircuitState};
pub use compensation::{
    ActionId, CompensationAction, CompensationActionSpec, CompensationRegistry,
    CompensationResult, UndoFn, DEFAULT_PRIORITY,
};
pub use config::{CircuitBreakerConfig, RecoveryConfig};
pub use error::{ActionError, ConfigError, RecoveryError};
pub use events::{spawn_event_logger, EventBus, RecoveryEvent};
pub use handlers::{recovery_fn, LoggingRollback, RecoveryAction, RecoveryFn, RollbackHandler};
pub use orchestrator::{RecoveryOrchestrator, RecoveryRequest, ShutdownReport};
pub use types::{
    CheckpointId, ContextMap, OperationId, OperationStatus, RecoveryCheckpoint, RecoveryOperation,
    RecoveryState, RecoveryStats, RecoveryStrategy,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with the recovery core
    pub use crate::{
        ActionError, CircuitBreakerConfig, CircuitState, CompensationActionSpec, ContextMap,
        OperationStatus, RecoveryAction, RecoveryConfig, RecoveryError, RecoveryEvent,
        RecoveryOrchestrator, RecoveryRequest, RecoveryState, RecoveryStrategy,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
