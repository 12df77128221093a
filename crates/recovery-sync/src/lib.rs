//! Recovery Sync - concurrency toolkit for the recovery core
//!
//! Every piece of shared mutable state in the recovery layer goes through
//! one of these primitives:
//! - [`Mutex`]: FIFO-fair async mutex with an explicit release handle
//! - [`AtomicCounter`] / [`AtomicBoolean`]: lock-free counters and flags
//! - [`ConcurrentMap`]: sharded map with snapshot reads
//! - [`GuardedStateMachine`]: state machine validated against a fixed edge table
//!
//! # Example
//!
//! ```rust,ignore
//! use recovery_sync::{GuardedStateMachine, Mutex};
//!
//! # async fn example() -> Result<(), recovery_sync::SyncError> {
//! let mut machine = GuardedStateMachine::new("idle");
//! machine.add_transition("idle", "busy");
//!
//! let lock = Mutex::new();
//! let handle = lock.acquire().await;
//! machine.transition("busy")?;
//! handle.release();
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod atomic;
pub mod error;
pub mod map;
pub mod mutex;
pub mod state_machine;

pub use atomic::{AtomicBoolean, AtomicCounter};
pub use error::SyncError;
pub use map::ConcurrentMap;
pub use mutex::{Mutex, ReleaseHandle};
pub use state_machine::{GuardedStateMachine, StateChange};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
