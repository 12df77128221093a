//! Guarded state machine
//!
//! Edges are registered up front with [`GuardedStateMachine::add_transition`];
//! after that the machine is shared and every [`transition`] is checked
//! against the edge table under an internal lock, so two callers can never
//! interleave mid-transition.
//!
//! [`transition`]: GuardedStateMachine::transition

use crate::error::SyncError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt::{Debug, Display};
use std::hash::Hash;
use tokio::sync::broadcast;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Emitted after every successful transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange<S> {
    /// State before the transition
    pub from: S,
    /// State after the transition
    pub to: S,
    /// When the transition was applied
    pub timestamp: DateTime<Utc>,
}

/// State machine whose transitions are validated against a fixed edge table
#[derive(Debug)]
pub struct GuardedStateMachine<S> {
    initial: S,
    current: Mutex<S>,
    edges: HashMap<S, HashSet<S>>,
    changes: broadcast::Sender<StateChange<S>>,
}

impl<S> GuardedStateMachine<S>
where
    S: Copy + Eq + Hash + Debug + Display + Send + Sync + 'static,
{
    /// Create a machine sitting in `initial` with no edges
    #[must_use]
    pub fn new(initial: S) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            initial,
            current: Mutex::new(initial),
            edges: HashMap::new(),
            changes,
        }
    }

    /// Register a directed edge
    ///
    /// Build-time only: takes `&mut self`, so it cannot race with transitions.
    pub fn add_transition(&mut self, from: S, to: S) -> &mut Self {
        self.edges.entry(from).or_default().insert(to);
        self
    }

    /// Builder form of [`add_transition`](Self::add_transition)
    #[must_use]
    pub fn with_transition(mut self, from: S, to: S) -> Self {
        self.add_transition(from, to);
        self
    }

    /// Whether an edge `from -> to` exists
    #[inline]
    #[must_use]
    pub fn is_allowed(&self, from: S, to: S) -> bool {
        self.edges.get(&from).is_some_and(|targets| targets.contains(&to))
    }

    /// All states reachable in one step from `from`
    #[must_use]
    pub fn allowed_transitions(&self, from: S) -> Vec<S> {
        self.edges
            .get(&from)
            .map(|targets| targets.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Move to `to`
    ///
    /// # Errors
    /// - `SyncError::InvalidTransition` if there is no edge from the current
    ///   state to `to`; the state is left unchanged
    pub fn transition(&self, to: S) -> Result<StateChange<S>, SyncError> {
        let mut current = self.current.lock();
        let from = *current;

        if !self.is_allowed(from, to) {
            #[cfg(feature = "strict-debug")]
            panic!("Illegal state transition attempted: {from:?} -> {to:?}");

            #[cfg(not(feature = "strict-debug"))]
            return Err(SyncError::invalid_transition(from, to));
        }

        *current = to;
        let change = StateChange {
            from,
            to,
            timestamp: Utc::now(),
        };
        tracing::debug!(%from, %to, "state transition");
        // No receivers is fine
        let _ = self.changes.send(change.clone());
        Ok(change)
    }

    /// Current state
    #[inline]
    #[must_use]
    pub fn state(&self) -> S {
        *self.current.lock()
    }

    /// Force the machine back to its initial state, bypassing the edge table
    ///
    /// Only for teardown paths that discard all in-flight work.
    pub fn reset(&self) -> S {
        let mut current = self.current.lock();
        std::mem::replace(&mut *current, self.initial)
    }

    /// Subscribe to state changes
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange<S>> {
        self.changes.subscribe()
    }
}
