//! Compensation registry
//!
//! Each component owns an ordered set of idempotent undo actions. Executing a
//! component's set runs every action once, sequentially, in dependency order:
//! - actions are pre-sorted by priority (higher first)
//! - a depth-first visit emits each action after its dependencies
//! - a dependency cycle aborts ordering before anything runs
//!
//! A failing action is recorded and the chain continues.

use crate::error::{ActionError, RecoveryError};
use crate::types::ContextMap;
use futures::future::BoxFuture;
use recovery_sync::ConcurrentMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use ulid::Ulid;

/// Priority assigned when none is given
pub const DEFAULT_PRIORITY: i32 = 5;

/// Boxed undo callback; receives the recovery operation's context
pub type UndoFn = Arc<dyn Fn(ContextMap) -> BoxFuture<'static, Result<(), ActionError>> + Send + Sync>;

/// Compensation action identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionId(pub String);

impl ActionId {
    /// Generate a fresh unique id
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("act_{}", Ulid::new()))
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ActionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Caller-side description of an undo action, prior to registration
#[derive(Clone)]
pub struct CompensationActionSpec {
    id: Option<ActionId>,
    operation: String,
    undo: UndoFn,
    dependencies: Vec<ActionId>,
    priority: Option<i32>,
}

impl CompensationActionSpec {
    /// Describe an undo action labelled `operation`
    pub fn new<F, Fut>(operation: impl Into<String>, undo: F) -> Self
    where
        F: Fn(ContextMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ActionError>> + Send + 'static,
    {
        Self {
            id: None,
            operation: operation.into(),
            undo: Arc::new(move |context| Box::pin(undo(context))),
            dependencies: Vec::new(),
            priority: None,
        }
    }

    /// Use a caller-chosen id, so other actions can depend on it
    #[inline]
    #[must_use]
    pub fn with_id(mut self, id: impl Into<ActionId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Require `id` to run first
    #[inline]
    #[must_use]
    pub fn depends_on(mut self, id: impl Into<ActionId>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    /// Set priority; higher runs earlier among independent actions
    #[inline]
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

impl fmt::Debug for CompensationActionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompensationActionSpec")
            .field("id", &self.id)
            .field("operation", &self.operation)
            .field("dependencies", &self.dependencies)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// A registered undo action
#[derive(Clone)]
pub struct CompensationAction {
    /// Action id
    pub id: ActionId,
    /// Owning component
    pub component: String,
    /// Label
    pub operation: String,
    /// Ids that must run first
    pub dependencies: Vec<ActionId>,
    /// Ordering priority among independent actions
    pub priority: i32,
    undo: UndoFn,
}

impl CompensationAction {
    /// Run the undo callback
    pub async fn run(&self, context: ContextMap) -> Result<(), ActionError> {
        (self.undo)(context).await
    }
}

impl fmt::Debug for CompensationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompensationAction")
            .field("id", &self.id)
            .field("component", &self.component)
            .field("operation", &self.operation)
            .field("dependencies", &self.dependencies)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Outcome of one undo action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationResult {
    /// Action that ran
    pub action_id: ActionId,
    /// Its label
    pub operation: String,
    /// Whether it succeeded
    pub success: bool,
    /// Failure message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Owner of every component's undo actions
#[derive(Debug, Default)]
pub struct CompensationRegistry {
    actions: ConcurrentMap<String, Arc<[CompensationAction]>>,
}

impl CompensationRegistry {
    /// Create an empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace `component`'s action list
    ///
    /// Unset ids are generated and unset priorities default to
    /// [`DEFAULT_PRIORITY`]. Returns the assigned ids in input order.
    pub fn register(&self, component: &str, specs: Vec<CompensationActionSpec>) -> Vec<ActionId> {
        let actions: Vec<CompensationAction> = specs
            .into_iter()
            .map(|spec| CompensationAction {
                id: spec.id.unwrap_or_else(ActionId::generate),
                component: component.to_string(),
                operation: spec.operation,
                dependencies: spec.dependencies,
                priority: spec.priority.unwrap_or(DEFAULT_PRIORITY),
                undo: spec.undo,
            })
            .collect();
        let ids = actions.iter().map(|a| a.id.clone()).collect();

        tracing::debug!(component, count = actions.len(), "compensation actions registered");
        if self
            .actions
            .set(component.to_string(), actions.into())
            .is_some()
        {
            tracing::debug!(component, "previous compensation actions replaced");
        }
        ids
    }

    /// Remove `component`'s actions
    pub fn unregister(&self, component: &str) -> bool {
        self.actions.delete(&component.to_string()).is_some()
    }

    /// Snapshot of `component`'s actions in registration order
    #[must_use]
    pub fn actions(&self, component: &str) -> Vec<CompensationAction> {
        self.actions
            .get(&component.to_string())
            .map(|actions| actions.to_vec())
            .unwrap_or_default()
    }

    /// Order `actions` so every action follows its dependencies
    ///
    /// Dependencies on ids outside `actions` are ignored.
    ///
    /// # Errors
    /// - `RecoveryError::CircularDependency` naming the action that closed a cycle
    pub fn resolve_order(
        actions: &[CompensationAction],
    ) -> Result<Vec<CompensationAction>, RecoveryError> {
        let mut sorted: Vec<&CompensationAction> = actions.iter().collect();
        sorted.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut visit = TopologicalVisit {
            by_id: actions.iter().map(|a| (&a.id, a)).collect(),
            visiting: HashSet::new(),
            visited: HashSet::new(),
            ordered: Vec::with_capacity(actions.len()),
        };
        for action in sorted {
            visit.visit(action)?;
        }
        Ok(visit.ordered)
    }

    /// Run `component`'s actions in resolved order
    ///
    /// # Errors
    /// - `RecoveryError::NoCompensationActions` if none are registered
    /// - `RecoveryError::CircularDependency` if the set cannot be ordered
    pub async fn execute(
        &self,
        component: &str,
        context: &ContextMap,
    ) -> Result<Vec<CompensationResult>, RecoveryError> {
        let actions = self
            .actions
            .get(&component.to_string())
            .filter(|actions| !actions.is_empty())
            .ok_or_else(|| RecoveryError::NoCompensationActions {
                component: component.to_string(),
            })?;
        let ordered = Self::resolve_order(&actions)?;

        let mut results = Vec::with_capacity(ordered.len());
        for action in ordered {
            let outcome = action.run(context.clone()).await;
            if let Err(e) = &outcome {
                tracing::warn!(component, action = %action.id, error = %e, "compensation action failed");
            }
            results.push(CompensationResult {
                action_id: action.id,
                operation: action.operation,
                success: outcome.is_ok(),
                error: outcome.err().map(|e| e.to_string()),
            });
        }
        Ok(results)
    }

    /// Components with registered actions
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.size()
    }

    /// Whether nothing is registered
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Remove everything
    #[inline]
    pub fn clear(&self) {
        self.actions.clear();
    }
}

struct TopologicalVisit<'a> {
    by_id: HashMap<&'a ActionId, &'a CompensationAction>,
    visiting: HashSet<&'a ActionId>,
    visited: HashSet<&'a ActionId>,
    ordered: Vec<CompensationAction>,
}

impl<'a> TopologicalVisit<'a> {
    fn visit(&mut self, action: &'a CompensationAction) -> Result<(), RecoveryError> {
        if self.visited.contains(&action.id) {
            return Ok(());
        }
        if !self.visiting.insert(&action.id) {
            return Err(RecoveryError::CircularDependency {
                action_id: action.id.to_string(),
            });
        }

        for dependency in &action.dependencies {
            match self.by_id.get(dependency).copied() {
                Some(dep) => self.visit(dep)?,
                None => {
                    tracing::warn!(action = %action.id, dependency = %dependency, "unknown compensation dependency ignored");
                }
            }
        }

        self.visiting.remove(&action.id);
        self.visited.insert(&action.id);
        self.ordered.push(action.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn noop(operation: &str) -> CompensationActionSpec {
        CompensationActionSpec::new(operation, |_| async { Ok(()) })
    }

    fn recording(log: &Arc<Mutex<Vec<String>>>, id: &str) -> CompensationActionSpec {
        let log = Arc::clone(log);
        let name = id.to_string();
        CompensationActionSpec::new(format!("undo-{id}"), move |_| {
            let log = Arc::clone(&log);
            let name = name.clone();
            async move {
                log.lock().push(name);
                Ok(())
            }
        })
        .with_id(id)
    }

    fn ids(actions: &[CompensationAction]) -> Vec<String> {
        actions.iter().map(|a| a.id.0.clone()).collect()
    }

    #[test]
    fn register_assigns_defaults() {
        let registry = CompensationRegistry::new();
        let ids = registry.register("db", vec![noop("undo-write"), noop("undo-index")]);
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);

        let actions = registry.actions("db");
        assert!(actions.iter().all(|a| a.priority == DEFAULT_PRIORITY));
        assert!(actions.iter().all(|a| a.dependencies.is_empty()));
    }

    #[test]
    fn register_replaces_wholesale() {
        let registry = CompensationRegistry::new();
        registry.register("db", vec![noop("a"), noop("b")]);
        registry.register("db", vec![noop("c")]);
        let actions = registry.actions("db");
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].operation, "c");
    }

    #[test]
    fn priority_orders_independent_actions() {
        let registry = CompensationRegistry::new();
        registry.register(
            "svc",
            vec![
                noop("low").with_id("low").with_priority(1),
                noop("high").with_id("high").with_priority(9),
                noop("mid").with_id("mid"),
            ],
        );
        let ordered = CompensationRegistry::resolve_order(&registry.actions("svc")).unwrap();
        assert_eq!(ids(&ordered), vec!["high", "mid", "low"]);
    }

    #[test]
    fn dependencies_run_first() {
        let registry = CompensationRegistry::new();
        registry.register(
            "svc",
            vec![
                noop("b").with_id("b").depends_on("a").with_priority(9),
                noop("a").with_id("a").with_priority(1),
            ],
        );
        let ordered = CompensationRegistry::resolve_order(&registry.actions("svc")).unwrap();
        assert_eq!(ids(&ordered), vec!["a", "b"]);
    }

    #[test]
    fn cycle_is_rejected() {
        let registry = CompensationRegistry::new();
        registry.register(
            "svc",
            vec![
                noop("a").with_id("a").depends_on("c"),
                noop("b").with_id("b").depends_on("a"),
                noop("c").with_id("c").depends_on("b"),
            ],
        );
        let err = CompensationRegistry::resolve_order(&registry.actions("svc")).unwrap_err();
        assert!(matches!(err, RecoveryError::CircularDependency { .. }));
    }

    #[test]
    fn unknown_dependency_ignored() {
        let registry = CompensationRegistry::new();
        registry.register("svc", vec![noop("a").with_id("a").depends_on("ghost")]);
        let ordered = CompensationRegistry::resolve_order(&registry.actions("svc")).unwrap();
        assert_eq!(ids(&ordered), vec!["a"]);
    }

    #[tokio::test]
    async fn execute_runs_sequentially_and_continues_past_failures() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = CompensationRegistry::new();
        let failing = CompensationActionSpec::new("explode", |_| async {
            Err(ActionError::new("boom"))
        })
        .with_id("explode")
        .with_priority(7);

        registry.register(
            "svc",
            vec![recording(&log, "first").with_priority(9), failing, recording(&log, "last").with_priority(1)],
        );

        let results = registry.execute("svc", &ContextMap::new()).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[0].success);
        assert!(!results[1].success);
        assert_eq!(results[1].error.as_deref(), Some("boom"));
        assert!(results[2].success);
        assert_eq!(*log.lock(), vec!["first".to_string(), "last".to_string()]);
    }

    #[tokio::test]
    async fn execute_passes_context() {
        let seen = Arc::new(Mutex::new(None));
        let captured = Arc::clone(&seen);
        let registry = CompensationRegistry::new();
        registry.register(
            "svc",
            vec![CompensationActionSpec::new("inspect", move |context: ContextMap| {
                let captured = Arc::clone(&captured);
                async move {
                    *captured.lock() = context.get("error").cloned();
                    Ok(())
                }
            })],
        );

        let mut context = ContextMap::new();
        context.insert("error".to_string(), serde_json::json!("disk full"));
        registry.execute("svc", &context).await.unwrap();
        assert_eq!(*seen.lock(), Some(serde_json::json!("disk full")));
    }

    #[tokio::test]
    async fn execute_without_actions_fails() {
        let registry = CompensationRegistry::new();
        let err = registry.execute("nobody", &ContextMap::new()).await.unwrap_err();
        assert!(matches!(err, RecoveryError::NoCompensationActions { .. }));

        registry.register("empty", Vec::new());
        let err = registry.execute("empty", &ContextMap::new()).await.unwrap_err();
        assert!(matches!(err, RecoveryError::NoCompensationActions { .. }));
    }
}
