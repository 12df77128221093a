//! Checkpoint store
//!
//! Append-only, per-context linked history of state snapshots. Every
//! mutation (create, prune) runs under the store's mutex, so the
//! `previous_checkpoint_id` chain can never be corrupted by concurrent writers.

use crate::error::RecoveryError;
use crate::events::{EventBus, RecoveryEvent};
use crate::types::{CheckpointId, ContextMap, RecoveryCheckpoint};
use chrono::Utc;
use recovery_sync::{AtomicBoolean, AtomicCounter, ConcurrentMap, Mutex};

/// Owner of all checkpoints
#[derive(Debug)]
pub struct CheckpointStore {
    checkpoints: ConcurrentMap<CheckpointId, RecoveryCheckpoint>,
    mutex: Mutex,
    sequence: AtomicCounter,
    draining: AtomicBoolean,
    max_checkpoints: usize,
    events: EventBus,
}

impl CheckpointStore {
    /// Create an empty store with a pruning ceiling
    #[must_use]
    pub fn new(max_checkpoints: usize, events: EventBus) -> Self {
        Self {
            checkpoints: ConcurrentMap::new(),
            mutex: Mutex::new(),
            sequence: AtomicCounter::new(),
            draining: AtomicBoolean::new(false),
            max_checkpoints,
            events,
        }
    }

    /// Store a snapshot of `state` for `context`
    ///
    /// `state` is copied; later changes to the caller's map do not reach the
    /// stored checkpoint. The new checkpoint links back to the most recent
    /// earlier checkpoint for the same context.
    ///
    /// # Errors
    /// - `RecoveryError::ShuttingDown` once the store has begun draining
    pub async fn create(
        &self,
        context: &str,
        state: &ContextMap,
        metadata: ContextMap,
    ) -> Result<CheckpointId, RecoveryError> {
        if self.is_draining() {
            return Err(RecoveryError::ShuttingDown);
        }
        let _lock = self.mutex.acquire().await;
        if self.is_draining() {
            return Err(RecoveryError::ShuttingDown);
        }

        let previous = self.latest_for(context).map(|cp| cp.id);
        let checkpoint = RecoveryCheckpoint {
            id: CheckpointId::new(),
            timestamp: Utc::now(),
            sequence: self.sequence.increment(),
            state: state.clone(),
            context: context.to_string(),
            previous_checkpoint_id: previous,
            metadata,
        };
        let id = checkpoint.id;
        let timestamp = checkpoint.timestamp;
        self.checkpoints.set(id, checkpoint);

        tracing::debug!(checkpoint = %id, context, "checkpoint created");
        self.events.publish(RecoveryEvent::CheckpointCreated {
            checkpoint_id: id,
            context: context.to_string(),
            previous_checkpoint_id: previous,
            timestamp,
        });
        Ok(id)
    }

    /// Most recent checkpoint whose context equals `context`
    ///
    /// Linear scan over the store, bounded by the pruning ceiling.
    #[must_use]
    pub fn latest_for(&self, context: &str) -> Option<RecoveryCheckpoint> {
        self.checkpoints
            .values()
            .into_iter()
            .filter(|cp| cp.context == context)
            .max_by_key(RecoveryCheckpoint::order_key)
    }

    /// History for `context`, newest first, following the back-links
    ///
    /// Stops early where pruning removed an older link.
    #[must_use]
    pub fn history(&self, context: &str) -> Vec<RecoveryCheckpoint> {
        let mut chain = Vec::new();
        let mut cursor = self.latest_for(context);
        while let Some(checkpoint) = cursor {
            cursor = checkpoint
                .previous_checkpoint_id
                .and_then(|id| self.checkpoints.get(&id));
            chain.push(checkpoint);
        }
        chain
    }

    /// Checkpoint by id
    #[inline]
    #[must_use]
    pub fn get(&self, id: &CheckpointId) -> Option<RecoveryCheckpoint> {
        self.checkpoints.get(id)
    }

    /// Drop the oldest checkpoints until the count is back at the ceiling
    ///
    /// Ordering is global by timestamp; a context with many checkpoints can
    /// lose a disproportionate share. Returns how many were removed.
    pub async fn prune_if_needed(&self) -> usize {
        if self.checkpoints.size() <= self.max_checkpoints {
            return 0;
        }
        let _lock = self.mutex.acquire().await;

        let mut all = self.checkpoints.values();
        let excess = all.len().saturating_sub(self.max_checkpoints);
        if excess == 0 {
            return 0;
        }
        all.sort_by_key(RecoveryCheckpoint::order_key);
        for checkpoint in all.iter().take(excess) {
            self.checkpoints.delete(&checkpoint.id);
        }
        tracing::debug!(removed = excess, remaining = self.checkpoints.size(), "pruned checkpoints");
        excess
    }

    /// Refuse further writes
    #[inline]
    pub fn begin_drain(&self) {
        self.draining.set(true);
    }

    /// Whether writes are refused
    #[inline]
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.get()
    }

    /// Number of stored checkpoints
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.checkpoints.size()
    }

    /// Whether the store is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    /// Remove every checkpoint
    pub async fn clear(&self) {
        let _lock = self.mutex.acquire().await;
        self.checkpoints.clear();
        self.sequence.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(v: i64) -> ContextMap {
        let mut map = ContextMap::new();
        map.insert("v".to_string(), json!(v));
        map
    }

    fn store(max: usize) -> CheckpointStore {
        CheckpointStore::new(max, EventBus::new(16))
    }

    #[tokio::test]
    async fn checkpoints_link_within_context() {
        let store = store(100);
        let a1 = store.create("a", &state(1), ContextMap::new()).await.unwrap();
        let b1 = store.create("b", &state(1), ContextMap::new()).await.unwrap();
        let a2 = store.create("a", &state(2), ContextMap::new()).await.unwrap();

        assert_eq!(store.get(&a1).unwrap().previous_checkpoint_id, None);
        assert_eq!(store.get(&b1).unwrap().previous_checkpoint_id, None);
        assert_eq!(store.get(&a2).unwrap().previous_checkpoint_id, Some(a1));
        assert_eq!(store.latest_for("a").unwrap().id, a2);
    }

    #[tokio::test]
    async fn state_is_copied() {
        let store = store(100);
        let mut caller_state = state(1);
        let id = store.create("a", &caller_state, ContextMap::new()).await.unwrap();

        caller_state.insert("v".to_string(), json!(99));
        assert_eq!(store.get(&id).unwrap().state["v"], json!(1));
    }

    #[tokio::test]
    async fn history_newest_first() {
        let store = store(100);
        let first = store.create("svc", &state(1), ContextMap::new()).await.unwrap();
        let second = store.create("svc", &state(2), ContextMap::new()).await.unwrap();
        let third = store.create("svc", &state(3), ContextMap::new()).await.unwrap();

        let history: Vec<_> = store.history("svc").into_iter().map(|cp| cp.id).collect();
        assert_eq!(history, vec![third, second, first]);
    }

    #[tokio::test]
    async fn prune_removes_oldest_globally() {
        let store = store(3);
        let mut ids = Vec::new();
        for i in 0..5 {
            let context = if i < 3 { "noisy" } else { "quiet" };
            ids.push(store.create(context, &state(i), ContextMap::new()).await.unwrap());
        }

        assert_eq!(store.prune_if_needed().await, 2);
        assert_eq!(store.len(), 3);
        assert!(store.get(&ids[0]).is_none());
        assert!(store.get(&ids[1]).is_none());
        assert!(store.get(&ids[2]).is_some());

        // Chain ends where the pruned link was
        assert_eq!(store.history("noisy").len(), 1);
        assert_eq!(store.prune_if_needed().await, 0);
    }

    #[tokio::test]
    async fn draining_store_rejects_writes() {
        let store = store(100);
        store.begin_drain();
        let err = store.create("a", &state(1), ContextMap::new()).await.unwrap_err();
        assert!(matches!(err, RecoveryError::ShuttingDown));
    }

    #[tokio::test]
    async fn create_emits_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let store = CheckpointStore::new(10, bus);

        let id = store.create("a", &state(1), ContextMap::new()).await.unwrap();
        match rx.recv().await.unwrap() {
            RecoveryEvent::CheckpointCreated { checkpoint_id, context, .. } => {
                assert_eq!(checkpoint_id, id);
                assert_eq!(context, "a");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
