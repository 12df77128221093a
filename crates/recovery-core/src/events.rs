//! Lifecycle events
//!
//! The core publishes [`RecoveryEvent`]s on an [`EventBus`]; dashboards and
//! loggers subscribe. Nothing in the core waits on a subscriber, and
//! publishing with nobody listening is not an error.

use crate::compensation::CompensationResult;
use crate::types::{CheckpointId, OperationId, RecoveryState, RecoveryStrategy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Events emitted by the recovery core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RecoveryEvent {
    /// Global state machine moved
    #[serde(rename = "recovery-state-changed")]
    StateChanged {
        from: RecoveryState,
        to: RecoveryState,
        timestamp: DateTime<Utc>,
    },
    /// A checkpoint was stored
    CheckpointCreated {
        checkpoint_id: CheckpointId,
        context: String,
        previous_checkpoint_id: Option<CheckpointId>,
        timestamp: DateTime<Utc>,
    },
    /// An operation completed
    RecoveryCompleted {
        operation_id: OperationId,
        component: String,
        strategy: RecoveryStrategy,
    },
    /// An operation failed
    RecoveryFailed {
        operation_id: OperationId,
        component: String,
        strategy: RecoveryStrategy,
        error: String,
    },
    /// A checkpoint was restored
    RollbackCompleted {
        operation_id: OperationId,
        component: String,
        checkpoint_id: CheckpointId,
    },
    /// A component's undo chain ran
    CompensationCompleted {
        operation_id: OperationId,
        component: String,
        results: Vec<CompensationResult>,
    },
    /// A breaker opened
    CircuitBreakerOpened {
        component: String,
        reset_at: DateTime<Utc>,
    },
    /// The sweep moved a breaker to half-open
    CircuitBreakerHalfOpen { component: String },
    /// A breaker was closed explicitly
    CircuitBreakerClosed { component: String },
}

impl RecoveryEvent {
    /// Wire name of the event
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "recovery-state-changed",
            Self::CheckpointCreated { .. } => "checkpoint-created",
            Self::RecoveryCompleted { .. } => "recovery-completed",
            Self::RecoveryFailed { .. } => "recovery-failed",
            Self::RollbackCompleted { .. } => "rollback-completed",
            Self::CompensationCompleted { .. } => "compensation-completed",
            Self::CircuitBreakerOpened { .. } => "circuit-breaker-opened",
            Self::CircuitBreakerHalfOpen { .. } => "circuit-breaker-half-open",
            Self::CircuitBreakerClosed { .. } => "circuit-breaker-closed",
        }
    }
}

/// Broadcast channel shared by every store of one orchestrator
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RecoveryEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per lagging subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event
    pub fn publish(&self, event: RecoveryEvent) {
        tracing::trace!(event = event.name(), "publish");
        let _ = self.sender.send(event);
    }

    /// Subscribe to future events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RecoveryEvent> {
        self.sender.subscribe()
    }

    /// Current subscriber count
    #[inline]
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Log every event through `tracing` until the bus closes
pub fn spawn_event_logger(mut receiver: broadcast::Receiver<RecoveryEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &RecoveryEvent) {
    match event {
        RecoveryEvent::StateChanged { from, to, .. } => {
            tracing::debug!(%from, %to, "recovery state changed");
        }
        RecoveryEvent::RecoveryFailed {
            operation_id,
            component,
            strategy,
            error,
        } => {
            tracing::warn!(%operation_id, %component, %strategy, %error, "recovery failed");
        }
        RecoveryEvent::CircuitBreakerOpened { component, reset_at } => {
            tracing::warn!(%component, %reset_at, "circuit breaker opened");
        }
        other => match serde_json::to_string(other) {
            Ok(json) => tracing::info!(event = other.name(), %json),
            Err(_) => tracing::info!(event = other.name()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_match_serde_tags() {
        let events = vec![
            RecoveryEvent::StateChanged {
                from: RecoveryState::Monitoring,
                to: RecoveryState::Detecting,
                timestamp: Utc::now(),
            },
            RecoveryEvent::CircuitBreakerHalfOpen {
                component: "payments".to_string(),
            },
            RecoveryEvent::RecoveryCompleted {
                operation_id: OperationId::new(),
                component: "svc".to_string(),
                strategy: RecoveryStrategy::Retry,
            },
        ];

        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["event"], event.name());
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish(RecoveryEvent::CircuitBreakerClosed {
            component: "x".to_string(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        bus.publish(RecoveryEvent::CircuitBreakerHalfOpen {
            component: "payments".to_string(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "circuit-breaker-half-open");
    }

    #[tokio::test]
    async fn event_logger_stops_when_bus_dropped() {
        let bus = EventBus::new(4);
        let logger = spawn_event_logger(bus.subscribe());
        bus.publish(RecoveryEvent::CircuitBreakerClosed {
            component: "x".to_string(),
        });
        drop(bus);
        logger.await.unwrap();
    }
}
