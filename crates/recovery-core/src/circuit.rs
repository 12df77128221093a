//! Circuit breaker registry
//!
//! # States
//! - Closed: calls pass through
//! - Open: calls rejected until the reset timeout elapses
//! - Half-Open: a bounded number of trial calls admitted
//!
//! # Transitions
//! ```text
//! Closed    -> Open:      open() or failure_threshold reached in record_failure()
//! Open      -> Half-Open: sweep() once next_attempt_time has passed
//! Half-Open -> Open:      record_failure()
//! any       -> Closed:    close(), called by whoever observed a good trial call
//! ```
//!
//! There is no automatic Half-Open -> Closed edge.

use crate::config::CircuitBreakerConfig;
use crate::events::{EventBus, RecoveryEvent};
use chrono::{DateTime, Utc};
use recovery_sync::{ConcurrentMap, Mutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;

/// Breaker position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing fast
    Open,
    /// Probing
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        })
    }
}

/// Per-component breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerState {
    /// Component guarded by this breaker
    pub component: String,
    /// Current position
    pub state: CircuitState,
    /// Failures counted in the current monitoring window
    pub failure_count: u32,
    /// Wall-clock time of the last recorded failure
    pub last_failure_time: Option<DateTime<Utc>>,
    /// Monotonic time after which an open breaker may go half-open
    pub next_attempt_time: Option<Instant>,
    /// Wall-clock equivalent of `next_attempt_time`, for reporting
    pub reset_at: Option<DateTime<Utc>>,
    /// Trial calls admitted since going half-open
    pub half_open_calls: u32,
    /// Tuning for this breaker
    pub config: CircuitBreakerConfig,
    last_failure_instant: Option<Instant>,
}

impl CircuitBreakerState {
    fn closed(component: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            component: component.to_string(),
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            next_attempt_time: None,
            reset_at: None,
            half_open_calls: 0,
            config,
            last_failure_instant: None,
        }
    }

    fn note_failure(&mut self, now: Instant) {
        let window_expired = self
            .last_failure_instant
            .is_some_and(|last| now.duration_since(last) > self.config.monitoring_period());
        if window_expired {
            self.failure_count = 0;
        }
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_instant = Some(now);
        self.last_failure_time = Some(Utc::now());
    }

    fn open(&mut self, now: Instant) -> DateTime<Utc> {
        let timeout = self.config.reset_timeout();
        let reset_at = Utc::now()
            + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero());
        self.state = CircuitState::Open;
        self.next_attempt_time = Some(now + timeout);
        self.reset_at = Some(reset_at);
        self.half_open_calls = 0;
        reset_at
    }
}

/// Owner of all circuit breakers
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: ConcurrentMap<String, CircuitBreakerState>,
    mutex: Mutex,
    default_config: CircuitBreakerConfig,
    events: EventBus,
}

impl CircuitBreakerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(default_config: CircuitBreakerConfig, events: EventBus) -> Self {
        Self {
            breakers: ConcurrentMap::new(),
            mutex: Mutex::new(),
            default_config,
            events,
        }
    }

    /// Open the breaker for `component`, creating it if needed
    ///
    /// `failure_count` is left unchanged. A supplied `config` replaces the
    /// breaker's tuning.
    pub async fn open(
        &self,
        component: &str,
        config: Option<CircuitBreakerConfig>,
    ) -> CircuitBreakerState {
        let _lock = self.mutex.acquire().await;
        self.open_locked(component, config)
    }

    fn open_locked(
        &self,
        component: &str,
        config: Option<CircuitBreakerConfig>,
    ) -> CircuitBreakerState {
        let now = Instant::now();
        let mut breaker = self
            .breakers
            .get(&component.to_string())
            .unwrap_or_else(|| CircuitBreakerState::closed(component, self.default_config));
        if let Some(config) = config {
            breaker.config = config;
        }
        let reset_at = breaker.open(now);
        self.breakers.set(component.to_string(), breaker.clone());

        tracing::warn!(component, %reset_at, failures = breaker.failure_count, "circuit breaker opened");
        self.events.publish(RecoveryEvent::CircuitBreakerOpened {
            component: component.to_string(),
            reset_at,
        });
        breaker
    }

    /// Record a failed call against `component`
    ///
    /// Opens a closed breaker once `failure_threshold` failures land within
    /// the monitoring period; re-opens a half-open breaker immediately.
    pub async fn record_failure(&self, component: &str) -> CircuitState {
        let _lock = self.mutex.acquire().await;
        let now = Instant::now();
        let mut breaker = self
            .breakers
            .get(&component.to_string())
            .unwrap_or_else(|| CircuitBreakerState::closed(component, self.default_config));
        breaker.note_failure(now);

        let should_open = match breaker.state {
            CircuitState::Closed => breaker.failure_count >= breaker.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        self.breakers.set(component.to_string(), breaker);

        if should_open {
            self.open_locked(component, None).state
        } else {
            self.state_of(component).unwrap_or(CircuitState::Closed)
        }
    }

    /// Close the breaker after a successful trial call
    ///
    /// Returns false if no breaker exists for `component`.
    pub async fn close(&self, component: &str) -> bool {
        let _lock = self.mutex.acquire().await;
        let closed = self
            .breakers
            .update(&component.to_string(), |breaker| {
                breaker.state = CircuitState::Closed;
                breaker.failure_count = 0;
                breaker.next_attempt_time = None;
                breaker.reset_at = None;
                breaker.half_open_calls = 0;
            })
            .is_some();
        if closed {
            tracing::info!(component, "circuit breaker closed");
            self.events.publish(RecoveryEvent::CircuitBreakerClosed {
                component: component.to_string(),
            });
        }
        closed
    }

    /// Whether a call to `component` may proceed right now
    ///
    /// Components without a breaker are treated as closed.
    pub fn try_acquire_call(&self, component: &str) -> bool {
        self.breakers
            .update(&component.to_string(), |breaker| match breaker.state {
                CircuitState::Closed => true,
                CircuitState::Open => false,
                CircuitState::HalfOpen => {
                    if breaker.half_open_calls < breaker.config.half_open_max_calls {
                        breaker.half_open_calls += 1;
                        true
                    } else {
                        false
                    }
                }
            })
            .unwrap_or(true)
    }

    /// Move every open breaker whose reset time has passed to half-open
    ///
    /// Returns the components that moved.
    pub async fn sweep(&self) -> Vec<String> {
        let _lock = self.mutex.acquire().await;
        let now = Instant::now();
        let mut moved = Vec::new();

        for (component, _) in self.breakers.entries() {
            let became_half_open = self
                .breakers
                .update(&component, |breaker| {
                    let due = breaker.state == CircuitState::Open
                        && breaker.next_attempt_time.is_some_and(|at| now >= at);
                    if due {
                        breaker.state = CircuitState::HalfOpen;
                        breaker.half_open_calls = 0;
                    }
                    due
                })
                .unwrap_or(false);

            if became_half_open {
                tracing::info!(component = %component, "circuit breaker half-open");
                self.events.publish(RecoveryEvent::CircuitBreakerHalfOpen {
                    component: component.clone(),
                });
                moved.push(component);
            }
        }
        moved
    }

    /// Snapshot of the breaker for `component`
    #[inline]
    #[must_use]
    pub fn get(&self, component: &str) -> Option<CircuitBreakerState> {
        self.breakers.get(&component.to_string())
    }

    /// Position of the breaker for `component`
    #[inline]
    #[must_use]
    pub fn state_of(&self, component: &str) -> Option<CircuitState> {
        self.get(component).map(|breaker| breaker.state)
    }

    /// Number of breakers
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.size()
    }

    /// Whether no breaker exists
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Remove every breaker
    pub async fn clear(&self) {
        let _lock = self.mutex.acquire().await;
        self.breakers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry() -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitBreakerConfig::default(), EventBus::new(16))
    }

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig::default()
            .with_reset_timeout(Duration::from_millis(1_000))
            .with_failure_threshold(3)
    }

    #[tokio::test(start_paused = true)]
    async fn open_then_sweep_to_half_open() {
        let registry = registry();
        let breaker = registry.open("payments", Some(fast_config())).await;
        assert_eq!(breaker.state, CircuitState::Open);
        assert_eq!(breaker.failure_count, 0);

        assert!(registry.sweep().await.is_empty());

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert_eq!(registry.sweep().await, vec!["payments".to_string()]);
        assert_eq!(registry.state_of("payments"), Some(CircuitState::HalfOpen));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_never_closes_on_its_own() {
        let registry = registry();
        registry.open("payments", Some(fast_config())).await;
        tokio::time::advance(Duration::from_secs(2)).await;
        registry.sweep().await;
        tokio::time::advance(Duration::from_secs(600)).await;
        registry.sweep().await;
        assert_eq!(registry.state_of("payments"), Some(CircuitState::HalfOpen));

        assert!(registry.close("payments").await);
        assert_eq!(registry.state_of("payments"), Some(CircuitState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn reopening_keeps_failure_count() {
        let registry = CircuitBreakerRegistry::new(fast_config(), EventBus::new(16));
        registry.record_failure("db").await;
        registry.record_failure("db").await;
        let breaker = registry.open("db", None).await;
        assert_eq!(breaker.state, CircuitState::Open);
        assert_eq!(breaker.failure_count, 2);
        let breaker = registry.open("db", None).await;
        assert_eq!(breaker.failure_count, 2);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn record_failure_opens_at_threshold() {
        let registry = CircuitBreakerRegistry::new(fast_config(), EventBus::new(16));
        assert_eq!(registry.record_failure("api").await, CircuitState::Closed);
        assert_eq!(registry.record_failure("api").await, CircuitState::Closed);
        assert_eq!(registry.record_failure("api").await, CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn old_failures_fall_out_of_window() {
        let registry = CircuitBreakerRegistry::new(fast_config(), EventBus::new(16));
        registry.record_failure("api").await;
        registry.record_failure("api").await;
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(registry.record_failure("api").await, CircuitState::Closed);
        assert_eq!(registry.get("api").unwrap().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_bounded_trial_calls() {
        let registry = registry();
        let config = fast_config().with_half_open_max_calls(2);
        registry.open("svc", Some(config)).await;
        assert!(!registry.try_acquire_call("svc"));

        tokio::time::advance(Duration::from_millis(1_500)).await;
        registry.sweep().await;
        assert!(registry.try_acquire_call("svc"));
        assert!(registry.try_acquire_call("svc"));
        assert!(!registry.try_acquire_call("svc"));

        // Trial call failed
        assert_eq!(registry.record_failure("svc").await, CircuitState::Open);
    }

    #[tokio::test]
    async fn unknown_component_is_closed() {
        let registry = registry();
        assert!(registry.try_acquire_call("nobody"));
        assert!(!registry.close("nobody").await);
    }
}
