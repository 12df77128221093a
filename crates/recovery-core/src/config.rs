//! Recovery configuration
//!
//! All durations are stored as milliseconds so the config round-trips through
//! TOML unchanged; use the `Duration` accessors in code.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Per-breaker tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures within the monitoring period that open a closed breaker
    pub failure_threshold: u32,
    /// How long a breaker stays open before the sweep moves it to half-open
    pub reset_timeout_ms: u64,
    /// Trial calls admitted while half-open
    pub half_open_max_calls: u32,
    /// Window after which old failures stop counting
    pub monitoring_period_ms: u64,
}

impl CircuitBreakerConfig {
    /// With reset timeout
    #[inline]
    #[must_use]
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout_ms = duration_ms(timeout);
        self
    }

    /// With failure threshold
    #[inline]
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// With half-open trial call budget
    #[inline]
    #[must_use]
    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls;
        self
    }

    /// Reset timeout as a duration
    #[inline]
    #[must_use]
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    /// Monitoring period as a duration
    #[inline]
    #[must_use]
    pub fn monitoring_period(&self) -> Duration {
        Duration::from_millis(self.monitoring_period_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            half_open_max_calls: 1,
            monitoring_period_ms: 10_000,
        }
    }
}

/// Recovery orchestrator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Checkpoint ceiling enforced by pruning
    pub max_checkpoints: usize,
    /// Cadence of the breaker sweep and pruning task
    pub maintenance_interval_ms: u64,
    /// Delay after retry and compensation before returning to monitoring
    pub stabilization_ms: u64,
    /// Delay after rollback before returning to monitoring
    pub rollback_stabilization_ms: u64,
    /// First retry backoff
    pub backoff_base_ms: u64,
    /// Backoff ceiling
    pub backoff_cap_ms: u64,
    /// Default attempt budget for the retry strategy
    pub retry_max_attempts: u32,
    /// Default drain timeout for shutdown
    pub shutdown_timeout_ms: u64,
    /// Drain poll interval
    pub shutdown_poll_ms: u64,
    /// Terminal operations kept for inspection
    pub max_retained_operations: usize,
    /// Event channel depth
    pub event_capacity: usize,
    /// Defaults for newly created breakers
    pub circuit_breaker: CircuitBreakerConfig,
}

impl RecoveryConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from TOML text and validate
    ///
    /// # Errors
    /// - `ConfigError::Parse` on malformed TOML
    /// - `ConfigError::Invalid` if a value is out of range
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    ///
    /// # Errors
    /// - `ConfigError::Io` if the file cannot be read
    /// - anything [`from_toml_str`](Self::from_toml_str) returns
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Render as TOML
    ///
    /// # Errors
    /// - `ConfigError::Render` if serialization fails
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check value ranges
    ///
    /// # Errors
    /// - `ConfigError::Invalid` naming the first offending field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_checkpoints == 0 {
            return Err(invalid("max_checkpoints", "must be at least 1"));
        }
        if self.retry_max_attempts == 0 {
            return Err(invalid("retry_max_attempts", "must be at least 1"));
        }
        if self.maintenance_interval_ms == 0 {
            return Err(invalid("maintenance_interval_ms", "must be non-zero"));
        }
        if self.shutdown_poll_ms == 0 {
            return Err(invalid("shutdown_poll_ms", "must be non-zero"));
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(invalid(
                "backoff_cap_ms",
                format!(
                    "{} is below backoff_base_ms {}",
                    self.backoff_cap_ms, self.backoff_base_ms
                ),
            ));
        }
        if self.event_capacity == 0 {
            return Err(invalid("event_capacity", "must be at least 1"));
        }
        Ok(())
    }

    /// With checkpoint ceiling
    #[inline]
    #[must_use]
    pub fn with_max_checkpoints(mut self, max: usize) -> Self {
        self.max_checkpoints = max;
        self
    }

    /// With maintenance cadence
    #[inline]
    #[must_use]
    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval_ms = duration_ms(interval);
        self
    }

    /// With both stabilization delays
    #[inline]
    #[must_use]
    pub fn with_stabilization(mut self, delay: Duration, rollback_delay: Duration) -> Self {
        self.stabilization_ms = duration_ms(delay);
        self.rollback_stabilization_ms = duration_ms(rollback_delay);
        self
    }

    /// With backoff base and cap
    #[inline]
    #[must_use]
    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base_ms = duration_ms(base);
        self.backoff_cap_ms = duration_ms(cap);
        self
    }

    /// With default retry attempts
    #[inline]
    #[must_use]
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_max_attempts = attempts;
        self
    }

    /// With breaker defaults
    #[inline]
    #[must_use]
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    /// Maintenance cadence
    #[inline]
    #[must_use]
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    /// Post-recovery stabilization delay
    #[inline]
    #[must_use]
    pub fn stabilization(&self) -> Duration {
        Duration::from_millis(self.stabilization_ms)
    }

    /// Post-rollback stabilization delay
    #[inline]
    #[must_use]
    pub fn rollback_stabilization(&self) -> Duration {
        Duration::from_millis(self.rollback_stabilization_ms)
    }

    /// Default shutdown drain timeout
    #[inline]
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Shutdown drain poll interval
    #[inline]
    #[must_use]
    pub fn shutdown_poll(&self) -> Duration {
        Duration::from_millis(self.shutdown_poll_ms)
    }

    /// Backoff before the attempt following `attempt` (1-based)
    ///
    /// `min(base * 2^(attempt-1), cap)`
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let delay = self
            .backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_cap_ms);
        Duration::from_millis(delay)
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_checkpoints: 100,
            maintenance_interval_ms: 5_000,
            stabilization_ms: 2_000,
            rollback_stabilization_ms: 3_000,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 30_000,
            retry_max_attempts: 3,
            shutdown_timeout_ms: 30_000,
            shutdown_poll_ms: 100,
            max_retained_operations: 1_000,
            event_capacity: 256,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
