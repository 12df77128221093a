//! Atomic counter and flag
//!
//! Writes are linearizable read-modify-write operations; reads are plain
//! snapshot loads that never block.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Non-negative counter
#[derive(Debug, Default)]
pub struct AtomicCounter {
    value: AtomicU64,
}

impl AtomicCounter {
    /// Create a counter starting at zero
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one, returning the new value
    #[inline]
    pub fn increment(&self) -> u64 {
        self.value.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Subtract one, returning the new value
    ///
    /// Saturates at zero: decrementing an empty counter is a no-op.
    pub fn decrement(&self) -> u64 {
        let previous = self
            .value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(1)))
            .unwrap_or(0);
        if previous == 0 {
            tracing::warn!("decrement on zero counter ignored");
        }
        previous.saturating_sub(1)
    }

    /// Set back to zero, returning the value that was cleared
    #[inline]
    pub fn reset(&self) -> u64 {
        self.value.swap(0, Ordering::AcqRel)
    }

    /// Snapshot read
    #[inline]
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }
}

/// Boolean flag
#[derive(Debug, Default)]
pub struct AtomicBoolean {
    value: AtomicBool,
}

impl AtomicBoolean {
    /// Create a flag with an initial value
    #[inline]
    #[must_use]
    pub fn new(value: bool) -> Self {
        Self {
            value: AtomicBool::new(value),
        }
    }

    /// Store a value, returning the previous one
    #[inline]
    pub fn set(&self, value: bool) -> bool {
        self.value.swap(value, Ordering::AcqRel)
    }

    /// Flip `false -> true`; returns `true` only for the caller that flipped it
    #[inline]
    pub fn set_once(&self) -> bool {
        self.value
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Snapshot read
    #[inline]
    #[must_use]
    pub fn get(&self) -> bool {
        self.value.load(Ordering::Acquire)
    }
}
