//! OpenSASE Common - Shared primitives for the alerting pipeline
//!
//! This crate provides the small building blocks every alerting crate leans on:
//! - Injectable wall clock ([`Clock`], [`SystemClock`], [`ManualClock`])
//! - Lock-free counters for pipeline statistics
//! - Millisecond latency histograms for dispatch timing

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod metrics;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use metrics::{HistogramSnapshot, LatencyHistogram};

use std::sync::atomic::{AtomicU64, Ordering};

/// High-performance counter for lock-free metrics
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    /// Create new counter
    pub const fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    /// Increment and return previous value
    #[inline(always)]
    pub fn inc(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Add value and return previous
    #[inline(always)]
    pub fn add(&self, val: u64) -> u64 {
        self.0.fetch_add(val, Ordering::Relaxed)
    }

    /// Get current value
    #[inline(always)]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Reset to zero, returning the previous value
    pub fn reset(&self) -> u64 {
        self.0.swap(0, Ordering::Relaxed)
    }
}
