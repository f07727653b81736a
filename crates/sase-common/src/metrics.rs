//! Latency tracking for outbound calls

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Upper bound (inclusive, milliseconds) of each histogram bucket
const BUCKET_LIMITS_MS: [u64; 8] = [10, 50, 100, 250, 500, 1_000, 5_000, u64::MAX];

/// Lock-free histogram for dispatch latency
#[derive(Debug)]
pub struct LatencyHistogram {
    /// Buckets: <=10ms, <=50ms, <=100ms, <=250ms, <=500ms, <=1s, <=5s, >5s
    buckets: [AtomicU64; 8],
    count: AtomicU64,
    sum_ms: AtomicU64,
    min_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl LatencyHistogram {
    /// Create new histogram
    pub const fn new() -> Self {
        Self {
            buckets: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
            count: AtomicU64::new(0),
            sum_ms: AtomicU64::new(0),
            min_ms: AtomicU64::new(u64::MAX),
            max_ms: AtomicU64::new(0),
        }
    }

    /// Record a latency value in milliseconds
    pub fn record(&self, latency_ms: u64) {
        let bucket = BUCKET_LIMITS_MS
            .iter()
            .position(|limit| latency_ms <= *limit)
            .unwrap_or(BUCKET_LIMITS_MS.len() - 1);

        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.min_ms.fetch_min(latency_ms, Ordering::Relaxed);
        self.max_ms.fetch_max(latency_ms, Ordering::Relaxed);
    }

    /// Number of recorded samples
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Average latency in milliseconds
    pub fn average(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            return 0.0;
        }
        self.sum_ms.load(Ordering::Relaxed) as f64 / count as f64
    }

    /// Approximate percentile, reported as the upper bound of the bucket it falls in
    pub fn percentile(&self, p: f64) -> u64 {
        let count = self.count();
        if count == 0 {
            return 0;
        }
        let target = ((count as f64) * p).ceil().max(1.0) as u64;
        let mut cumulative = 0u64;

        for (i, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            if cumulative >= target {
                return BUCKET_LIMITS_MS[i].min(self.max_ms.load(Ordering::Relaxed));
            }
        }

        self.max_ms.load(Ordering::Relaxed)
    }

    /// Get snapshot
    pub fn snapshot(&self) -> HistogramSnapshot {
        let count = self.count();
        HistogramSnapshot {
            count,
            sum_ms: self.sum_ms.load(Ordering::Relaxed),
            min_ms: if count == 0 { 0 } else { self.min_ms.load(Ordering::Relaxed) },
            max_ms: self.max_ms.load(Ordering::Relaxed),
            p50: self.percentile(0.50),
            p90: self.percentile(0.90),
            p99: self.percentile(0.99),
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Histogram snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct HistogramSnapshot {
    /// Samples recorded
    pub count: u64,
    /// Sum of all samples
    pub sum_ms: u64,
    /// Smallest sample
    pub min_ms: u64,
    /// Largest sample
    pub max_ms: u64,
    /// Median bucket bound
    pub p50: u64,
    /// 90th percentile bucket bound
    pub p90: u64,
    /// 99th percentile bucket bound
    pub p99: u64,
}
