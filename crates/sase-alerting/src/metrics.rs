//! Alert pipeline metrics
//!
//! Lock-free counters updated on the hot path and plain serializable
//! snapshots for reporting.

use crate::correlation::CorrelationStats;
use crate::dedup::DedupStats;
use crate::dispatcher::DispatchStats;
use crate::queue::QueueStats;
use crate::repository::AlertCounts;
use chrono::{DateTime, Utc};
use sase_common::{AtomicCounter, HistogramSnapshot, LatencyHistogram};
use serde::Serialize;

/// Engine-side counters
#[derive(Default)]
pub struct PipelineCounters {
    pub events_received: AtomicCounter,
    pub events_processed: AtomicCounter,
    pub rule_matches: AtomicCounter,
    pub alerts_created: AtomicCounter,
    pub duplicates: AtomicCounter,
    pub escalations: AtomicCounter,
    pub queued: AtomicCounter,
    pub held_low_severity: AtomicCounter,
    pub held_suppressed: AtomicCounter,
    pub held_rate_limited: AtomicCounter,
    pub correlation_errors: AtomicCounter,
    pub processing_errors: AtomicCounter,
    pub processing_latency: LatencyHistogram,
}

impl PipelineCounters {
    pub fn snapshot(&self) -> PipelineMetrics {
        PipelineMetrics {
            events_received: self.events_received.get(),
            events_processed: self.events_processed.get(),
            rule_matches: self.rule_matches.get(),
            alerts_created: self.alerts_created.get(),
            duplicates: self.duplicates.get(),
            escalations: self.escalations.get(),
            queued: self.queued.get(),
            held_low_severity: self.held_low_severity.get(),
            held_suppressed: self.held_suppressed.get(),
            held_rate_limited: self.held_rate_limited.get(),
            correlation_errors: self.correlation_errors.get(),
            processing_errors: self.processing_errors.get(),
            processing_latency: self.processing_latency.snapshot(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineMetrics {
    pub events_received: u64,
    pub events_processed: u64,
    pub rule_matches: u64,
    pub alerts_created: u64,
    pub duplicates: u64,
    pub escalations: u64,
    pub queued: u64,
    pub held_low_severity: u64,
    pub held_suppressed: u64,
    pub held_rate_limited: u64,
    pub correlation_errors: u64,
    pub processing_errors: u64,
    pub processing_latency: HistogramSnapshot,
}

impl PipelineMetrics {
    /// Share of rule matches folded into an existing alert
    pub fn duplicate_rate(&self) -> f64 {
        if self.rule_matches == 0 {
            0.0
        } else {
            self.duplicates as f64 / self.rule_matches as f64
        }
    }
}

/// Point-in-time view across the whole pipeline
#[derive(Debug, Clone, Serialize)]
pub struct AlertStatistics {
    pub generated_at: DateTime<Utc>,
    pub since: Option<DateTime<Utc>>,
    pub alerts: AlertCounts,
    pub pipeline: PipelineMetrics,
    pub dedup: DedupStats,
    pub correlation: CorrelationStats,
    pub queue: QueueStats,
    /// Present when a dispatcher is attached
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch: Option<DispatchStats>,
}
