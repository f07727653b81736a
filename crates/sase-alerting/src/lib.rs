//! OpenSASE Alert Pipeline (OSAP)
//!
//! Turns security events into deduplicated, correlated alerts and delivers
//! them over notification channels:
//! - Rule evaluation through a pluggable rule engine
//! - Fingerprint deduplication with sliding TTL
//! - Correlation and one-step severity escalation
//! - Dispatch gating (severity, suppression, per-user and global rate limits)
//! - Priority dispatch queue with bounded workers and job-level retry
//! - Per-channel circuit breakers around retried sends
//!
//! # Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         ALERT PIPELINE (OSAP)                           │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  SecurityEvent ──▶ ┌──────────────┐   ┌──────────────┐  ┌────────────┐  │
//! │                    │ Rule Engine  │──▶│ Dedup Store  │─▶│ Correlation│  │
//! │                    └──────────────┘   └──────────────┘  └─────┬──────┘  │
//! │                                                               │         │
//! │                    ┌──────────────┐   ┌──────────────┐        ▼         │
//! │                    │  Dispatch    │◀──│ Eligibility  │◀── Alert Engine  │
//! │                    │  Queue       │   │ Gate         │                  │
//! │                    └──────┬───────┘   └──────────────┘                  │
//! │                           ▼                                             │
//! │                    ┌──────────────┐   ┌──────────────┐  ┌────────────┐  │
//! │                    │  Channel     │──▶│ Breaker +    │─▶│ email /    │  │
//! │                    │  Dispatcher  │   │ Retry        │  │ webhook    │  │
//! │                    └──────────────┘   └──────────────┘  └────────────┘  │
//! │                                                                         │
//! │              ┌──────────────────────────────────────┐                   │
//! │              │   Event Bus (alert.* notifications)  │                   │
//! │              └──────────────────────────────────────┘                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

// Module declarations
pub mod channels;
pub mod config;
pub mod correlation;
pub mod dedup;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod queue;
pub mod ratelimit;
pub mod repository;
pub mod rules;
pub mod task;
pub mod worker;

pub use channels::{ChannelError, ChannelHealth, ChannelPayload, ChannelRegistry, ChannelSender, MailTransport};
pub use config::{AlertingConfig, ConfigError, RoutingConfig};
pub use correlation::{CorrelationConfig, CorrelationEngine, CorrelationKey};
pub use dedup::{DedupConfig, DedupOutcome, DedupRecord, DeduplicationStore};
pub use dispatcher::{ChannelDispatcher, DispatchError, DispatchOutcome};
pub use engine::{AlertEngine, EngineComponents, ProcessOutcome, RecoveryReport, SkipReason};
pub use error::{AlertingError, AlertingResult};
pub use events::{AlertEvent, EventBus};
pub use fingerprint::Fingerprint;
pub use metrics::{AlertStatistics, PipelineMetrics};
pub use model::{
    Alert, AlertStatus, CorrelationResult, MetaValue, Metadata, RuleEvaluationResult, SecurityEvent, Severity,
};
pub use pipeline::{AlertPipeline, IngestSummary, PipelineHandles, PipelineHealth};
pub use queue::{DispatchJob, DispatchQueue, JobState, QueueConfig};
pub use ratelimit::{DispatchRateLimiter, RateLimitConfig, RateLimitDecision};
pub use repository::{AlertRepository, InMemoryAlertRepository, RepositoryError};
pub use rules::{RuleEngine, RuleError, StaticRuleEngine};
pub use task::BackgroundTask;
