//! Alert Engine
//!
//! Per event: evaluate rules, then for each match build a candidate alert,
//! deduplicate it, correlate and escalate it, persist it, and gate it before
//! it is queued for dispatch.
//!
//! ```text
//! event ─► rules ─► match ─► fingerprint ─► dedup ─┬─► duplicate: merge occurrence
//!                                                  └─► new: correlate ─► escalate ─► insert
//!                                                                                      │
//!                                                   eligibility ◄──────────────────────┘
//!                                                       ├─► held (low / suppressed / rate limited)
//!                                                       └─► DispatchQueue
//! ```

use crate::config::AlertingConfig;
use crate::correlation::CorrelationEngine;
use crate::dedup::{DedupOutcome, DedupRecord, DedupRegistration, DeduplicationStore};
use crate::error::{AlertingError, AlertingResult};
use crate::events::{AlertEvent, EventBus};
use crate::fingerprint::Fingerprint;
use crate::metrics::{AlertStatistics, PipelineCounters, PipelineMetrics};
use crate::model::{Alert, AlertStatus, MetaValue, Metadata, RuleEvaluationResult, SecurityEvent, Severity};
use crate::queue::{DispatchJob, DispatchQueue};
use crate::ratelimit::{DispatchRateLimiter, RateLimitDecision};
use crate::repository::{AlertRepository, RepositoryError};
use crate::rules::RuleEngine;
use crate::task::BackgroundTask;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use sase_common::SharedClock;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Backoff for lookups of a duplicate's alert that race the first insert
const DUPLICATE_LOOKUP_DELAY_MS: u64 = 10;
const DUPLICATE_LOOKUP_MAX_DELAY_MS: u64 = 200;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// PROCESSING alerts returned to PENDING
    pub reset_alerts: usize,
    /// PENDING alerts put back on the queue
    pub requeued_alerts: usize,
}

/// Collaborators the engine drives
pub struct EngineComponents {
    pub rules: Arc<dyn RuleEngine>,
    pub repository: Arc<dyn AlertRepository>,
    pub dedup: Arc<DeduplicationStore>,
    pub correlation: Arc<CorrelationEngine>,
    pub rate_limiter: Arc<DispatchRateLimiter>,
    pub queue: Arc<DispatchQueue>,
    pub events: Arc<EventBus>,
    pub clock: SharedClock,
}

/// Why a new alert was stored but not queued
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    LowSeverity,
    Suppressed { until: DateTime<Utc> },
    RateLimited(RateLimitDecision),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::LowSeverity => f.write_str("LOW severity alerts are not dispatched"),
            SkipReason::Suppressed { until } => write!(f, "suppressed until {}", until.to_rfc3339()),
            SkipReason::RateLimited(decision) => write!(f, "rate limited: {decision}"),
        }
    }
}

/// Result of handling one rule match
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcessOutcome {
    /// Folded into an alert already live for this fingerprint
    Duplicate {
        alert_id: String,
        fingerprint: String,
        occurrence_count: u32,
    },
    Queued {
        alert_id: String,
        job_id: String,
        priority: u8,
        severity: Severity,
        escalated: bool,
    },
    Held { alert_id: String, reason: SkipReason },
}

impl ProcessOutcome {
    pub fn alert_id(&self) -> &str {
        match self {
            ProcessOutcome::Duplicate { alert_id, .. }
            | ProcessOutcome::Queued { alert_id, .. }
            | ProcessOutcome::Held { alert_id, .. } => alert_id,
        }
    }
}

pub struct AlertEngine {
    rules: Arc<dyn RuleEngine>,
    repository: Arc<dyn AlertRepository>,
    dedup: Arc<DeduplicationStore>,
    correlation: Arc<CorrelationEngine>,
    rate_limiter: Arc<DispatchRateLimiter>,
    queue: Arc<DispatchQueue>,
    events: Arc<EventBus>,
    clock: SharedClock,
    dispatch_low_severity: bool,
    counters: PipelineCounters,
}

impl AlertEngine {
    pub fn new(config: &AlertingConfig, components: EngineComponents) -> Self {
        Self {
            rules: components.rules,
            repository: components.repository,
            dedup: components.dedup,
            correlation: components.correlation,
            rate_limiter: components.rate_limiter,
            queue: components.queue,
            events: components.events,
            clock: components.clock,
            dispatch_low_severity: config.dispatch_low_severity,
            counters: PipelineCounters::default(),
        }
    }

    /// Run one event through the pipeline.
    ///
    /// Never fails: rule errors and per-match errors are counted, logged and
    /// published as `alert.processing.failed`; remaining matches still run.
    pub async fn process_event(&self, event: &SecurityEvent) -> Vec<ProcessOutcome> {
        let started = Instant::now();
        self.counters.events_received.inc();

        let matches = match self.evaluate(event).await {
            Ok(matches) => matches,
            Err(e) => {
                self.report_failure(event, None, &e);
                return Vec::new();
            }
        };

        let mut outcomes = Vec::with_capacity(matches.len());
        for result in matches {
            self.counters.rule_matches.inc();
            match self.process_match(event, &result).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => self.report_failure(event, None, &e),
            }
        }

        self.counters.events_processed.inc();
        self.counters
            .processing_latency
            .record(started.elapsed().as_millis() as u64);
        outcomes
    }

    /// Process events concurrently; outcomes keep input order
    pub async fn process_batch(&self, events: &[SecurityEvent]) -> Vec<Vec<ProcessOutcome>> {
        join_all(events.iter().map(|event| self.process_event(event))).await
    }

    async fn evaluate(&self, event: &SecurityEvent) -> AlertingResult<Vec<RuleEvaluationResult>> {
        if event.event_type.trim().is_empty() {
            return Err(AlertingError::InvalidEvent(format!("event {} has no event_type", event.id)));
        }
        let results = self.rules.evaluate(event).await?;
        Ok(results.into_iter().filter(|r| r.matched).collect())
    }

    /// Handle a single matched rule for `event`
    pub async fn process_match(
        &self,
        event: &SecurityEvent,
        result: &RuleEvaluationResult,
    ) -> AlertingResult<ProcessOutcome> {
        let now = self.clock.now();
        let fingerprint = Fingerprint::new(event.event_type.as_str())
            .actor(event.user_id.as_deref())
            .source(event.ip_address.as_deref())
            .rule(Some(result.rule_id.as_str()))
            .session(event.session_id.as_deref())
            .compute(now.timestamp_millis(), self.dedup.config().window_ms);

        let mut alert = Alert::from_match(event, result, fingerprint.clone(), now);

        let registration = DedupRegistration {
            alert_id: alert.id.clone(),
            alert_type: alert.alert_type.clone(),
            severity: alert.severity,
            metadata: registration_metadata(event, result),
        };
        if let DedupOutcome::Duplicate(record) = self.dedup.check_and_register(&fingerprint, registration, None) {
            return self.merge_duplicate(record, now, result).await;
        }

        let escalation = self.correlate(&mut alert).await;

        if let Err(e) = self.repository.insert(&alert).await {
            // Release the claim so the next occurrence can create the alert
            self.dedup.remove(&fingerprint);
            return Err(e.into());
        }
        self.counters.alerts_created.inc();
        tracing::debug!(alert_id = %alert.id, %fingerprint, severity = %alert.severity, "alert created");
        self.events.publish(AlertEvent::Created {
            alert_id: alert.id.clone(),
            fingerprint: fingerprint.clone(),
            severity: alert.severity,
            alert_type: alert.alert_type.clone(),
            timestamp: now,
        });

        let escalated = escalation.is_some();
        if let Some((from, reason)) = escalation {
            self.counters.escalations.inc();
            tracing::info!(alert_id = %alert.id, %from, to = %alert.severity, %reason, "alert escalated");
            self.events.publish(AlertEvent::Escalated {
                alert_id: alert.id.clone(),
                from,
                to: alert.severity,
                reason,
                correlation_id: alert.correlation_id.clone(),
                timestamp: now,
            });
        }

        if let Some(reason) = self.check_eligibility(&alert).await? {
            match &reason {
                SkipReason::LowSeverity => self.counters.held_low_severity.inc(),
                SkipReason::Suppressed { .. } => self.counters.held_suppressed.inc(),
                SkipReason::RateLimited(_) => self.counters.held_rate_limited.inc(),
            };
            tracing::warn!(alert_id = %alert.id, %reason, "alert held back from dispatch");
            return Ok(ProcessOutcome::Held {
                alert_id: alert.id,
                reason,
            });
        }

        let job = self.queue.enqueue(&alert.id, Some(alert.severity));
        self.counters.queued.inc();
        Ok(ProcessOutcome::Queued {
            alert_id: alert.id,
            job_id: job.id,
            priority: job.priority,
            severity: alert.severity,
            escalated,
        })
    }

    async fn merge_duplicate(
        &self,
        record: DedupRecord,
        at: DateTime<Utc>,
        result: &RuleEvaluationResult,
    ) -> AlertingResult<ProcessOutcome> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(self.dedup.config().pending_insert_wait_ms);
        let mut delay = Duration::from_millis(DUPLICATE_LOOKUP_DELAY_MS);
        let alert = loop {
            match self
                .repository
                .record_occurrence(&record.alert_id, at, result.score, &result.evidence)
                .await
            {
                Ok(alert) => break alert,
                // The first occurrence may still be inserting
                Err(RepositoryError::NotFound(_)) if tokio::time::Instant::now() < deadline => {
                    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                    tokio::time::sleep(delay.min(remaining)).await;
                    delay = (delay * 2).min(Duration::from_millis(DUPLICATE_LOOKUP_MAX_DELAY_MS));
                }
                Err(e) => return Err(e.into()),
            }
        };

        self.counters.duplicates.inc();
        tracing::debug!(
            alert_id = %alert.id,
            fingerprint = %record.fingerprint,
            occurrences = alert.occurrence_count,
            "duplicate folded into existing alert"
        );
        Ok(ProcessOutcome::Duplicate {
            alert_id: alert.id,
            fingerprint: record.fingerprint,
            occurrence_count: alert.occurrence_count,
        })
    }

    /// Attach correlation and apply escalation to a not yet stored alert.
    /// Correlation failures are logged and the alert continues uncorrelated.
    /// Returns the previous severity and reason when escalated.
    async fn correlate(&self, alert: &mut Alert) -> Option<(Severity, String)> {
        let result = match self.correlation.correlate(alert).await {
            Ok(result) => result,
            Err(e) => {
                self.counters.correlation_errors.inc();
                tracing::warn!(alert_id = %alert.id, error = %e, "correlation failed, continuing uncorrelated");
                return None;
            }
        };

        if result.is_correlated() {
            alert.correlation_id = Some(result.correlation_id.clone());
            alert.is_correlated = true;
        }
        if !result.should_escalate {
            return None;
        }

        let reason = result
            .escalation_reason
            .unwrap_or_else(|| "correlated activity".to_string());
        let from = alert.escalate(&reason, self.clock.now());
        Some((from, reason))
    }

    /// First failing gate, or `None` if the alert may be dispatched
    pub async fn check_eligibility(&self, alert: &Alert) -> AlertingResult<Option<SkipReason>> {
        if alert.severity == Severity::Low && !self.dispatch_low_severity {
            return Ok(Some(SkipReason::LowSeverity));
        }
        if let Some(until) = alert.suppressed_until.filter(|_| alert.is_suppressed(self.clock.now())) {
            return Ok(Some(SkipReason::Suppressed { until }));
        }
        let decision = self.rate_limiter.check(alert).await?;
        if !decision.is_allowed() {
            return Ok(Some(SkipReason::RateLimited(decision)));
        }
        Ok(None)
    }

    fn report_failure(&self, event: &SecurityEvent, alert_id: Option<String>, error: &AlertingError) {
        self.counters.processing_errors.inc();
        tracing::error!(event_id = %event.id, event_type = %event.event_type, %error, "alert processing failed");
        self.events.publish(AlertEvent::ProcessingFailed {
            event_id: event.id.clone(),
            alert_id,
            error: error.to_string(),
            timestamp: self.clock.now(),
        });
    }

    /// Mark an alert resolved and release its fingerprint
    pub async fn resolve_alert(&self, alert_id: &str) -> AlertingResult<Alert> {
        let at = self.clock.now();
        let alert = self
            .repository
            .update(alert_id, Box::new(move |a| a.set_status(AlertStatus::Resolved, at)))
            .await?;
        if self
            .dedup
            .get_alert_info(&alert.fingerprint)
            .map_or(false, |r| r.alert_id == alert.id)
        {
            self.dedup.remove(&alert.fingerprint);
        }
        tracing::info!(alert_id, "alert resolved");
        Ok(alert)
    }

    pub async fn suppress_alert(&self, alert_id: &str, until: DateTime<Utc>) -> AlertingResult<Alert> {
        let at = self.clock.now();
        let alert = self
            .repository
            .update(
                alert_id,
                Box::new(move |a| {
                    a.suppressed_until = Some(until);
                    a.updated_at = at;
                }),
            )
            .await?;
        tracing::info!(alert_id, until = %until.to_rfc3339(), "alert suppressed");
        Ok(alert)
    }

    /// Put a FAILED alert back on the dispatch queue
    pub async fn retry_failed_alert(&self, alert_id: &str) -> AlertingResult<DispatchJob> {
        let alert = self.repository.get(alert_id).await?;
        if alert.status != AlertStatus::Failed {
            return Err(AlertingError::InvalidState {
                alert_id: alert.id,
                status: alert.status,
                reason: "only FAILED alerts can be retried".to_string(),
            });
        }
        let at = self.clock.now();
        let alert = self
            .repository
            .update(
                alert_id,
                Box::new(move |a| {
                    a.set_status(AlertStatus::Pending, at);
                    a.dispatch_errors.clear();
                }),
            )
            .await?;
        let job = self.queue.enqueue(&alert.id, Some(alert.severity));
        tracing::info!(alert_id, job_id = %job.id, "failed alert re-queued");
        Ok(job)
    }

    /// Counts from storage plus live component metrics
    pub async fn statistics(&self, since: Option<DateTime<Utc>>) -> AlertingResult<AlertStatistics> {
        Ok(AlertStatistics {
            generated_at: self.clock.now(),
            since,
            alerts: self.repository.counts(since).await?,
            pipeline: self.stats(),
            dedup: self.dedup.get_cache_stats(),
            correlation: self.correlation.stats(),
            queue: self.queue.stats(),
            dispatch: None,
        })
    }

    pub fn stats(&self) -> PipelineMetrics {
        self.counters.snapshot()
    }

    /// Queue every PENDING alert without a live job that now passes the
    /// eligibility gate. Covers alerts left PENDING by a crash and alerts
    /// held back by the rate limit whose window has since moved on.
    pub async fn requeue_pending(&self) -> AlertingResult<usize> {
        let pending = self.repository.find_by_status(AlertStatus::Pending, None).await?;

        let mut requeued = 0;
        for alert in pending {
            if self.queue.has_live_job(&alert.id) {
                continue;
            }
            if let Some(reason) = self.check_eligibility(&alert).await? {
                tracing::debug!(alert_id = %alert.id, %reason, "pending alert still held");
                continue;
            }
            self.queue.enqueue(&alert.id, Some(alert.severity));
            requeued += 1;
        }

        if requeued > 0 {
            tracing::info!(requeued, "pending alerts re-queued");
        }
        Ok(requeued)
    }

    /// Return alerts stuck in PROCESSING to PENDING, then re-queue every
    /// eligible PENDING alert
    pub async fn recover(&self) -> AlertingResult<RecoveryReport> {
        let now = self.clock.now();
        let stuck_before = now - chrono::Duration::milliseconds(self.queue.config().stuck_processing_ms as i64);
        let stuck = self
            .repository
            .find_by_status(AlertStatus::Processing, Some(stuck_before))
            .await?;

        let reset_alerts = stuck.len();
        for alert in stuck {
            self.repository
                .update(&alert.id, Box::new(move |a| a.set_status(AlertStatus::Pending, now)))
                .await?;
            tracing::warn!(alert_id = %alert.id, "recovered alert stuck in PROCESSING");
        }

        let requeued_alerts = self.requeue_pending().await?;
        if reset_alerts > 0 || requeued_alerts > 0 {
            tracing::info!(reset_alerts, requeued_alerts, "startup recovery complete");
        }
        Ok(RecoveryReport {
            reset_alerts,
            requeued_alerts,
        })
    }

    /// Run [`AlertEngine::requeue_pending`] every `queue.requeue_interval_ms`
    pub fn spawn_requeue(self: &Arc<Self>) -> BackgroundTask {
        let engine = Arc::clone(self);
        let period = Duration::from_millis(self.queue.config().requeue_interval_ms.max(1));
        BackgroundTask::every("pending-requeue", period, move || {
            let engine = Arc::clone(&engine);
            async move {
                if let Err(e) = engine.requeue_pending().await {
                    tracing::warn!(error = %e, "pending alert sweep failed");
                }
            }
        })
    }

    pub fn queue(&self) -> &Arc<DispatchQueue> {
        &self.queue
    }
}

fn registration_metadata(event: &SecurityEvent, result: &RuleEvaluationResult) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("rule_id".to_string(), MetaValue::from(result.rule_id.as_str()));
    metadata.insert("event_id".to_string(), MetaValue::from(event.id.as_str()));
    if let Some(user) = &event.user_id {
        metadata.insert("user_id".to_string(), MetaValue::from(user.as_str()));
    }
    if let Some(ip) = &event.ip_address {
        metadata.insert("ip_address".to_string(), MetaValue::from(ip.as_str()));
    }
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::CorrelationConfig;
    use crate::queue::{JobState, QueueConfig};
    use crate::repository::{AlertCounts, AlertUpdate, DispatchLogEntry, InMemoryAlertRepository, RepoResult};
    use crate::rules::RuleError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use sase_common::{Clock, ManualClock};

    /// Returns the same matches for every event, or an error
    struct ScriptedRules {
        results: Mutex<Result<Vec<RuleEvaluationResult>, RuleError>>,
    }

    impl ScriptedRules {
        fn matching(rule_id: &str, severity: Severity) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(Ok(vec![rule_match(rule_id, Some(severity))])),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(Err(RuleError::Unavailable("rule store offline".into()))),
            })
        }
    }

    #[async_trait]
    impl RuleEngine for ScriptedRules {
        async fn evaluate(&self, _event: &SecurityEvent) -> Result<Vec<RuleEvaluationResult>, RuleError> {
            self.results.lock().clone()
        }
    }

    fn rule_match(rule_id: &str, severity: Option<Severity>) -> RuleEvaluationResult {
        RuleEvaluationResult {
            matched: true,
            rule_id: rule_id.into(),
            rule_name: format!("{rule_id} rule"),
            score: 50.0,
            reason: String::new(),
            severity,
            evidence: serde_json::json!({ "failed_attempts": 7 }),
            suggested_actions: vec![],
            tags: vec![],
        }
    }

    struct Harness {
        clock: Arc<ManualClock>,
        repo: Arc<InMemoryAlertRepository>,
        queue: Arc<DispatchQueue>,
        events: Arc<EventBus>,
        engine: Arc<AlertEngine>,
    }

    fn harness_with(rules: Arc<dyn RuleEngine>, config: AlertingConfig) -> Harness {
        let clock = ManualClock::starting_now();
        let repo = Arc::new(InMemoryAlertRepository::new());
        let queue = Arc::new(DispatchQueue::new(QueueConfig::default(), clock.clone()));
        let events = Arc::new(EventBus::new());
        let engine = Arc::new(AlertEngine::new(
            &config,
            EngineComponents {
                rules,
                repository: repo.clone(),
                dedup: Arc::new(DeduplicationStore::new(config.dedup.clone(), clock.clone())),
                correlation: Arc::new(CorrelationEngine::new(
                    CorrelationConfig::default(),
                    repo.clone(),
                    clock.clone(),
                )),
                rate_limiter: Arc::new(DispatchRateLimiter::new(config.rate_limit.clone(), repo.clone(), clock.clone())),
                queue: queue.clone(),
                events: events.clone(),
                clock: clock.clone(),
            },
        ));
        Harness {
            clock,
            repo,
            queue,
            events,
            engine,
        }
    }

    fn harness(rules: Arc<dyn RuleEngine>) -> Harness {
        harness_with(rules, AlertingConfig::default())
    }

    fn login_failed(user: &str) -> SecurityEvent {
        SecurityEvent::new("login_failed").with_user(user).with_ip("203.0.113.7")
    }

    fn stored_alert(user: &str, event_type: &str, severity: Severity, at: DateTime<Utc>) -> Alert {
        let event = SecurityEvent::new(event_type).with_user(user);
        Alert::from_match(&event, &rule_match("seed", Some(severity)), uuid::Uuid::new_v4().to_string(), at)
    }

    #[tokio::test]
    async fn test_new_match_is_stored_and_queued() {
        let h = harness(ScriptedRules::matching("brute-force", Severity::Medium));
        let mut rx = h.events.subscribe();

        let outcomes = h.engine.process_event(&login_failed("alice")).await;
        assert_eq!(outcomes.len(), 1);
        let ProcessOutcome::Queued { alert_id, priority, escalated, .. } = &outcomes[0] else {
            panic!("expected queued, got {:?}", outcomes[0]);
        };
        assert_eq!(*priority, 3);
        assert!(!escalated);

        let stored = h.repo.get(alert_id).await.unwrap();
        assert_eq!(stored.status, AlertStatus::Pending);
        assert_eq!(h.queue.job_for_alert(alert_id).unwrap().job.priority, 3);
        assert_eq!(rx.recv().await.unwrap().name(), "alert.created");
        assert_eq!(h.engine.stats().alerts_created, 1);
    }

    #[tokio::test]
    async fn test_missing_severity_defaults_to_medium() {
        let rules = Arc::new(ScriptedRules {
            results: Mutex::new(Ok(vec![rule_match("r", None)])),
        });
        let h = harness(rules);

        let outcomes = h.engine.process_event(&login_failed("alice")).await;
        assert!(matches!(outcomes[0], ProcessOutcome::Queued { severity: Severity::Medium, .. }));
    }

    #[tokio::test]
    async fn test_duplicate_merges_into_existing_alert() {
        let h = harness(ScriptedRules::matching("brute-force", Severity::Medium));

        let first = h.engine.process_event(&login_failed("alice")).await;
        h.clock.advance_millis(1_000);
        let second = h.engine.process_event(&login_failed("alice")).await;

        let ProcessOutcome::Duplicate { alert_id, occurrence_count, .. } = &second[0] else {
            panic!("expected duplicate, got {:?}", second[0]);
        };
        assert_eq!(alert_id, first[0].alert_id());
        assert_eq!(*occurrence_count, 2);
        assert_eq!(h.repo.len(), 1);

        let stored = h.repo.get(alert_id).await.unwrap();
        assert!(stored.last_seen > stored.first_seen);
        assert_eq!(stored.evidence["occurrences"].as_array().unwrap().len(), 1);
        assert_eq!(h.engine.stats().duplicates, 1);
    }

    #[tokio::test]
    async fn test_new_bucket_creates_new_alert() {
        let h = harness(ScriptedRules::matching("brute-force", Severity::Medium));

        let first = h.engine.process_event(&login_failed("alice")).await;
        h.clock.advance_millis(600_000);
        let second = h.engine.process_event(&login_failed("alice")).await;

        assert!(matches!(second[0], ProcessOutcome::Queued { .. } | ProcessOutcome::Held { .. }));
        assert_ne!(first[0].alert_id(), second[0].alert_id());
        assert_eq!(h.repo.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_occurrences_create_one_alert() {
        let h = harness(ScriptedRules::matching("brute-force", Severity::Medium));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let engine = h.engine.clone();
                tokio::spawn(async move { engine.process_event(&login_failed("alice")).await })
            })
            .collect();
        let mut new_alerts = 0;
        for task in tasks {
            let outcomes = task.await.unwrap();
            if !matches!(outcomes[0], ProcessOutcome::Duplicate { .. }) {
                new_alerts += 1;
            }
        }

        assert_eq!(new_alerts, 1);
        assert_eq!(h.repo.len(), 1);
        let only = h.repo.recent(h.clock.now() - chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(only[0].occurrence_count, 8);
    }

    #[tokio::test]
    async fn test_high_alert_escalates_to_critical() {
        let h = harness(ScriptedRules::matching("exfil", Severity::High));
        let mut rx = h.events.subscribe();
        let now = h.clock.now();
        h.repo.save(&stored_alert("mallory", "mfa_bypass", Severity::High, now)).await.unwrap();
        h.repo.save(&stored_alert("mallory", "role_changed", Severity::Critical, now)).await.unwrap();

        let outcomes = h.engine.process_event(&SecurityEvent::new("data_export").with_user("mallory")).await;
        let ProcessOutcome::Queued { alert_id, severity, priority, escalated, .. } = &outcomes[0] else {
            panic!("expected queued, got {:?}", outcomes[0]);
        };
        assert_eq!(*severity, Severity::Critical);
        assert_eq!(*priority, 1);
        assert!(escalated);

        let stored = h.repo.get(alert_id).await.unwrap();
        assert!(stored.tags.contains(&"escalated".to_string()));
        assert!(stored.description.contains("mallory"));
        assert!(stored.is_correlated);

        assert_eq!(rx.recv().await.unwrap().name(), "alert.created");
        match rx.recv().await.unwrap() {
            AlertEvent::Escalated { from, to, .. } => {
                assert_eq!(from, Severity::High);
                assert_eq!(to, Severity::Critical);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_critical_alert_stays_critical() {
        let h = harness(ScriptedRules::matching("exfil", Severity::Critical));
        let now = h.clock.now();
        h.repo.save(&stored_alert("mallory", "mfa_bypass", Severity::High, now)).await.unwrap();
        h.repo.save(&stored_alert("mallory", "role_changed", Severity::High, now)).await.unwrap();

        let outcomes = h.engine.process_event(&SecurityEvent::new("data_export").with_user("mallory")).await;
        let stored = h.repo.get(outcomes[0].alert_id()).await.unwrap();
        assert_eq!(stored.severity, Severity::Critical);
        assert!(stored.tags.contains(&"escalated".to_string()));
    }

    #[tokio::test]
    async fn test_low_severity_is_held_unless_enabled() {
        let h = harness(ScriptedRules::matching("noise", Severity::Low));
        let outcomes = h.engine.process_event(&login_failed("alice")).await;
        assert!(matches!(
            outcomes[0],
            ProcessOutcome::Held { reason: SkipReason::LowSeverity, .. }
        ));
        assert!(h.queue.job_for_alert(outcomes[0].alert_id()).is_none());
        assert_eq!(h.engine.stats().held_low_severity, 1);

        let config = AlertingConfig {
            dispatch_low_severity: true,
            ..AlertingConfig::default()
        };
        let h = harness_with(ScriptedRules::matching("noise", Severity::Low), config);
        let outcomes = h.engine.process_event(&login_failed("alice")).await;
        assert!(matches!(outcomes[0], ProcessOutcome::Queued { priority: 4, .. }));
    }

    #[tokio::test]
    async fn test_rate_limited_user_is_held() {
        let h = harness(ScriptedRules::matching("brute-force", Severity::Medium));
        let now = h.clock.now();
        for _ in 0..10 {
            let mut prior = stored_alert("alice", "login_failed", Severity::Low, now);
            prior.dispatch_attempts = 1;
            prior.last_dispatch_at = Some(now);
            h.repo.save(&prior).await.unwrap();
        }

        let outcomes = h.engine.process_event(&login_failed("alice")).await;
        assert!(matches!(
            &outcomes[0],
            ProcessOutcome::Held { reason: SkipReason::RateLimited(RateLimitDecision::UserLimited { .. }), .. }
        ));
        assert_eq!(h.queue.stats().total_enqueued, 0);
    }

    #[tokio::test]
    async fn test_suppressed_alert_fails_eligibility() {
        let h = harness(ScriptedRules::matching("brute-force", Severity::Medium));
        let outcomes = h.engine.process_event(&login_failed("alice")).await;
        let until = h.clock.now() + chrono::Duration::hours(1);

        let alert = h.engine.suppress_alert(outcomes[0].alert_id(), until).await.unwrap();
        assert_eq!(
            h.engine.check_eligibility(&alert).await.unwrap(),
            Some(SkipReason::Suppressed { until })
        );

        h.clock.advance(chrono::Duration::hours(2));
        assert_eq!(h.engine.check_eligibility(&alert).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rule_failure_is_reported_not_raised() {
        let h = harness(ScriptedRules::failing());
        let mut rx = h.events.subscribe();

        let event = login_failed("alice");
        assert!(h.engine.process_event(&event).await.is_empty());

        match rx.recv().await.unwrap() {
            AlertEvent::ProcessingFailed { event_id, error, .. } => {
                assert_eq!(event_id, event.id);
                assert!(error.contains("offline"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(h.engine.stats().processing_errors, 1);
    }

    #[tokio::test]
    async fn test_event_without_type_is_rejected() {
        let h = harness(ScriptedRules::matching("r", Severity::High));
        let outcomes = h.engine.process_event(&SecurityEvent::new("  ")).await;
        assert!(outcomes.is_empty());
        assert_eq!(h.engine.stats().processing_errors, 1);
        assert!(h.repo.is_empty());
    }

    #[tokio::test]
    async fn test_retry_failed_alert_requires_failed_status() {
        let h = harness(ScriptedRules::matching("brute-force", Severity::Medium));
        let mut failed = stored_alert("bob", "login_failed", Severity::High, h.clock.now());
        failed.status = AlertStatus::Failed;
        failed.dispatch_errors.insert("email".into(), "timeout".into());
        h.repo.save(&failed).await.unwrap();
        let pending = stored_alert("bob", "login_failed", Severity::High, h.clock.now());
        h.repo.save(&pending).await.unwrap();

        assert!(matches!(
            h.engine.retry_failed_alert(&pending.id).await,
            Err(AlertingError::InvalidState { .. })
        ));

        let job = h.engine.retry_failed_alert(&failed.id).await.unwrap();
        assert_eq!(job.priority, 2);
        let stored = h.repo.get(&failed.id).await.unwrap();
        assert_eq!(stored.status, AlertStatus::Pending);
        assert!(stored.dispatch_errors.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_releases_fingerprint() {
        let h = harness(ScriptedRules::matching("brute-force", Severity::Medium));
        let first = h.engine.process_event(&login_failed("alice")).await;

        let resolved = h.engine.resolve_alert(first[0].alert_id()).await.unwrap();
        assert_eq!(resolved.status, AlertStatus::Resolved);

        let again = h.engine.process_event(&login_failed("alice")).await;
        assert!(!matches!(again[0], ProcessOutcome::Duplicate { .. }));
        assert_ne!(again[0].alert_id(), first[0].alert_id());
    }

    #[tokio::test]
    async fn test_statistics_combine_storage_and_counters() {
        let h = harness(ScriptedRules::matching("brute-force", Severity::High));
        h.engine
            .process_batch(&[login_failed("alice"), login_failed("bob"), login_failed("alice")])
            .await;

        let stats = h.engine.statistics(None).await.unwrap();
        assert_eq!(stats.alerts.total, 2);
        assert_eq!(stats.pipeline.events_received, 3);
        assert_eq!(stats.pipeline.duplicates, 1);
        assert_eq!(stats.dedup.active_records, 2);
        assert!(stats.dispatch.is_none());
    }

    #[tokio::test]
    async fn test_recover_resets_stuck_and_requeues_pending() {
        let h = harness(ScriptedRules::matching("brute-force", Severity::Medium));

        let mut stuck = stored_alert("u1", "login_failed", Severity::High, h.clock.now());
        stuck.status = AlertStatus::Processing;
        h.repo.save(&stuck).await.unwrap();
        h.clock.advance(chrono::Duration::minutes(90));

        let now = h.clock.now();
        let mut fresh = stored_alert("u2", "login_failed", Severity::High, now);
        fresh.status = AlertStatus::Processing;
        h.repo.save(&fresh).await.unwrap();
        // Left PENDING by a crash before it was queued
        let orphan = stored_alert("u3", "login_failed", Severity::Medium, now);
        h.repo.save(&orphan).await.unwrap();
        let low = stored_alert("u4", "port_scan", Severity::Low, now);
        h.repo.save(&low).await.unwrap();
        let queued = stored_alert("u5", "login_failed", Severity::High, now);
        h.repo.save(&queued).await.unwrap();
        h.queue.enqueue(&queued.id, Some(Severity::High));

        let report = h.engine.recover().await.unwrap();
        assert_eq!(report.reset_alerts, 1);
        assert_eq!(report.requeued_alerts, 2);

        assert_eq!(h.repo.get(&stuck.id).await.unwrap().status, AlertStatus::Pending);
        assert_eq!(h.queue.job_for_alert(&stuck.id).unwrap().state, JobState::Waiting);
        assert_eq!(h.queue.job_for_alert(&orphan.id).unwrap().job.priority, 3);
        assert_eq!(h.repo.get(&fresh.id).await.unwrap().status, AlertStatus::Processing);
        assert!(h.queue.job_for_alert(&fresh.id).is_none());
        assert!(h.queue.job_for_alert(&low.id).is_none());
        assert_eq!(h.queue.stats().total_enqueued, 3);
    }

    #[tokio::test]
    async fn test_rate_limited_alert_is_requeued_once_window_moves() {
        let h = harness(ScriptedRules::matching("brute-force", Severity::Medium));
        let now = h.clock.now();
        for _ in 0..10 {
            let mut prior = stored_alert("carol", "seeded", Severity::Medium, now);
            prior.status = AlertStatus::Dispatched;
            prior.dispatch_attempts = 1;
            prior.last_dispatch_at = Some(now);
            h.repo.save(&prior).await.unwrap();
        }
        let held = stored_alert("carol", "login_failed", Severity::High, now);
        h.repo.save(&held).await.unwrap();

        assert_eq!(h.engine.requeue_pending().await.unwrap(), 0);
        assert!(h.queue.job_for_alert(&held.id).is_none());

        h.clock.advance(chrono::Duration::minutes(61));
        assert_eq!(h.engine.requeue_pending().await.unwrap(), 1);
        assert_eq!(h.queue.job_for_alert(&held.id).unwrap().state, JobState::Waiting);
        // Already has a live job
        assert_eq!(h.engine.requeue_pending().await.unwrap(), 0);
    }

    /// In-memory store whose inserts take `delay` to land
    struct SlowInsert {
        inner: InMemoryAlertRepository,
        delay: Duration,
    }

    #[async_trait]
    impl AlertRepository for SlowInsert {
        async fn insert(&self, alert: &Alert) -> RepoResult<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.insert(alert).await
        }
        async fn get(&self, id: &str) -> RepoResult<Alert> {
            self.inner.get(id).await
        }
        async fn save(&self, alert: &Alert) -> RepoResult<()> {
            self.inner.save(alert).await
        }
        async fn update(&self, id: &str, change: AlertUpdate) -> RepoResult<Alert> {
            self.inner.update(id, change).await
        }
        async fn recent(&self, since: DateTime<Utc>) -> RepoResult<Vec<Alert>> {
            self.inner.recent(since).await
        }
        async fn find_by_status(
            &self,
            status: AlertStatus,
            updated_before: Option<DateTime<Utc>>,
        ) -> RepoResult<Vec<Alert>> {
            self.inner.find_by_status(status, updated_before).await
        }
        async fn count_dispatch_attempted(
            &self,
            user_id: Option<&str>,
            since: DateTime<Utc>,
            exclude_alert: Option<&str>,
        ) -> RepoResult<u64> {
            self.inner.count_dispatch_attempted(user_id, since, exclude_alert).await
        }
        async fn append_dispatch_log(&self, entry: DispatchLogEntry) -> RepoResult<()> {
            self.inner.append_dispatch_log(entry).await
        }
        async fn dispatch_logs(&self, alert_id: &str) -> RepoResult<Vec<DispatchLogEntry>> {
            self.inner.dispatch_logs(alert_id).await
        }
        async fn counts(&self, since: Option<DateTime<Utc>>) -> RepoResult<AlertCounts> {
            self.inner.counts(since).await
        }
    }

    fn slow_insert_engine(insert_delay_ms: u64, wait_ms: u64) -> Arc<AlertEngine> {
        let mut config = AlertingConfig::default();
        config.dedup.pending_insert_wait_ms = wait_ms;
        let clock = ManualClock::starting_now();
        let repo: Arc<dyn AlertRepository> = Arc::new(SlowInsert {
            inner: InMemoryAlertRepository::new(),
            delay: Duration::from_millis(insert_delay_ms),
        });
        Arc::new(AlertEngine::new(
            &config,
            EngineComponents {
                rules: ScriptedRules::matching("brute-force", Severity::Medium),
                repository: repo.clone(),
                dedup: Arc::new(DeduplicationStore::new(config.dedup.clone(), clock.clone())),
                correlation: Arc::new(CorrelationEngine::new(CorrelationConfig::default(), repo.clone(), clock.clone())),
                rate_limiter: Arc::new(DispatchRateLimiter::new(config.rate_limit.clone(), repo.clone(), clock.clone())),
                queue: Arc::new(DispatchQueue::new(QueueConfig::default(), clock.clone())),
                events: Arc::new(EventBus::new()),
                clock,
            },
        ))
    }

    async fn first_then_duplicate(engine: &Arc<AlertEngine>) -> (Vec<ProcessOutcome>, Vec<ProcessOutcome>) {
        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.process_event(&login_failed("alice")).await })
        };
        // Let the first occurrence claim the fingerprint and start inserting
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = engine.process_event(&login_failed("alice")).await;
        (first.await.unwrap(), second)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_duplicate_waits_for_slow_first_insert() {
        let engine = slow_insert_engine(400, 2_000);
        let (first, second) = first_then_duplicate(&engine).await;

        assert!(matches!(first[0], ProcessOutcome::Queued { .. }));
        let ProcessOutcome::Duplicate { alert_id, occurrence_count, .. } = &second[0] else {
            panic!("expected duplicate, got {:?}", second);
        };
        assert_eq!(alert_id, first[0].alert_id());
        assert_eq!(*occurrence_count, 2);
        assert_eq!(engine.stats().processing_errors, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_duplicate_wait_is_bounded_by_config() {
        let engine = slow_insert_engine(400, 50);
        let (first, second) = first_then_duplicate(&engine).await;

        assert!(matches!(first[0], ProcessOutcome::Queued { .. }));
        assert!(second.is_empty());
        assert_eq!(engine.stats().processing_errors, 1);
    }
}
