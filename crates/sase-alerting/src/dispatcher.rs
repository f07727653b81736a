//! Channel Dispatcher
//!
//! Fans one alert out to every channel routed for its severity. Each channel
//! send runs concurrently behind its own rate window, circuit breaker and
//! retry executor; one channel failing never blocks the others.

use crate::channels::{ChannelError, ChannelHealth, ChannelPayload, ChannelRegistry, ChannelSender};
use crate::config::{AlertingConfig, RoutingConfig};
use crate::events::{AlertEvent, EventBus};
use crate::model::{Alert, AlertStatus, Severity};
use crate::ratelimit::{DispatchRateLimiter, RateLimitDecision};
use crate::repository::{AlertRepository, DispatchLogEntry, DispatchLogStatus, RepositoryError};
use futures_util::future::join_all;
use sase_common::{AtomicCounter, HistogramSnapshot, LatencyHistogram, SharedClock};
use sase_resilience::{CircuitBreakerRegistry, KeyedRateLimiter, RetryExecutor};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatch rate limited: {0}")]
    RateLimited(RateLimitDecision),

    #[error("no enabled channels routed for {severity} alerts")]
    NoChannels { severity: Severity },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Aggregated result of one dispatch round
#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub alert_id: String,
    /// At least one channel delivered
    pub success: bool,
    pub dispatched_channels: Vec<String>,
    pub failed_channels: Vec<String>,
    pub errors: BTreeMap<String, String>,
    pub duration_ms: u64,
}

struct ChannelAttempt {
    channel: String,
    result: Result<(), ChannelError>,
    duration_ms: u64,
}

#[derive(Default)]
struct DispatcherStats {
    rounds: AtomicCounter,
    delivered: AtomicCounter,
    partial: AtomicCounter,
    failed: AtomicCounter,
    rate_limited: AtomicCounter,
    breaker_rejections: AtomicCounter,
    latency: LatencyHistogram,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchStats {
    pub rounds: u64,
    pub delivered: u64,
    pub partial: u64,
    pub failed: u64,
    pub rate_limited: u64,
    pub breaker_rejections: u64,
    pub latency: HistogramSnapshot,
}

pub struct ChannelDispatcher {
    registry: Arc<ChannelRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RetryExecutor,
    routing: RoutingConfig,
    channel_limits: BTreeMap<String, u64>,
    channel_windows: KeyedRateLimiter,
    rate_limiter: Arc<DispatchRateLimiter>,
    repository: Arc<dyn AlertRepository>,
    events: Arc<EventBus>,
    clock: SharedClock,
    stats: DispatcherStats,
}

impl ChannelDispatcher {
    pub fn new(
        config: &AlertingConfig,
        registry: Arc<ChannelRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        rate_limiter: Arc<DispatchRateLimiter>,
        repository: Arc<dyn AlertRepository>,
        events: Arc<EventBus>,
        clock: SharedClock,
    ) -> Self {
        Self {
            registry,
            breakers,
            retry: RetryExecutor::new(config.retry.clone()),
            routing: config.routing.clone(),
            channel_limits: config.channels.max_per_minute.clone(),
            channel_windows: KeyedRateLimiter::new(chrono::Duration::minutes(1), clock.clone()),
            rate_limiter,
            repository,
            events,
            clock,
            stats: DispatcherStats::default(),
        }
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Routed channels for `severity` that are registered and enabled
    pub fn channels_for(&self, severity: Severity) -> Vec<String> {
        self.routing
            .channels_for(severity)
            .iter()
            .filter(|name| self.registry.is_available(name))
            .cloned()
            .collect()
    }

    /// Deliver `alert` and record dispatch bookkeeping on it. Status is left
    /// to the caller.
    pub async fn dispatch_alert(&self, alert: &mut Alert) -> Result<DispatchOutcome, DispatchError> {
        let started = Instant::now();

        let slot = match self.rate_limiter.reserve(alert).await? {
            Ok(slot) => slot,
            Err(decision) => {
                self.stats.rate_limited.inc();
                tracing::info!(alert_id = %alert.id, %decision, "dispatch rate limited");
                return Err(DispatchError::RateLimited(decision));
            }
        };

        let channels = self.channels_for(alert.severity);
        if channels.is_empty() {
            return Err(DispatchError::NoChannels {
                severity: alert.severity,
            });
        }

        let payload = ChannelPayload::for_alert(alert);
        let attempts = join_all(channels.iter().map(|name| self.send_to(name, &payload))).await;

        let now = self.clock.now();
        let round = alert.dispatch_attempts + 1;
        let mut outcome = DispatchOutcome {
            alert_id: alert.id.clone(),
            success: false,
            dispatched_channels: Vec::new(),
            failed_channels: Vec::new(),
            errors: BTreeMap::new(),
            duration_ms: 0,
        };
        let mut logs = Vec::with_capacity(attempts.len());

        for attempt in attempts {
            let (status, error) = match attempt.result {
                Ok(()) => {
                    outcome.dispatched_channels.push(attempt.channel.clone());
                    (DispatchLogStatus::Success, None)
                }
                Err(e) => {
                    if e.is_circuit_open() {
                        self.stats.breaker_rejections.inc();
                    }
                    tracing::warn!(alert_id = %alert.id, channel = %attempt.channel, error = %e, "channel send failed");
                    outcome.failed_channels.push(attempt.channel.clone());
                    outcome.errors.insert(attempt.channel.clone(), e.to_string());
                    (DispatchLogStatus::Failed, Some(e.to_string()))
                }
            };
            logs.push(DispatchLogEntry {
                alert_id: alert.id.clone(),
                channel: attempt.channel,
                status,
                attempt: round,
                error,
                duration_ms: attempt.duration_ms,
                created_at: now,
            });
        }

        outcome.success = !outcome.dispatched_channels.is_empty();
        outcome.duration_ms = started.elapsed().as_millis() as u64;

        let delivered = outcome.dispatched_channels.clone();
        let errors = outcome.errors.clone();
        *alert = self
            .repository
            .update(
                &alert.id,
                Box::new(move |stored| {
                    stored.dispatch_attempts = round;
                    stored.last_dispatch_at = Some(now);
                    stored.add_dispatched_channels(&delivered);
                    stored.dispatch_errors = errors;
                    stored.updated_at = now;
                }),
            )
            .await?;
        // The attempt is now counted by the repository
        drop(slot);

        for entry in logs {
            if let Err(e) = self.repository.append_dispatch_log(entry).await {
                tracing::warn!(alert_id = %alert.id, error = %e, "failed to write dispatch log");
            }
        }

        self.stats.rounds.inc();
        self.stats.latency.record(outcome.duration_ms);
        match (outcome.success, outcome.failed_channels.is_empty()) {
            (true, true) => self.stats.delivered.inc(),
            (true, false) => self.stats.partial.inc(),
            (false, _) => self.stats.failed.inc(),
        };

        tracing::info!(
            alert_id = %alert.id,
            severity = %alert.severity,
            delivered = ?outcome.dispatched_channels,
            failed = ?outcome.failed_channels,
            duration_ms = outcome.duration_ms,
            "dispatch round complete"
        );

        self.events.publish(AlertEvent::DispatchCompleted {
            alert_id: alert.id.clone(),
            success: outcome.success,
            status: if outcome.success { AlertStatus::Dispatched } else { AlertStatus::Failed },
            dispatched_channels: outcome.dispatched_channels.clone(),
            failed_channels: outcome.failed_channels.clone(),
            duration_ms: outcome.duration_ms,
            timestamp: now,
        });

        Ok(outcome)
    }

    async fn send_to(&self, name: &str, payload: &ChannelPayload) -> ChannelAttempt {
        let started = Instant::now();
        let result = self.try_send(name, payload).await;
        ChannelAttempt {
            channel: name.to_string(),
            result,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn try_send(&self, name: &str, payload: &ChannelPayload) -> Result<(), ChannelError> {
        let channel = self
            .registry
            .get(name)
            .ok_or_else(|| ChannelError::NotRegistered(name.to_string()))?;

        if let Some(limit) = self.channel_limits.get(name) {
            if !self.channel_windows.try_acquire(name, *limit) {
                return Err(ChannelError::RateLimited(name.to_string()));
            }
        }

        let breaker = self.breakers.get_or_create(name);
        let retry = &self.retry;
        let sender: &dyn ChannelSender = channel.as_ref();

        breaker
            .execute(move || retry.execute(move || sender.send(payload)))
            .await
            .map_err(ChannelError::from)
    }

    pub async fn health_report(&self) -> Vec<ChannelHealth> {
        self.registry.health_report(&self.breakers).await
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            rounds: self.stats.rounds.get(),
            delivered: self.stats.delivered.get(),
            partial: self.stats.partial.get(),
            failed: self.stats.failed.get(),
            rate_limited: self.stats.rate_limited.get(),
            breaker_rejections: self.stats.breaker_rejections.get(),
            latency: self.stats.latency.snapshot(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::channels::testing::MockChannel;
    use crate::model::{RuleEvaluationResult, SecurityEvent};
    use crate::repository::InMemoryAlertRepository;
    use sase_common::{Clock, ManualClock};
    use sase_resilience::{CircuitBreakerConfig, CircuitState, RetryConfig};

    pub(crate) fn fast_config() -> AlertingConfig {
        let mut config = AlertingConfig::default();
        config.retry = RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            backoff_multiplier: 2.0,
            max_backoff_ms: 5,
            jitter_factor: 0.0,
            attempt_timeout_ms: 500,
        };
        config
    }

    struct Harness {
        clock: Arc<ManualClock>,
        repo: Arc<InMemoryAlertRepository>,
        registry: Arc<ChannelRegistry>,
        dispatcher: ChannelDispatcher,
    }

    fn harness(config: AlertingConfig) -> Harness {
        let clock = ManualClock::starting_now();
        let repo = Arc::new(InMemoryAlertRepository::new());
        let registry = Arc::new(ChannelRegistry::new());
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone(), clock.clone()));
        let limiter = Arc::new(DispatchRateLimiter::new(config.rate_limit.clone(), repo.clone(), clock.clone()));
        let dispatcher = ChannelDispatcher::new(
            &config,
            registry.clone(),
            breakers,
            limiter,
            repo.clone(),
            Arc::new(EventBus::new()),
            clock.clone(),
        );
        Harness {
            clock,
            repo,
            registry,
            dispatcher,
        }
    }

    fn alert(severity: Severity, user: &str, clock: &ManualClock) -> Alert {
        let event = SecurityEvent::new("login_failed").with_user(user);
        let result = RuleEvaluationResult {
            matched: true,
            rule_id: "brute-force".into(),
            rule_name: "Brute Force Attack".into(),
            score: 50.0,
            reason: String::new(),
            severity: Some(severity),
            evidence: serde_json::Value::Null,
            suggested_actions: vec![],
            tags: vec![],
        };
        Alert::from_match(&event, &result, uuid::Uuid::new_v4().to_string(), clock.now())
    }

    #[tokio::test]
    async fn test_partial_dispatch_with_open_breaker() {
        let h = harness(fast_config());
        let email = MockChannel::ok("email");
        let webhook = MockChannel::ok("webhook");
        h.registry.register(email.clone());
        h.registry.register(webhook.clone());
        h.dispatcher.breakers().get_or_create("webhook").force_open();

        let mut alert = alert(Severity::High, "u1", &h.clock);
        h.repo.insert(&alert).await.unwrap();
        let outcome = h.dispatcher.dispatch_alert(&mut alert).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.dispatched_channels, vec!["email"]);
        assert_eq!(outcome.failed_channels, vec!["webhook"]);
        assert_eq!(outcome.errors.keys().collect::<Vec<_>>(), vec!["webhook"]);
        assert_eq!(webhook.calls(), 0);
        assert_eq!(email.calls(), 1);

        let stored = h.repo.get(&alert.id).await.unwrap();
        assert_eq!(stored.dispatch_attempts, 1);
        assert_eq!(stored.dispatched_channels, vec!["email"]);
        assert!(stored.dispatch_errors.contains_key("webhook"));
        assert_eq!(h.repo.dispatch_logs(&alert.id).await.unwrap().len(), 2);
        assert_eq!(h.dispatcher.stats().breaker_rejections, 1);
        assert_eq!(h.dispatcher.stats().partial, 1);
    }

    #[tokio::test]
    async fn test_rate_limited_user_gets_no_sends() {
        let h = harness(fast_config());
        let email = MockChannel::ok("email");
        h.registry.register(email.clone());

        for _ in 0..10 {
            let mut prior = alert(Severity::Medium, "u1", &h.clock);
            prior.dispatch_attempts = 1;
            prior.last_dispatch_at = Some(h.clock.now());
            h.repo.save(&prior).await.unwrap();
        }

        let mut eleventh = alert(Severity::Medium, "u1", &h.clock);
        h.repo.insert(&eleventh).await.unwrap();
        let err = h.dispatcher.dispatch_alert(&mut eleventh).await.unwrap_err();
        assert!(matches!(err, DispatchError::RateLimited(RateLimitDecision::UserLimited { .. })));
        assert_eq!(email.calls(), 0);
        assert_eq!(eleventh.dispatch_attempts, 0);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let h = harness(fast_config());
        let email = MockChannel::ok("email");
        email.script(vec![Err(ChannelError::Transport("connection reset".into()))]);
        h.registry.register(email.clone());

        let mut alert = alert(Severity::Low, "u1", &h.clock);
        h.repo.insert(&alert).await.unwrap();
        let outcome = h.dispatcher.dispatch_alert(&mut alert).await.unwrap();
        assert!(outcome.success);
        assert_eq!(email.calls(), 2);
    }

    #[tokio::test]
    async fn test_all_channels_failing() {
        let h = harness(fast_config());
        let email = MockChannel::failing("email", ChannelError::Http { status: 400 });
        h.registry.register(email.clone());

        let mut alert = alert(Severity::Medium, "u1", &h.clock);
        h.repo.insert(&alert).await.unwrap();
        let outcome = h.dispatcher.dispatch_alert(&mut alert).await.unwrap();
        assert!(!outcome.success);
        // 4xx is not retried
        assert_eq!(email.calls(), 1);
        assert_eq!(alert.dispatch_attempts, 1);
        assert!(alert.dispatched_channels.is_empty());
    }

    #[tokio::test]
    async fn test_breaker_opens_after_repeated_failures() {
        let mut config = fast_config();
        config.circuit_breaker = CircuitBreakerConfig {
            failure_threshold: 2,
            minimum_number_of_calls: 2,
            ..CircuitBreakerConfig::default()
        };
        let h = harness(config);
        let email = MockChannel::failing("email", ChannelError::Http { status: 400 });
        h.registry.register(email.clone());

        for _ in 0..2 {
            let mut a = alert(Severity::Medium, "u1", &h.clock);
            h.repo.insert(&a).await.unwrap();
            h.dispatcher.dispatch_alert(&mut a).await.unwrap();
        }
        let breaker = h.dispatcher.breakers().get("email").unwrap();
        assert_eq!(breaker.state(), CircuitState::Open);

        let mut a = alert(Severity::Medium, "u2", &h.clock);
        h.repo.insert(&a).await.unwrap();
        let outcome = h.dispatcher.dispatch_alert(&mut a).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(email.calls(), 2);
    }

    #[tokio::test]
    async fn test_per_channel_minute_ceiling() {
        let mut config = fast_config();
        config.channels.max_per_minute.insert("email".into(), 1);
        let h = harness(config);
        let email = MockChannel::ok("email");
        h.registry.register(email.clone());

        let mut first = alert(Severity::Low, "u1", &h.clock);
        h.repo.insert(&first).await.unwrap();
        assert!(h.dispatcher.dispatch_alert(&mut first).await.unwrap().success);
        let mut second = alert(Severity::Low, "u2", &h.clock);
        h.repo.insert(&second).await.unwrap();
        let outcome = h.dispatcher.dispatch_alert(&mut second).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.errors["email"].contains("rate"));

        h.clock.advance_millis(60_001);
        let mut third = alert(Severity::Low, "u3", &h.clock);
        h.repo.insert(&third).await.unwrap();
        assert!(h.dispatcher.dispatch_alert(&mut third).await.unwrap().success);
    }

    #[tokio::test]
    async fn test_unroutable_severity() {
        let h = harness(fast_config());
        h.registry.register(MockChannel::ok("email"));
        // CRITICAL routes to email + webhook; drop email
        h.registry.unregister("email");

        let mut a = alert(Severity::Critical, "u1", &h.clock);
        h.repo.insert(&a).await.unwrap();
        assert!(matches!(
            h.dispatcher.dispatch_alert(&mut a).await,
            Err(DispatchError::NoChannels { severity: Severity::Critical })
        ));
    }
}
