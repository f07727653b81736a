//! Alert Pipeline
//!
//! Wires every component from one [`AlertingConfig`]:
//! Ingest → Rules → Dedup → Correlate → Gate → Queue → Dispatch

use crate::channels::{ChannelHealth, ChannelRegistry, EmailChannel, LogMailTransport, MailTransport, WebhookChannel};
use crate::config::{AlertingConfig, ConfigError};
use crate::correlation::CorrelationEngine;
use crate::dedup::DeduplicationStore;
use crate::dispatcher::ChannelDispatcher;
use crate::engine::{AlertEngine, EngineComponents, ProcessOutcome, RecoveryReport};
use crate::error::AlertingResult;
use crate::events::{AlertEvent, EventBus};
use crate::metrics::AlertStatistics;
use crate::model::SecurityEvent;
use crate::queue::{DispatchQueue, QueueStats};
use crate::ratelimit::DispatchRateLimiter;
use crate::repository::AlertRepository;
use crate::rules::RuleEngine;
use crate::task::BackgroundTask;
use crate::worker::AlertJobHandler;
use chrono::{DateTime, Utc};
use sase_common::SharedClock;
use sase_resilience::{CircuitBreakerRegistry, CircuitBreakerStats};
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{broadcast, Semaphore};

pub struct AlertPipeline {
    config: AlertingConfig,
    clock: SharedClock,
    repository: Arc<dyn AlertRepository>,
    dedup: Arc<DeduplicationStore>,
    queue: Arc<DispatchQueue>,
    events: Arc<EventBus>,
    registry: Arc<ChannelRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    engine: Arc<AlertEngine>,
    dispatcher: Arc<ChannelDispatcher>,
}

/// Running background work; dropping it leaves the tasks running
pub struct PipelineHandles {
    pub recovery: RecoveryReport,
    sweeper: BackgroundTask,
    job_cleanup: BackgroundTask,
    requeue: BackgroundTask,
    workers: BackgroundTask,
}

impl PipelineHandles {
    /// Stop the periodic tasks, then let in-flight dispatch jobs finish
    pub async fn shutdown(self) {
        self.sweeper.shutdown().await;
        self.job_cleanup.shutdown().await;
        self.requeue.shutdown().await;
        self.workers.shutdown().await;
        tracing::info!("alert pipeline stopped");
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineHealth {
    pub checked_at: DateTime<Utc>,
    pub channels: Vec<ChannelHealth>,
    pub open_circuits: Vec<String>,
    pub breakers: Vec<CircuitBreakerStats>,
    pub queue: QueueStats,
}

/// Counts from one NDJSON ingest run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub lines: u64,
    pub events: u64,
    pub malformed: u64,
}

impl PipelineHealth {
    /// At least one enabled channel is healthy and closed
    pub fn can_dispatch(&self) -> bool {
        self.channels
            .iter()
            .any(|c| c.enabled && c.healthy && !self.open_circuits.contains(&c.name))
    }
}

impl AlertPipeline {
    /// Validate `config` and build the pipeline, registering the email and
    /// webhook channels it configures. Email goes to [`LogMailTransport`];
    /// use [`AlertPipeline::with_mail_transport`] to deliver it.
    pub fn new(
        config: AlertingConfig,
        rules: Arc<dyn RuleEngine>,
        repository: Arc<dyn AlertRepository>,
        clock: SharedClock,
    ) -> Result<Self, ConfigError> {
        Self::with_mail_transport(config, rules, repository, clock, None)
    }

    pub fn with_mail_transport(
        config: AlertingConfig,
        rules: Arc<dyn RuleEngine>,
        repository: Arc<dyn AlertRepository>,
        clock: SharedClock,
        mail: Option<Arc<dyn MailTransport>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let registry = Arc::new(ChannelRegistry::new());
        register_configured_channels(&registry, &config, mail);

        let events = Arc::new(EventBus::new());
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone(), clock.clone()));
        let dedup = Arc::new(DeduplicationStore::new(config.dedup.clone(), clock.clone()));
        let queue = Arc::new(DispatchQueue::new(config.queue.clone(), clock.clone()));
        let rate_limiter = Arc::new(DispatchRateLimiter::new(
            config.rate_limit.clone(),
            repository.clone(),
            clock.clone(),
        ));
        let correlation = Arc::new(CorrelationEngine::new(
            config.correlation.clone(),
            repository.clone(),
            clock.clone(),
        ));

        let dispatcher = Arc::new(ChannelDispatcher::new(
            &config,
            registry.clone(),
            breakers.clone(),
            rate_limiter.clone(),
            repository.clone(),
            events.clone(),
            clock.clone(),
        ));
        let engine = Arc::new(AlertEngine::new(
            &config,
            EngineComponents {
                rules,
                repository: repository.clone(),
                dedup: dedup.clone(),
                correlation,
                rate_limiter,
                queue: queue.clone(),
                events: events.clone(),
                clock: clock.clone(),
            },
        ));

        Ok(Self {
            config,
            clock,
            repository,
            dedup,
            queue,
            events,
            registry,
            breakers,
            engine,
            dispatcher,
        })
    }

    /// Run crash recovery, then start the periodic tasks and dispatch workers
    pub async fn start(&self) -> AlertingResult<PipelineHandles> {
        let recovery = self.engine.recover().await?;

        let sweeper = self.dedup.spawn_sweeper();
        let job_cleanup = self.queue.spawn_cleanup();
        let requeue = self.engine.spawn_requeue();
        let handler = Arc::new(AlertJobHandler::new(
            self.repository.clone(),
            self.dispatcher.clone(),
            self.clock.clone(),
        ));
        let workers = self.queue.start_workers(handler);

        tracing::info!(
            concurrency = self.config.queue.concurrency,
            channels = ?self.registry.enabled_names(),
            "alert pipeline started"
        );
        Ok(PipelineHandles {
            recovery,
            sweeper,
            job_cleanup,
            requeue,
            workers,
        })
    }

    pub async fn process_event(&self, event: &SecurityEvent) -> Vec<ProcessOutcome> {
        self.engine.process_event(event).await
    }

    /// Process newline-delimited JSON events from `reader`, at most
    /// `max_in_flight` at once. Malformed lines are logged and skipped.
    /// Returns after the input ends and every started event has finished.
    pub async fn ingest_ndjson<R>(self: &Arc<Self>, reader: R, max_in_flight: usize) -> std::io::Result<IngestSummary>
    where
        R: AsyncBufRead + Unpin,
    {
        let limit = max_in_flight.max(1);
        let permits = Arc::new(Semaphore::new(limit));
        let mut summary = IngestSummary::default();
        let mut lines = reader.lines();

        while let Some(line) = lines.next_line().await? {
            summary.lines += 1;
            if line.trim().is_empty() {
                continue;
            }
            let event = match serde_json::from_str::<SecurityEvent>(&line) {
                Ok(event) => event,
                Err(e) => {
                    summary.malformed += 1;
                    tracing::warn!(line = summary.lines, error = %e, "skipping malformed event");
                    continue;
                }
            };

            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            summary.events += 1;
            let pipeline = Arc::clone(self);
            tokio::spawn(async move {
                for outcome in pipeline.process_event(&event).await {
                    tracing::debug!(?outcome, "event processed");
                }
                drop(permit);
            });
        }

        let _drained = permits.acquire_many(limit as u32).await;
        Ok(summary)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.events.subscribe()
    }

    pub async fn statistics(&self, since: Option<DateTime<Utc>>) -> AlertingResult<AlertStatistics> {
        let mut stats = self.engine.statistics(since).await?;
        stats.dispatch = Some(self.dispatcher.stats());
        Ok(stats)
    }

    pub async fn health(&self) -> PipelineHealth {
        PipelineHealth {
            checked_at: self.clock.now(),
            channels: self.dispatcher.health_report().await,
            open_circuits: self.breakers.open_circuits(),
            breakers: self.breakers.stats(),
            queue: self.queue.stats(),
        }
    }

    pub fn config(&self) -> &AlertingConfig {
        &self.config
    }
    pub fn engine(&self) -> &Arc<AlertEngine> {
        &self.engine
    }
    pub fn dispatcher(&self) -> &Arc<ChannelDispatcher> {
        &self.dispatcher
    }
    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }
    pub fn queue(&self) -> &Arc<DispatchQueue> {
        &self.queue
    }
    pub fn repository(&self) -> &Arc<dyn AlertRepository> {
        &self.repository
    }
}

fn register_configured_channels(
    registry: &ChannelRegistry,
    config: &AlertingConfig,
    mail: Option<Arc<dyn MailTransport>>,
) {
    if let Some(email) = &config.channels.email {
        let transport = mail.unwrap_or_else(|| {
            tracing::warn!(
                transport = "LogMailTransport",
                "no mail transport supplied; email alerts are logged, not sent"
            );
            Arc::new(LogMailTransport)
        });
        registry.register(Arc::new(EmailChannel::new(email.clone(), transport)));
    }
    if let Some(webhook) = &config.channels.webhook {
        registry.register(Arc::new(WebhookChannel::new(webhook.clone())));
    }
    for name in registry.names() {
        if !registry.is_available(&name) {
            tracing::warn!(channel = %name, "channel configured but disabled");
        }
    }
}
