//! Prioritized dispatch queue
//!
//! One job per alert, served lowest priority number first (CRITICAL = 1) and
//! FIFO within a priority. A fixed pool of permits bounds concurrent jobs.
//! Failed jobs are re-queued with exponential backoff until the attempt
//! budget runs out.

use crate::model::{job_priority, Severity};
use crate::task::BackgroundTask;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use sase_common::{AtomicCounter, SharedClock};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Jobs processed at once
    pub concurrency: usize,
    /// Attempts per job including the first
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt
    pub backoff_base_ms: u64,
    /// Completed job records are kept this long after finishing
    pub completed_retention_ms: u64,
    /// Failed job records are kept this long after finishing
    pub failed_retention_ms: u64,
    /// Period of the finished-job cleanup task
    pub cleanup_interval_ms: u64,
    /// Period of the sweep that re-queues PENDING alerts
    pub requeue_interval_ms: u64,
    /// PROCESSING alerts untouched for this long are reset at startup
    pub stuck_processing_ms: u64,
    /// Idle wait between checks for delayed jobs
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            max_attempts: 3,
            backoff_base_ms: 5_000,
            completed_retention_ms: 86_400_000,
            failed_retention_ms: 604_800_000,
            cleanup_interval_ms: 300_000,
            requeue_interval_ms: 60_000,
            stuck_processing_ms: 3_600_000,
            poll_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchJob {
    pub id: String,
    pub alert_id: String,
    pub priority: u8,
    /// 1-based attempt number of the current run
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    fn is_live(self) -> bool {
        matches!(self, JobState::Waiting | JobState::Delayed | JobState::Active)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job: DispatchJob,
    pub state: JobState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub note: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Finished without delivering; nothing to retry
    Skipped(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    #[error("{0}")]
    Retryable(String),

    #[error("{0}")]
    Permanent(String),
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &DispatchJob) -> Result<JobOutcome, JobError>;
}

#[derive(Debug, PartialEq, Eq)]
struct Ready {
    priority: u8,
    seq: u64,
    job_id: String,
}

impl Ord for Ready {
    // BinaryHeap is a max-heap: the lowest (priority, seq) must compare greatest
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueCounters {
    enqueued: AtomicCounter,
    completed: AtomicCounter,
    skipped: AtomicCounter,
    retried: AtomicCounter,
    failed: AtomicCounter,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub total_enqueued: u64,
    pub total_completed: u64,
    pub total_skipped: u64,
    pub total_retried: u64,
    pub total_failed: u64,
}

pub struct DispatchQueue {
    config: QueueConfig,
    clock: SharedClock,
    ready: Mutex<BinaryHeap<Ready>>,
    delayed: Mutex<Vec<(DateTime<Utc>, Ready)>>,
    jobs: DashMap<String, JobRecord>,
    seq: AtomicU64,
    notify: Notify,
    permits: Arc<Semaphore>,
    stats: QueueCounters,
}

fn job_id_for(alert_id: &str) -> String {
    format!("dispatch-{alert_id}")
}

impl DispatchQueue {
    pub fn new(config: QueueConfig, clock: SharedClock) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            config,
            clock,
            ready: Mutex::new(BinaryHeap::new()),
            delayed: Mutex::new(Vec::new()),
            jobs: DashMap::new(),
            seq: AtomicU64::new(0),
            notify: Notify::new(),
            permits,
            stats: QueueCounters::default(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Queue a dispatch job for `alert_id`. While a job for the alert is
    /// still waiting, delayed or running, that job is returned instead.
    pub fn enqueue(&self, alert_id: &str, severity: Option<Severity>) -> DispatchJob {
        let now = self.clock.now();
        let job = DispatchJob {
            id: job_id_for(alert_id),
            alert_id: alert_id.to_string(),
            priority: job_priority(severity),
            attempt: 0,
        };
        let record = JobRecord {
            job: job.clone(),
            state: JobState::Waiting,
            attempts: 0,
            last_error: None,
            note: None,
            enqueued_at: now,
            available_at: now,
            started_at: None,
            finished_at: None,
        };

        match self.jobs.entry(job.id.clone()) {
            Entry::Occupied(existing) if existing.get().state.is_live() => {
                tracing::debug!(job_id = %job.id, "dispatch job already queued");
                return existing.get().job.clone();
            }
            Entry::Occupied(mut finished) => {
                finished.insert(record);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(record);
            }
        }

        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.ready.lock().push(Ready {
            priority: job.priority,
            seq,
            job_id: job.id.clone(),
        });
        self.stats.enqueued.inc();
        self.notify.notify_one();
        tracing::debug!(job_id = %job.id, priority = job.priority, "dispatch job queued");
        job
    }

    fn promote_due(&self, now: DateTime<Utc>) {
        let due: Vec<Ready> = {
            let mut delayed = self.delayed.lock();
            if delayed.is_empty() {
                return;
            }
            let (due, pending): (Vec<_>, Vec<_>) = delayed.drain(..).partition(|(at, _)| *at <= now);
            *delayed = pending;
            due.into_iter().map(|(_, r)| r).collect()
        };

        for ready in &due {
            if let Some(mut record) = self.jobs.get_mut(&ready.job_id) {
                if record.state == JobState::Delayed {
                    record.state = JobState::Waiting;
                }
            }
        }
        self.ready.lock().extend(due);
    }

    /// Take the highest-priority runnable job and mark it active
    pub fn next_ready(&self) -> Option<DispatchJob> {
        let now = self.clock.now();
        self.promote_due(now);

        loop {
            let ready = self.ready.lock().pop()?;
            let Some(mut record) = self.jobs.get_mut(&ready.job_id) else {
                continue;
            };
            if record.state != JobState::Waiting {
                continue;
            }
            record.state = JobState::Active;
            record.attempts += 1;
            record.started_at = Some(now);
            record.job.attempt = record.attempts;
            return Some(record.job.clone());
        }
    }

    /// Run one job through `handler` and settle its record
    pub async fn run_job(&self, job: DispatchJob, handler: &dyn JobHandler) -> JobState {
        let result = handler.handle(&job).await;
        let now = self.clock.now();

        let Some(mut record) = self.jobs.get_mut(&job.id) else {
            return JobState::Failed;
        };

        match result {
            Ok(outcome) => {
                record.state = JobState::Completed;
                record.finished_at = Some(now);
                if let JobOutcome::Skipped(reason) = outcome {
                    tracing::debug!(job_id = %job.id, %reason, "dispatch job skipped");
                    record.note = Some(reason);
                    self.stats.skipped.inc();
                } else {
                    self.stats.completed.inc();
                }
                JobState::Completed
            }
            Err(JobError::Retryable(e)) if record.attempts < self.config.max_attempts => {
                let delay = self.backoff(record.attempts);
                let available_at = now + delay;
                record.state = JobState::Delayed;
                record.available_at = available_at;
                record.last_error = Some(e.clone());
                let priority = record.job.priority;
                drop(record);

                let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
                self.delayed.lock().push((
                    available_at,
                    Ready {
                        priority,
                        seq,
                        job_id: job.id.clone(),
                    },
                ));
                self.stats.retried.inc();
                tracing::warn!(
                    job_id = %job.id,
                    attempt = job.attempt,
                    retry_in_ms = delay.num_milliseconds(),
                    error = %e,
                    "dispatch job failed, retrying"
                );
                JobState::Delayed
            }
            Err(e) => {
                record.state = JobState::Failed;
                record.finished_at = Some(now);
                record.last_error = Some(e.to_string());
                self.stats.failed.inc();
                tracing::error!(job_id = %job.id, attempt = job.attempt, error = %e, "dispatch job failed permanently");
                JobState::Failed
            }
        }
    }

    /// Delay before the retry following attempt `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        Duration::milliseconds(self.config.backoff_base_ms.saturating_mul(1u64 << exp) as i64)
    }

    /// Process a single runnable job, if any
    pub async fn process_next(&self, handler: &dyn JobHandler) -> Option<JobState> {
        let job = self.next_ready()?;
        Some(self.run_job(job, handler).await)
    }

    /// Start the worker loop; at most `concurrency` jobs run at once.
    /// Shutdown waits for in-flight jobs.
    pub fn start_workers(self: &Arc<Self>, handler: Arc<dyn JobHandler>) -> BackgroundTask {
        let queue = Arc::clone(self);

        BackgroundTask::spawn("dispatch-workers", move |mut stop| async move {
            let poll = std::time::Duration::from_millis(queue.config.poll_interval_ms.max(1));
            tracing::info!(concurrency = queue.config.concurrency, "dispatch workers started");

            loop {
                if *stop.borrow() {
                    break;
                }

                let permit = tokio::select! {
                    permit = Arc::clone(&queue.permits).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                    _ = stop.changed() => break,
                };

                match queue.next_ready() {
                    Some(job) => {
                        let queue = Arc::clone(&queue);
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            queue.run_job(job, handler.as_ref()).await;
                            drop(permit);
                        });
                    }
                    None => {
                        drop(permit);
                        tokio::select! {
                            _ = queue.notify.notified() => {}
                            _ = tokio::time::sleep(poll) => {}
                            _ = stop.changed() => break,
                        }
                    }
                }
            }

            let all = queue.config.concurrency.max(1) as u32;
            let _drained = queue.permits.acquire_many(all).await;
            tracing::info!("dispatch workers stopped");
        })
    }

    /// Drop finished job records past their retention. Failed records live
    /// longer than completed ones so they stay visible for inspection.
    pub fn cleanup_finished(&self) -> usize {
        let now = self.clock.now();
        let completed_cutoff = now - Duration::milliseconds(self.config.completed_retention_ms as i64);
        let failed_cutoff = now - Duration::milliseconds(self.config.failed_retention_ms as i64);

        let before = self.jobs.len();
        self.jobs.retain(|_, r| {
            let cutoff = match r.state {
                JobState::Completed => completed_cutoff,
                JobState::Failed => failed_cutoff,
                _ => return true,
            };
            r.finished_at.map_or(true, |t| t >= cutoff)
        });
        let removed = before.saturating_sub(self.jobs.len());
        if removed > 0 {
            tracing::debug!(removed, remaining = self.jobs.len(), "finished dispatch jobs cleaned up");
        }
        removed
    }

    /// Run [`DispatchQueue::cleanup_finished`] every `cleanup_interval_ms`
    pub fn spawn_cleanup(self: &Arc<Self>) -> BackgroundTask {
        let queue = Arc::clone(self);
        let period = std::time::Duration::from_millis(self.config.cleanup_interval_ms.max(1));
        BackgroundTask::every("dispatch-job-cleanup", period, move || {
            let queue = Arc::clone(&queue);
            async move {
                queue.cleanup_finished();
            }
        })
    }

    pub fn job(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs.get(job_id).map(|r| r.value().clone())
    }

    pub fn job_for_alert(&self, alert_id: &str) -> Option<JobRecord> {
        self.job(&job_id_for(alert_id))
    }

    /// A job for `alert_id` is waiting, delayed or running
    pub fn has_live_job(&self, alert_id: &str) -> bool {
        self.jobs
            .get(&job_id_for(alert_id))
            .map_or(false, |r| r.state.is_live())
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            total_enqueued: self.stats.enqueued.get(),
            total_completed: self.stats.completed.get(),
            total_skipped: self.stats.skipped.get(),
            total_retried: self.stats.retried.get(),
            total_failed: self.stats.failed.get(),
            ..QueueStats::default()
        };
        for record in self.jobs.iter() {
            match record.state {
                JobState::Waiting => stats.waiting += 1,
                JobState::Delayed => stats.delayed += 1,
                JobState::Active => stats.active += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
            }
        }
        stats
    }
}
