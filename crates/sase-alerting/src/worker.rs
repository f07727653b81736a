//! Dispatch job processing
//!
//! Bridges queue jobs to the channel dispatcher and owns the alert status
//! transitions around a dispatch round.

use crate::dispatcher::{ChannelDispatcher, DispatchError};
use crate::model::AlertStatus;
use crate::queue::{DispatchJob, JobError, JobHandler, JobOutcome};
use crate::repository::{AlertRepository, RepositoryError};
use async_trait::async_trait;
use sase_common::SharedClock;
use std::sync::Arc;

pub struct AlertJobHandler {
    repository: Arc<dyn AlertRepository>,
    dispatcher: Arc<ChannelDispatcher>,
    clock: SharedClock,
}

impl AlertJobHandler {
    pub fn new(repository: Arc<dyn AlertRepository>, dispatcher: Arc<ChannelDispatcher>, clock: SharedClock) -> Self {
        Self {
            repository,
            dispatcher,
            clock,
        }
    }

    async fn transition(&self, alert_id: &str, status: AlertStatus) -> Result<(), JobError> {
        let at = self.clock.now();
        self.repository
            .update(alert_id, Box::new(move |alert| alert.set_status(status, at)))
            .await
            .map(|_| ())
            .map_err(storage)
    }
}

fn storage(e: RepositoryError) -> JobError {
    JobError::Retryable(e.to_string())
}

#[async_trait]
impl JobHandler for AlertJobHandler {
    async fn handle(&self, job: &DispatchJob) -> Result<JobOutcome, JobError> {
        let mut alert = match self.repository.get(&job.alert_id).await {
            Ok(alert) => alert,
            Err(RepositoryError::NotFound(id)) => {
                return Err(JobError::Permanent(format!("alert {id} no longer exists")));
            }
            Err(e) => return Err(storage(e)),
        };

        if alert.status.is_terminal() {
            return Ok(JobOutcome::Skipped(format!("alert already {}", alert.status)));
        }

        self.transition(&alert.id, AlertStatus::Processing).await?;

        match self.dispatcher.dispatch_alert(&mut alert).await {
            Ok(outcome) if outcome.success => {
                self.transition(&alert.id, AlertStatus::Dispatched).await?;
                Ok(JobOutcome::Completed)
            }
            Ok(outcome) => {
                self.transition(&alert.id, AlertStatus::Failed).await?;
                let errors: Vec<String> = outcome.errors.iter().map(|(c, e)| format!("{c}: {e}")).collect();
                Err(JobError::Retryable(format!("no channel delivered ({})", errors.join("; "))))
            }
            Err(DispatchError::RateLimited(decision)) => {
                self.transition(&alert.id, AlertStatus::Pending).await?;
                Ok(JobOutcome::Skipped(decision.to_string()))
            }
            Err(e @ DispatchError::NoChannels { .. }) => {
                self.transition(&alert.id, AlertStatus::Failed).await?;
                Err(JobError::Permanent(e.to_string()))
            }
            Err(DispatchError::Repository(e)) => Err(storage(e)),
        }
    }
}
