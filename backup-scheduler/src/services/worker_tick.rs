use crate::state::AppState;
use backup_engine::RunOutcome;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

/// Calls [`backup_engine::Worker::run_next`] on a cron schedule.
pub struct WorkerTick {
    scheduler: Mutex<JobScheduler>,
    state: Arc<AppState>,
}

impl WorkerTick {
    pub async fn new(state: Arc<AppState>) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            state,
        })
    }

    pub async fn init(&self) -> anyhow::Result<()> {
        let state = self.state.clone();
        let cron = self.state.config.tick_schedule.clone();

        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let state = state.clone();
            Box::pin(async move {
                tick(&state).await;
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(cron = %cron, "Worker tick scheduled");
        Ok(())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}

/// One tick. Skipped while a previous invocation is still running.
pub async fn tick(state: &AppState) -> Option<RunOutcome> {
    match state.run_exclusive(|worker| worker.run_next()).await {
        Ok(Some(outcome)) => {
            match &outcome {
                RunOutcome::Idle => tracing::debug!("Worker tick: nothing to run"),
                RunOutcome::Completed { job_id, status } => {
                    tracing::info!(job_id, status = %status, "Worker tick: job finished")
                }
                RunOutcome::Suspended { job_id, reason } => {
                    tracing::info!(job_id, reason = %reason, "Worker tick: job suspended")
                }
                RunOutcome::Failed { job_id, error } => {
                    tracing::warn!(job_id, error = %error, "Worker tick: job failed")
                }
            }
            Some(outcome)
        }
        Ok(None) => {
            tracing::warn!("Skipping worker tick: previous run still in flight");
            None
        }
        Err(e) => {
            tracing::error!(error = %e, "Worker tick failed");
            None
        }
    }
}
