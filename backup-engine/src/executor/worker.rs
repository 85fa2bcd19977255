//! One worker invocation: pick a job, run its driver under a fresh time
//! budget, and record the outcome on the job.
//!
//! The process-level result is always `Ok` unless the queue itself is
//! unusable; how the job went is carried by its status.

use super::JobContext;
use crate::budget::{Flow, TimeBudget, YieldReason};
use crate::config::Config;
use crate::destination::DestinationSet;
use crate::drivers::{driver_for, Completion, DriverEnv};
use crate::job::{Job, LogLevel, Queue, Status};
use crate::{EngineError, Result};
use serde::Serialize;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum RunOutcome {
    /// Nothing to do.
    Idle,
    /// The job reached a terminal status.
    Completed { job_id: i64, status: Status },
    /// The job yielded and will continue on a later invocation.
    Suspended { job_id: i64, reason: YieldReason },
    Failed { job_id: i64, error: String },
}

pub struct Worker {
    config: Config,
    queue: Queue,
    destinations: DestinationSet,
}

impl Worker {
    pub fn new(config: Config, queue: Queue) -> Result<Self> {
        let destinations = config.destination_set()?;
        Ok(Self { config, queue, destinations })
    }

    /// Open the queue named by `config`.
    pub fn open(config: Config) -> Result<Self> {
        let queue = Queue::open(&config.db_path(), &config.worker.data_dir)?.with_worker_id(&config.worker.id);
        Self::new(config, queue)
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn destinations(&self) -> &DestinationSet {
        &self.destinations
    }

    /// Reap stale jobs, then run the next runnable one.
    pub fn run_next(&self) -> Result<RunOutcome> {
        self.housekeeping()?;
        match self.queue.next_to_run()? {
            Some(job) => self.run_job(job.id),
            None => Ok(RunOutcome::Idle),
        }
    }

    pub fn run_job(&self, job_id: i64) -> Result<RunOutcome> {
        self.run_with_budget(job_id, TimeBudget::new(self.config.time_budget()))
    }

    pub fn run_with_budget(&self, job_id: i64, budget: TimeBudget) -> Result<RunOutcome> {
        let mut job = self.queue.get(job_id)?;
        if job.is_terminal() {
            return Err(EngineError::Validation(format!(
                "job {} already finished ({})",
                job_id,
                job.status_label()
            )));
        }

        let Some(driver) = driver_for(job.job_type) else {
            let err = EngineError::UnsupportedJob(job.job_type.to_string());
            self.queue.record_error(&mut job, &err.to_string())?;
            self.queue.update_status(&mut job, Status::FAILED)?;
            return Ok(RunOutcome::Failed { job_id, error: err.to_string() });
        };

        if job.status.is_pending() {
            self.queue.update_status(&mut job, Status::STARTED)?;
        }
        info!(job_id, job_type = %job.job_type, status = job.status_label(), "Running job");

        let workspace = self.queue.workspace(&job);
        workspace.ensure()?;
        let budget = budget.watch_abort_marker(&workspace.abort_marker());
        let policy = self.config.item_policy(job.job_type);
        let env = DriverEnv { config: &self.config, destinations: &self.destinations };

        let mut ctx = JobContext::new(job, &self.queue, workspace.clone(), budget, policy)?;
        let result = driver.run(&mut ctx, &env);
        let saved = ctx.save_progress();
        let mut job = ctx.finish();
        saved?;

        match result {
            Ok(Flow::Done(completion)) => self.complete(&mut job, completion),
            Ok(Flow::Yield(YieldReason::Aborted)) => {
                self.settle(&mut job, Status::ABORTED)?;
                workspace.remove()?;
                warn!(job_id, "Job stopped on abort request");
                Ok(RunOutcome::Completed { job_id, status: job.status })
            }
            Ok(Flow::Yield(reason)) => {
                info!(job_id, status = job.status_label(), current = job.progress.current, "Job suspended");
                Ok(RunOutcome::Suspended { job_id, reason })
            }
            Err(err) => {
                error!(job_id, "Job failed: {}", err);
                self.queue.record_error(&mut job, &err.to_string())?;
                self.settle(&mut job, Status::FAILED)?;
                Ok(RunOutcome::Failed { job_id, error: err.to_string() })
            }
        }
    }

    fn complete(&self, job: &mut Job, completion: Completion) -> Result<RunOutcome> {
        let status = if completion.partial || job.errors > 0 {
            Status::PARTIALLY_DONE
        } else {
            Status::DONE
        };
        if !completion.summary.is_empty() {
            self.queue.log(job, LogLevel::Info, &completion.summary)?;
        }
        self.settle(job, status)?;
        info!(job_id = job.id, status = job.status_label(), "{}", completion.summary);

        if let Some(next) = completion.follow_up {
            if job.status == status {
                match self.queue.enqueue(next) {
                    Ok(queued) => info!(job_id = job.id, follow_up = queued.id, "Queued follow-up {} job", queued.job_type),
                    Err(e) => {
                        warn!(job_id = job.id, "Could not queue follow-up job: {}", e);
                        self.queue.log(job, LogLevel::Warn, &format!("Follow-up job not queued: {}", e))?;
                    }
                }
            }
        }
        Ok(RunOutcome::Completed { job_id: job.id, status: job.status })
    }

    /// Move to a terminal status unless something else already finished
    /// the job (an abort from the admin surface, the reaper).
    fn settle(&self, job: &mut Job, status: Status) -> Result<()> {
        if job.is_terminal() {
            return Ok(());
        }
        match self.queue.update_status(job, status) {
            Err(EngineError::StatusRegression { .. }) => Ok(()),
            other => other,
        }
    }

    fn housekeeping(&self) -> Result<()> {
        let reaped = self.queue.reap_stale(self.config.max_job_age())?;
        if !reaped.is_empty() {
            warn!("Reaped {} stale jobs: {:?}", reaped.len(), reaped);
        }
        let swept = self.queue.sweep_aborted()?;
        if swept > 0 {
            info!("Removed {} aborted workspaces", swept);
        }
        Ok(())
    }
}
