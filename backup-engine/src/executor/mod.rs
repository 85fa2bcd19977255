//! Job execution context.
//!
//! A [`JobContext`] is everything a driver touches while it runs: the job
//! record, the queue it persists to, the workspace, the step store and the
//! time budget. Drivers are written as straight-line code over
//! [`JobContext::run_step`] and [`JobContext::run_for_each`]; re-running a
//! driver after a suspension skips every step that already completed.

pub mod manifest;
pub mod memo;
pub mod worker;

use crate::budget::{Flow, TimeBudget};
use crate::job::{Job, LogLevel, Progress, Queue, Status};
use crate::proceed;
use crate::workspace::Workspace;
use crate::{EngineError, Result};
use memo::StepStore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// How many failed items a job tolerates before it fails as a whole.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemErrorPolicy {
    /// `None` tolerates any number.
    pub max_item_errors: Option<u32>,
}

/// Memoized result of one `run_for_each` item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ItemOutcome<T> {
    Done(T),
    Failed(String),
}

/// Results of [`JobContext::run_for_each`], in item order. Failed items are
/// `None`.
#[derive(Debug, Clone)]
pub struct ForEach<T> {
    pub results: Vec<Option<T>>,
    pub failed: usize,
}

impl<T> ForEach<T> {
    pub fn succeeded(&self) -> impl Iterator<Item = &T> {
        self.results.iter().flatten()
    }

    pub fn all_failed(&self) -> bool {
        !self.results.is_empty() && self.failed == self.results.len()
    }
}

pub struct JobContext<'q> {
    job: Job,
    queue: &'q Queue,
    workspace: Workspace,
    steps: StepStore,
    budget: TimeBudget,
    item_errors: ItemErrorPolicy,
}

impl<'q> JobContext<'q> {
    pub fn new(
        job: Job,
        queue: &'q Queue,
        workspace: Workspace,
        budget: TimeBudget,
        item_errors: ItemErrorPolicy,
    ) -> Result<Self> {
        let steps = StepStore::open(workspace.path())?;
        Ok(Self {
            job,
            queue,
            workspace,
            steps,
            budget,
            item_errors,
        })
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn queue(&self) -> &'q Queue {
        self.queue
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn budget(&self) -> &TimeBudget {
        &self.budget
    }

    /// Release the step store and hand the job record back.
    pub fn finish(self) -> Job {
        self.job
    }

    /// Safe point. Persists progress before telling the caller to stop.
    pub fn check_budget(&mut self) -> Result<Flow<()>> {
        let job_id = self.job.id;
        let flow = self.budget.check(|reason| {
            info!("Job {} yielding: {}", job_id, reason);
        });
        if let Flow::Yield(_) = flow {
            self.queue.save_progress(&self.job)?;
        }
        Ok(flow)
    }

    /// Run `step` once per job.
    ///
    /// A completed result is persisted under `key` and returned on every
    /// later call without running `step` again. A yield persists nothing.
    pub fn run_step<A, T, F>(&mut self, key: &str, args: A, step: F) -> Result<Flow<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut Self, A) -> Result<Flow<T>>,
    {
        if let Some(done) = self.steps.get::<T>(key)? {
            debug!("Step '{}' already done", key);
            return Ok(Flow::Done(done));
        }
        let value = proceed!(step(self, args)?);
        self.steps.put(key, &value)?;
        Ok(Flow::Done(value))
    }

    /// Run `step` for every item, memoizing each one under `key#index`.
    ///
    /// The budget is checked before each unfinished item. An item that fails
    /// is recorded as failed (and never retried by this job) unless the
    /// failure escalates, see [`JobContext::item_failed`].
    pub fn run_for_each<C, I, T, F>(&mut self, key: &str, items: &[I], cx: &mut C, mut step: F) -> Result<Flow<ForEach<T>>>
    where
        C: ?Sized,
        T: Serialize + DeserializeOwned,
        F: FnMut(&mut Self, &mut C, &I) -> Result<Flow<T>>,
    {
        let mut out = ForEach { results: Vec::with_capacity(items.len()), failed: 0 };

        for (idx, item) in items.iter().enumerate() {
            let item_key = format!("{}#{}", key, idx);
            if let Some(outcome) = self.steps.get::<ItemOutcome<T>>(&item_key)? {
                match outcome {
                    ItemOutcome::Done(v) => out.results.push(Some(v)),
                    ItemOutcome::Failed(_) => {
                        out.results.push(None);
                        out.failed += 1;
                    }
                }
                continue;
            }

            proceed!(self.check_budget()?);

            match step(self, cx, item) {
                Ok(Flow::Done(v)) => {
                    self.steps.put(&item_key, &ItemOutcome::Done(&v))?;
                    out.results.push(Some(v));
                }
                Ok(Flow::Yield(reason)) => return Ok(Flow::Yield(reason)),
                Err(e) => {
                    let message = e.to_string();
                    self.item_failed(&item_key, e)?;
                    self.steps.put(&item_key, &ItemOutcome::<T>::Failed(message))?;
                    out.results.push(None);
                    out.failed += 1;
                }
            }
        }

        Ok(Flow::Done(out))
    }

    /// Count a failed item against the job.
    ///
    /// Returns the error back when it must fail the whole job: fatal errors
    /// (bad credentials, read-only target) and exceeding the type's
    /// `max_item_errors`.
    pub fn item_failed(&mut self, item: &str, err: EngineError) -> Result<()> {
        warn!("Job {}: {} failed: {}", self.job.id, item, err);
        self.queue.record_error(&mut self.job, &format!("{}: {}", item, err))?;

        if err.is_fatal_for_job() {
            return Err(err);
        }
        if let Some(max) = self.item_errors.max_item_errors {
            if self.job.errors > max {
                return Err(EngineError::TooManyItemErrors(self.job.errors));
            }
        }
        Ok(())
    }

    /// Advance the status. Going back to an earlier phase (a second
    /// destination starting over at "uploading") keeps the later status.
    pub fn set_status(&mut self, status: Status) -> Result<()> {
        if status < self.job.status {
            debug!("Job {} stays at {} (asked for {})", self.job.id, self.job.status, status);
            return Ok(());
        }
        self.queue.update_status(&mut self.job, status)
    }

    /// Mutate progress and persist it.
    pub fn update_progress<F: FnOnce(&mut Progress)>(&mut self, f: F) -> Result<()> {
        f(&mut self.job.progress);
        self.queue.save_progress(&self.job)
    }

    /// Progress changes that are persisted at the next save or yield.
    pub fn progress_mut(&mut self) -> &mut Progress {
        &mut self.job.progress
    }

    pub fn save_progress(&self) -> Result<()> {
        self.queue.save_progress(&self.job)
    }

    pub fn log(&self, level: LogLevel, message: &str) -> Result<()> {
        match level {
            LogLevel::Info => info!("Job {}: {}", self.job.id, message),
            LogLevel::Warn => warn!("Job {}: {}", self.job.id, message),
            LogLevel::Error => tracing::error!("Job {}: {}", self.job.id, message),
        }
        self.queue.log(&self.job, level, message)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::budget::{ManualClock, YieldReason};
    use crate::job::{JobType, NewJob};
    use std::cell::Cell;
    use std::time::Duration;
    use tempfile::TempDir;

    pub(crate) struct Harness {
        pub dir: TempDir,
        pub queue: Queue,
        pub job_id: i64,
    }

    impl Harness {
        pub fn new(job_type: JobType) -> Result<Self> {
            Self::for_job(NewJob::bare(job_type, "target"))
        }

        /// A started job built from `new`.
        pub fn for_job(new: NewJob) -> Result<Self> {
            let dir = TempDir::new()?;
            let queue = Queue::open(&dir.path().join("queue.db"), &dir.path().join("data"))?;
            let mut job = queue.enqueue(new)?;
            queue.update_status(&mut job, Status::STARTED)?;
            Ok(Self { job_id: job.id, dir, queue })
        }

        pub fn context(&self, budget: TimeBudget, policy: ItemErrorPolicy) -> Result<JobContext<'_>> {
            let job = self.queue.get(self.job_id)?;
            let workspace = self.queue.workspace(&job);
            JobContext::new(job, &self.queue, workspace, budget, policy)
        }
    }

    fn counting_loop(ctx: &mut JobContext<'_>, clock: &ManualClock, iterations: &Cell<u32>) -> Result<Flow<u64>> {
        let start = ctx.job().progress.current;
        for i in start..10 {
            proceed!(ctx.check_budget()?);
            iterations.set(iterations.get() + 1);
            clock.advance(Duration::from_secs(1));
            ctx.update_progress(|p| p.current = i + 1)?;
        }
        Ok(Flow::Done(ctx.job().progress.current))
    }

    #[test]
    fn test_loop_resumes_where_budget_stopped_it() -> Result<()> {
        let h = Harness::new(JobType::Backup)?;
        let iterations = Cell::new(0);

        let clock = ManualClock::new();
        let mut ctx = h.context(TimeBudget::with_clock(Duration::from_secs(5), Box::new(clock.clone())), ItemErrorPolicy::default())?;
        let flow = ctx.run_step("count", (), |ctx, ()| counting_loop(ctx, &clock, &iterations))?;
        assert_eq!(flow, Flow::Yield(YieldReason::TimeBudget));
        assert_eq!(iterations.get(), 5);
        assert_eq!(h.queue.get(h.job_id)?.progress.current, 5);

        // Fresh invocation, fresh budget: continues at the sixth iteration.
        let clock = ManualClock::new();
        let mut ctx = h.context(TimeBudget::with_clock(Duration::from_secs(5), Box::new(clock.clone())), ItemErrorPolicy::default())?;
        let flow = ctx.run_step("count", (), |ctx, ()| counting_loop(ctx, &clock, &iterations))?;
        assert_eq!(flow, Flow::Done(10));
        assert_eq!(iterations.get(), 10);

        let mut ctx = h.context(TimeBudget::unlimited(), ItemErrorPolicy::default())?;
        let flow = ctx.run_step("count", (), |_, ()| -> Result<Flow<u64>> { panic!("memoized step ran again") })?;
        assert_eq!(flow, Flow::Done(10));
        Ok(())
    }

    #[test]
    fn test_step_is_memoized_across_contexts() -> Result<()> {
        let h = Harness::new(JobType::Backup)?;
        let runs = Cell::new(0);

        for _ in 0..3 {
            let mut ctx = h.context(TimeBudget::unlimited(), ItemErrorPolicy::default())?;
            let name = ctx.run_step("name", "prefix", |_, prefix| {
                runs.set(runs.get() + 1);
                Ok(Flow::Done(format!("{}-{}", prefix, runs.get())))
            })?;
            assert_eq!(name, Flow::Done("prefix-1".to_string()));
        }
        assert_eq!(runs.get(), 1);
        Ok(())
    }

    #[test]
    fn test_for_each_records_failures_and_skips_done_items() -> Result<()> {
        let h = Harness::new(JobType::Backup)?;
        let items = vec![1u32, 2, 3, 4];
        let mut seen = Vec::new();

        let mut ctx = h.context(TimeBudget::unlimited(), ItemErrorPolicy::default())?;
        let flow = ctx.run_for_each("items", &items, &mut seen, |_, seen, item| {
            seen.push(*item);
            if *item == 3 {
                Err(EngineError::Transport("down".into()))
            } else {
                Ok(Flow::Done(item * 10))
            }
        })?;
        let run = flow.done().expect("done");
        assert_eq!(run.results, vec![Some(10), Some(20), None, Some(40)]);
        assert_eq!(run.failed, 1);
        assert!(!run.all_failed());
        assert_eq!(h.queue.get(h.job_id)?.errors, 1);

        // Re-running replays every outcome, including the failure.
        let mut seen: Vec<u32> = Vec::new();
        let mut ctx = h.context(TimeBudget::unlimited(), ItemErrorPolicy::default())?;
        let run = ctx
            .run_for_each("items", &items, &mut seen, |_, _, _| -> Result<Flow<u32>> { panic!("item re-ran") })?
            .done()
            .expect("done");
        assert_eq!(run.failed, 1);
        assert_eq!(run.succeeded().copied().collect::<Vec<_>>(), vec![10, 20, 40]);
        Ok(())
    }

    #[test]
    fn test_for_each_yields_between_items() -> Result<()> {
        let h = Harness::new(JobType::Backup)?;
        let items = vec!["a", "b", "c"];
        let clock = ManualClock::new();

        let mut ctx = h.context(TimeBudget::with_clock(Duration::from_secs(2), Box::new(clock.clone())), ItemErrorPolicy::default())?;
        let flow = ctx.run_for_each("letters", &items, &mut (), |_, _, item| {
            clock.advance(Duration::from_secs(1));
            Ok(Flow::Done(item.to_uppercase()))
        })?;
        assert_eq!(flow.map(|r| r.results.len()), Flow::Yield(YieldReason::TimeBudget));

        let mut calls = 0;
        let mut ctx = h.context(TimeBudget::unlimited(), ItemErrorPolicy::default())?;
        let run = ctx
            .run_for_each("letters", &items, &mut calls, |_, calls, item| {
                *calls += 1;
                Ok(Flow::Done(item.to_uppercase()))
            })?
            .done()
            .expect("done");
        assert_eq!(calls, 1);
        assert_eq!(run.results, vec![Some("A".to_string()), Some("B".to_string()), Some("C".to_string())]);
        Ok(())
    }

    #[test]
    fn test_item_errors_escalate() -> Result<()> {
        let h = Harness::new(JobType::RetentionCleanup)?;
        let policy = ItemErrorPolicy { max_item_errors: Some(1) };
        let mut ctx = h.context(TimeBudget::unlimited(), policy)?;

        ctx.item_failed("first", EngineError::Transport("x".into()))?;
        let err = ctx.item_failed("second", EngineError::Transport("y".into())).unwrap_err();
        assert!(matches!(err, EngineError::TooManyItemErrors(2)));

        let mut ctx = h.context(TimeBudget::unlimited(), ItemErrorPolicy::default())?;
        let err = ctx.item_failed("auth", EngineError::Authentication("expired".into())).unwrap_err();
        assert!(matches!(err, EngineError::Authentication(_)));
        Ok(())
    }

    #[test]
    fn test_abort_marker_stops_loop() -> Result<()> {
        let h = Harness::new(JobType::Backup)?;
        let job = h.queue.get(h.job_id)?;
        let ws = h.queue.workspace(&job);
        ws.ensure()?;

        let budget = TimeBudget::unlimited().watch_abort_marker(&ws.abort_marker());
        let mut ctx = h.context(budget, ItemErrorPolicy::default())?;
        assert!(ctx.check_budget()?.is_done());
        ws.signal_abort()?;
        assert_eq!(ctx.check_budget()?, Flow::Yield(YieldReason::Aborted));
        Ok(())
    }

    #[test]
    fn test_status_never_moves_back() -> Result<()> {
        use crate::job::status::backup;
        let h = Harness::new(JobType::Backup)?;
        let mut ctx = h.context(TimeBudget::unlimited(), ItemErrorPolicy::default())?;
        ctx.set_status(backup::FINALIZING)?;
        ctx.set_status(backup::UPLOADING_FILES)?;
        assert_eq!(ctx.job().status, backup::FINALIZING);
        assert_eq!(h.queue.get(h.job_id)?.status, backup::FINALIZING);
        Ok(())
    }
}
