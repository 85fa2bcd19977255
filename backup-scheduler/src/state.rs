use crate::config::AppConfig;
use crate::error::AppError;
use backup_engine::job::Queue;
use backup_engine::Worker;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct AppState {
    pub config: AppConfig,
    pub worker: Arc<Worker>,
    /// Set while a worker invocation is in flight. Ticks and manual runs
    /// never overlap.
    busy: Arc<AtomicBool>,
}

/// Clears the busy flag when the invocation ends, panics included.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl AppState {
    pub fn new(config: AppConfig, worker: Worker) -> Self {
        Self {
            config,
            worker: Arc::new(worker),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn queue(&self) -> Queue {
        self.worker.queue().clone()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Run `f` against the worker on the blocking pool, unless another
    /// invocation is already running, in which case `None`.
    pub async fn run_exclusive<T, F>(&self, f: F) -> Result<Option<T>, AppError>
    where
        T: Send + 'static,
        F: FnOnce(&Worker) -> backup_engine::Result<T> + Send + 'static,
    {
        if self.busy.swap(true, Ordering::AcqRel) {
            return Ok(None);
        }
        let guard = BusyGuard(self.busy.clone());
        let worker = self.worker.clone();
        let out = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            f(&worker)
        })
        .await??;
        Ok(Some(out))
    }

    /// Queue operations are quick but still synchronous SQLite.
    pub async fn with_queue<T, F>(&self, f: F) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: FnOnce(&Queue) -> backup_engine::Result<T> + Send + 'static,
    {
        let queue = self.queue();
        Ok(tokio::task::spawn_blocking(move || f(&queue)).await??)
    }
}
