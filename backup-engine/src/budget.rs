//! Cooperative time budget for one worker invocation.
//!
//! Long operations call [`TimeBudget::check`] at safe points (between files,
//! between chunks, between dump batches). When the budget is spent, or the
//! job's abort marker shows up, the check returns [`Flow::Yield`] and the
//! caller unwinds with its progress already persisted. The next invocation
//! resumes from the memoized steps and the manifest.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why a run stopped before finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum YieldReason {
    /// The invocation's time budget ran out.
    TimeBudget,
    /// Someone asked the job to abort.
    Aborted,
}

impl std::fmt::Display for YieldReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            YieldReason::TimeBudget => write!(f, "time budget exhausted"),
            YieldReason::Aborted => write!(f, "abort requested"),
        }
    }
}

/// Outcome of a resumable operation.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow<T> {
    Done(T),
    Yield(YieldReason),
}

impl<T> Flow<T> {
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Flow<U> {
        match self {
            Flow::Done(v) => Flow::Done(f(v)),
            Flow::Yield(r) => Flow::Yield(r),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Flow::Done(_))
    }

    pub fn done(self) -> Option<T> {
        match self {
            Flow::Done(v) => Some(v),
            Flow::Yield(_) => None,
        }
    }
}

/// Unwrap a [`Flow::Done`] or return the yield to the caller.
///
/// ```ignore
/// let summary = proceed!(ctx.run_step("manifest", args, build_manifest)?);
/// ```
#[macro_export]
macro_rules! proceed {
    ($flow:expr) => {
        match $flow {
            $crate::budget::Flow::Done(v) => v,
            $crate::budget::Flow::Yield(reason) => {
                return Ok($crate::budget::Flow::Yield(reason));
            }
        }
    };
}

/// Source of elapsed time for a budget.
pub trait Clock: Send + Sync {
    fn elapsed(&self) -> Duration;
}

/// Wall clock anchored at construction.
pub struct MonotonicClock {
    started: Instant,
}

impl MonotonicClock {
    pub fn start() -> Self {
        Self { started: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Clone, Default)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn elapsed(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

pub struct TimeBudget {
    /// Zero means unlimited.
    limit: Duration,
    clock: Box<dyn Clock>,
    abort_marker: Option<PathBuf>,
}

impl TimeBudget {
    pub fn new(limit: Duration) -> Self {
        Self::with_clock(limit, Box::new(MonotonicClock::start()))
    }

    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn with_clock(limit: Duration, clock: Box<dyn Clock>) -> Self {
        Self {
            limit,
            clock,
            abort_marker: None,
        }
    }

    /// Also yield once `marker` exists on disk.
    pub fn watch_abort_marker(mut self, marker: &Path) -> Self {
        self.abort_marker = Some(marker.to_path_buf());
        self
    }

    pub fn limit(&self) -> Option<Duration> {
        (!self.limit.is_zero()).then_some(self.limit)
    }

    pub fn elapsed(&self) -> Duration {
        self.clock.elapsed()
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.limit().map(|limit| limit.saturating_sub(self.elapsed()))
    }

    pub fn is_exhausted(&self) -> bool {
        match self.limit() {
            Some(limit) => self.elapsed() >= limit,
            None => false,
        }
    }

    pub fn abort_requested(&self) -> bool {
        self.abort_marker.as_deref().is_some_and(Path::exists)
    }

    /// Safe-point check. `on_yield` runs only when the caller must stop.
    pub fn check<F: FnOnce(YieldReason)>(&self, on_yield: F) -> Flow<()> {
        let reason = if self.abort_requested() {
            YieldReason::Aborted
        } else if self.is_exhausted() {
            YieldReason::TimeBudget
        } else {
            return Flow::Done(());
        };
        on_yield(reason);
        Flow::Yield(reason)
    }
}
