//! Job drivers.
//!
//! A driver is the code for one job type: a fixed sequence of memoized steps
//! run against a [`JobContext`]. Drivers are re-entered from the top on every
//! invocation until they return [`Flow::Done`].

pub mod backup;
pub mod reindex;
pub mod restore;
pub mod retention;
pub mod snapshot;

use crate::budget::Flow;
use crate::config::Config;
use crate::destination::DestinationSet;
use crate::executor::JobContext;
use crate::job::{JobType, NewJob};
use crate::Result;

/// What a driver run needs besides the job itself.
pub struct DriverEnv<'a> {
    pub config: &'a Config,
    pub destinations: &'a DestinationSet,
}

#[derive(Debug, Clone, Default)]
pub struct Completion {
    /// Some of the work failed but the job still produced something useful.
    pub partial: bool,
    /// One line for the job log.
    pub summary: String,
    /// Enqueued once this job finishes successfully.
    pub follow_up: Option<NewJob>,
}

impl Completion {
    pub fn done(summary: impl Into<String>) -> Self {
        Self { summary: summary.into(), ..Default::default() }
    }
}

pub trait JobDriver: Sync {
    fn run(&self, ctx: &mut JobContext<'_>, env: &DriverEnv<'_>) -> Result<Flow<Completion>>;
}

static BACKUP: backup::BackupDriver = backup::BackupDriver;
static RESTORE: restore::RestoreDriver = restore::RestoreDriver;
static DOWNLOAD: restore::DownloadDriver = restore::DownloadDriver;
static REINDEX: reindex::ReindexDriver = reindex::ReindexDriver;
static RETENTION: retention::RetentionDriver = retention::RetentionDriver;

/// The driver for a job type. Export, extract and system jobs are accepted
/// by the queue but have no driver here.
pub fn driver_for(job_type: JobType) -> Option<&'static dyn JobDriver> {
    match job_type {
        JobType::Backup => Some(&BACKUP),
        JobType::Restore => Some(&RESTORE),
        JobType::Download => Some(&DOWNLOAD),
        JobType::Reindex => Some(&REINDEX),
        JobType::RetentionCleanup => Some(&RETENTION),
        JobType::Export | JobType::Extract | JobType::System => None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::destination::{DestinationRecord, RetryConfig};
    use std::path::Path;

    /// Local destinations `ids`, each under `base/{id}`, with fast retries.
    pub(crate) fn local_set(base: &Path, ids: &[&str]) -> Result<DestinationSet> {
        let mut records = Vec::new();
        for id in ids {
            let mount = base.join(id);
            std::fs::create_dir_all(&mount)?;
            let mut record = DestinationRecord::local(id, &mount);
            record.chunk_size = 16;
            records.push(record);
        }
        let retry = RetryConfig { initial_delay_ms: 1, max_delay_ms: 2, max_tries: 2 };
        DestinationSet::new(records, retry)
    }

    #[test]
    fn test_driver_lookup() {
        for job_type in JobType::ALL {
            let expected = !matches!(job_type, JobType::Export | JobType::Extract | JobType::System);
            assert_eq!(driver_for(job_type).is_some(), expected, "{}", job_type);
        }
    }
}
