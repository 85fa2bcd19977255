//! Job status codes.
//!
//! Statuses are ordered integers and only ever move forward:
//!
//! | code   | meaning                                    |
//! |--------|--------------------------------------------|
//! | 0      | pending                                    |
//! | 1      | started                                    |
//! | 2..99  | in progress, meaning defined per job type  |
//! | 100    | done                                       |
//! | 101    | partially done                             |
//! | 102    | failed                                     |
//! | 103    | aborted                                    |
//! | 104    | never finished (reaped as stale)           |

use super::JobType;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Status(pub i64);

impl Status {
    pub const PENDING: Status = Status(0);
    pub const STARTED: Status = Status(1);
    /// First terminal code.
    pub const DONE: Status = Status(100);
    pub const PARTIALLY_DONE: Status = Status(101);
    pub const FAILED: Status = Status(102);
    pub const ABORTED: Status = Status(103);
    pub const NEVER_FINISHED: Status = Status(104);

    pub fn code(self) -> i64 {
        self.0
    }

    pub fn is_pending(self) -> bool {
        self == Status::PENDING
    }

    pub fn is_terminal(self) -> bool {
        self >= Status::DONE
    }

    /// Terminal statuses that discard the job's workspace on entry.
    pub fn is_failure(self) -> bool {
        matches!(self, Status::FAILED | Status::NEVER_FINISHED)
    }

    pub fn is_in_progress(self) -> bool {
        self > Status::PENDING && self < Status::DONE
    }

    pub fn label(self, job_type: JobType) -> &'static str {
        match self {
            Status::PENDING => "pending",
            Status::STARTED => "started",
            Status::DONE => "done",
            Status::PARTIALLY_DONE => "partially-done",
            Status::FAILED => "failed",
            Status::ABORTED => "aborted",
            Status::NEVER_FINISHED => "never-finished",
            s if s.is_in_progress() => domain_label(job_type, s).unwrap_or("in-progress"),
            _ => "unknown",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Per-type vocabulary ──

pub mod backup {
    use super::Status;
    pub const PREPARING: Status = Status(10);
    pub const EXPORTING_DATABASE: Status = Status(20);
    pub const UPLOADING_FILES: Status = Status(30);
    pub const UPLOADING_DATABASE: Status = Status(40);
    pub const FINALIZING: Status = Status(50);
}

pub mod restore {
    use super::Status;
    pub const LISTING: Status = Status(10);
    pub const DOWNLOADING: Status = Status(20);
    pub const IMPORTING_DATABASE: Status = Status(30);
}

pub mod maintenance {
    use super::Status;
    pub const SCANNING: Status = Status(10);
    pub const UPDATING: Status = Status(20);
}

fn domain_label(job_type: JobType, status: Status) -> Option<&'static str> {
    let label = match (job_type, status) {
        (JobType::Backup, backup::PREPARING) => "preparing",
        (JobType::Backup, backup::EXPORTING_DATABASE) => "exporting-database",
        (JobType::Backup, backup::UPLOADING_FILES) => "uploading-files",
        (JobType::Backup, backup::UPLOADING_DATABASE) => "uploading-database",
        (JobType::Backup, backup::FINALIZING) => "finalizing",
        (JobType::Restore | JobType::Download, restore::LISTING) => "listing",
        (JobType::Restore | JobType::Download, restore::DOWNLOADING) => "downloading",
        (JobType::Restore, restore::IMPORTING_DATABASE) => "importing-database",
        (JobType::Reindex | JobType::RetentionCleanup, maintenance::SCANNING) => "scanning",
        (JobType::Reindex | JobType::RetentionCleanup, maintenance::UPDATING) => "updating",
        _ => return None,
    };
    Some(label)
}
