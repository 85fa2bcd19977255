//! Job model: type, progress and the persisted record.

pub mod queue;
pub mod status;

pub use queue::{JobLogEntry, LogLevel, Queue};
pub use status::Status;

use crate::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    Backup,
    Restore,
    Download,
    Reindex,
    RetentionCleanup,
    Export,
    Extract,
    System,
}

impl JobType {
    pub const ALL: [JobType; 8] = [
        JobType::Backup,
        JobType::Restore,
        JobType::Download,
        JobType::Reindex,
        JobType::RetentionCleanup,
        JobType::Export,
        JobType::Extract,
        JobType::System,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Backup => "backup",
            JobType::Restore => "restore",
            JobType::Download => "download",
            JobType::Reindex => "reindex",
            JobType::RetentionCleanup => "retention-cleanup",
            JobType::Export => "export",
            JobType::Extract => "extract",
            JobType::System => "system",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown job type '{}'", s))
    }
}

/// Two-level progress: the step (files, bytes) and the item inside it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Progress {
    pub message: String,
    pub current: u64,
    pub total: u64,
    pub sub_message: String,
    pub sub_current: u64,
    pub sub_total: u64,
}

impl Progress {
    pub fn start_step(&mut self, message: impl Into<String>, total: u64) {
        self.message = message.into();
        self.current = 0;
        self.total = total;
        self.clear_sub();
    }

    pub fn start_sub(&mut self, message: impl Into<String>, total: u64) {
        self.sub_message = message.into();
        self.sub_current = 0;
        self.sub_total = total;
    }

    pub fn clear_sub(&mut self) {
        self.sub_message.clear();
        self.sub_current = 0;
        self.sub_total = 0;
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.current.min(self.total) as f64 / self.total as f64) * 100.0
        }
    }
}

// ── Job ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    /// Names the workspace; replaced on start-over.
    pub unique_id: String,
    pub job_type: JobType,
    pub target_id: String,
    pub status: Status,
    pub status_time: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub errors: u32,
    pub progress: Progress,
    pub item_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn status_label(&self) -> &'static str {
        self.status.label(self.job_type)
    }

    /// Decode the type-specific request payload.
    pub fn item<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.item_data.clone()).map_err(|e| {
            EngineError::Validation(format!("job {} has invalid {} data: {}", self.id, self.job_type, e))
        })
    }
}

/// A request to enqueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: JobType,
    pub target_id: String,
    #[serde(default = "empty_object")]
    pub item_data: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

impl NewJob {
    pub fn new<T: Serialize>(job_type: JobType, target_id: impl Into<String>, item: &T) -> Result<Self> {
        Ok(Self {
            job_type,
            target_id: target_id.into(),
            item_data: serde_json::to_value(item)?,
        })
    }

    pub fn bare(job_type: JobType, target_id: impl Into<String>) -> Self {
        Self {
            job_type,
            target_id: target_id.into(),
            item_data: empty_object(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_type_round_trips_through_str() {
        for t in JobType::ALL {
            assert_eq!(t.as_str().parse::<JobType>(), Ok(t));
            assert_eq!(serde_json::to_value(t).unwrap(), serde_json::json!(t.as_str()));
        }
        assert!("bogus".parse::<JobType>().is_err());
    }

    #[test]
    fn test_progress_steps() {
        let mut p = Progress::default();
        p.start_sub("big.iso", 10);
        p.sub_current = 4;
        p.start_step("Uploading files", 200);
        assert_eq!(p.sub_total, 0);
        p.current = 50;
        assert!((p.percent() - 25.0).abs() < f64::EPSILON);

        let partial: Progress = serde_json::from_str(r#"{"message":"x"}"#).unwrap();
        assert_eq!(partial.message, "x");
        assert_eq!(partial.total, 0);
    }
}
