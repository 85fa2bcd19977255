//! Persistent job queue.
//!
//! Jobs live in the `jobs` table. Status updates are forward-only and are
//! enforced in SQL (`WHERE status <= new`) so two processes cannot move a
//! job backwards. Entering a failure status removes the job's workspace;
//! an aborted job's workspace is removed by the worker once it sees the
//! abort marker.

use super::{Job, JobType, NewJob, Progress, Status};
use crate::db::{self, DbPool};
use crate::workspace::Workspace;
use crate::{EngineError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "warn" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub id: i64,
    pub job_id: i64,
    pub logged_at: DateTime<Utc>,
    pub level: LogLevel,
    pub status: Status,
    pub message: String,
}

#[derive(Clone)]
pub struct Queue {
    pool: DbPool,
    data_dir: PathBuf,
    worker_id: Option<String>,
}

fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
    let job_type: String = row.get("job_type")?;
    let progress: String = row.get("progress")?;
    let item_data: String = row.get("item_data")?;
    let decode = |idx: &str, e: Box<dyn std::error::Error + Send + Sync>| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("column {}: {}", idx, e).into(),
        )
    };

    Ok(Job {
        id: row.get("id")?,
        unique_id: row.get("unique_id")?,
        job_type: job_type.parse::<JobType>().map_err(|e| decode("job_type", e.into()))?,
        target_id: row.get("target_id")?,
        status: Status(row.get("status")?),
        status_time: row.get("status_time")?,
        started_at: row.get("started_at")?,
        ended_at: row.get("ended_at")?,
        errors: row.get("errors")?,
        progress: serde_json::from_str::<Progress>(&progress).map_err(|e| decode("progress", e.into()))?,
        item_data: serde_json::from_str(&item_data).map_err(|e| decode("item_data", e.into()))?,
        created_at: row.get("created_at")?,
    })
}

fn row_to_log(row: &Row) -> rusqlite::Result<JobLogEntry> {
    let level: String = row.get("level")?;
    Ok(JobLogEntry {
        id: row.get("id")?,
        job_id: row.get("job_id")?,
        logged_at: row.get("logged_at")?,
        level: LogLevel::parse(&level),
        status: Status(row.get("status")?),
        message: row.get("message")?,
    })
}

fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Job>> {
    let job = conn
        .query_row("SELECT * FROM jobs WHERE id = ?", params![id], row_to_job)
        .optional()?;
    Ok(job)
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

impl Queue {
    /// Open the queue database, applying the schema.
    pub fn open(db_path: &Path, data_dir: &Path) -> Result<Self> {
        let pool = db::create_pool(db_path)?;
        db::migrate::migrate(&pool)?;
        std::fs::create_dir_all(data_dir)?;
        Ok(Self::new(pool, data_dir))
    }

    pub fn new(pool: DbPool, data_dir: &Path) -> Self {
        Self {
            pool,
            data_dir: data_dir.to_path_buf(),
            worker_id: None,
        }
    }

    /// Stamp jobs this queue starts with `worker_id`.
    pub fn with_worker_id(mut self, worker_id: &str) -> Self {
        self.worker_id = Some(worker_id.to_string());
        self
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn workspace(&self, job: &Job) -> Workspace {
        Workspace::new(&self.data_dir, &job.unique_id)
    }

    pub fn enqueue(&self, new: NewJob) -> Result<Job> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        let active: Option<i64> = tx
            .query_row(
                "SELECT id FROM jobs WHERE job_type = ? AND target_id = ? AND status < ?",
                params![new.job_type.as_str(), new.target_id, Status::DONE.0],
                |row| row.get(0),
            )
            .optional()?;
        if active.is_some() {
            return Err(duplicate(&new));
        }

        let now = Utc::now();
        let inserted = tx.execute(
            "INSERT INTO jobs (unique_id, job_type, target_id, status, status_time, progress, item_data, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                Uuid::new_v4().to_string(),
                new.job_type.as_str(),
                new.target_id,
                Status::PENDING.0,
                now,
                serde_json::to_string(&Progress::default())?,
                serde_json::to_string(&new.item_data)?,
                now,
            ],
        );
        match inserted {
            Err(e) if is_unique_violation(&e) => return Err(duplicate(&new)),
            other => other?,
        };
        let id = tx.last_insert_rowid();
        tx.commit()?;

        info!("Enqueued {} job {} for target '{}'", new.job_type, id, new.target_id);
        let job = self.get(id)?;
        self.log(&job, LogLevel::Info, "Job queued")?;
        Ok(job)
    }

    pub fn find(&self, id: i64) -> Result<Option<Job>> {
        let conn = self.pool.get()?;
        find_by_id(&conn, id)
    }

    pub fn get(&self, id: i64) -> Result<Job> {
        self.find(id)?.ok_or(EngineError::JobNotFound(id))
    }

    /// Most recent first.
    pub fn list(&self, limit: usize) -> Result<Vec<Job>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT * FROM jobs ORDER BY id DESC LIMIT ?")?;
        let rows = stmt.query_map(params![limit as i64], row_to_job)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn active(&self) -> Result<Vec<Job>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT * FROM jobs WHERE status < ? ORDER BY status ASC, id ASC")?;
        let rows = stmt.query_map(params![Status::DONE.0], row_to_job)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// The non-terminal job with the lowest status; ties go to the oldest.
    pub fn next_to_run(&self) -> Result<Option<Job>> {
        let conn = self.pool.get()?;
        let job = conn
            .query_row(
                "SELECT * FROM jobs WHERE status < ? ORDER BY status ASC, id ASC LIMIT 1",
                params![Status::DONE.0],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// Move `job` forward to `status`.
    ///
    /// Re-setting the current status only refreshes the status time. Leaving
    /// pending stamps `started_at`; entering a terminal status stamps
    /// `ended_at`, and a failure status also deletes the workspace.
    pub fn update_status(&self, job: &mut Job, status: Status) -> Result<()> {
        if status < job.status {
            return Err(EngineError::StatusRegression { job_id: job.id, from: job.status.0, to: status.0 });
        }

        let now = Utc::now();
        let started_at = job.started_at.or_else(|| (status > Status::PENDING).then_some(now));
        let ended_at = status.is_terminal().then_some(now);

        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE jobs SET status = ?1, status_time = ?2, started_at = ?3, ended_at = COALESCE(?4, ended_at),
                    worker_id = COALESCE(?5, worker_id)
             WHERE id = ?6 AND status <= ?1",
            params![status.0, now, started_at, ended_at, self.worker_id, job.id],
        )?;

        if changed == 0 {
            // Someone else (an abort, a reaper) got there first.
            let current = find_by_id(&conn, job.id)?.ok_or(EngineError::JobNotFound(job.id))?;
            let from = current.status.0;
            *job = current;
            return Err(EngineError::StatusRegression { job_id: job.id, from, to: status.0 });
        }
        drop(conn);

        let previous = job.status;
        job.status = status;
        job.status_time = now;
        job.started_at = started_at;
        job.ended_at = ended_at.or(job.ended_at);

        if previous != status {
            self.log(job, LogLevel::Info, &format!("Status: {}", status.label(job.job_type)))?;
        }
        if status.is_failure() {
            self.workspace(job).remove()?;
        }
        Ok(())
    }

    pub fn save_progress(&self, job: &Job) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE jobs SET progress = ? WHERE id = ?",
            params![serde_json::to_string(&job.progress)?, job.id],
        )?;
        Ok(())
    }

    /// Count one error against the job and log it.
    pub fn record_error(&self, job: &mut Job, message: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute("UPDATE jobs SET errors = errors + 1 WHERE id = ?", params![job.id])?;
        drop(conn);
        job.errors += 1;
        self.log(job, LogLevel::Error, message)
    }

    /// Ask a job to stop.
    ///
    /// A pending job goes straight to aborted. A started job gets an abort
    /// marker in its workspace, which the running (or next) worker notices at
    /// its next safe point; the status is set to aborted right away.
    pub fn abort(&self, id: i64) -> Result<Job> {
        let mut job = self.get(id)?;
        if job.is_terminal() {
            return Err(EngineError::Validation(format!(
                "job {} already finished ({})",
                id,
                job.status_label()
            )));
        }

        if !job.status.is_pending() {
            let workspace = self.workspace(&job);
            if !workspace.exists() {
                return Err(EngineError::NotStarted(id));
            }
            workspace.signal_abort()?;
        }

        self.update_status(&mut job, Status::ABORTED)?;
        warn!("Job {} aborted", id);
        Ok(job)
    }

    /// Reset a job to pending under a fresh workspace id.
    pub fn start_over(&self, id: i64) -> Result<Job> {
        let job = self.get(id)?;
        let old_workspace = self.workspace(&job);

        let mut progress = job.progress.clone();
        progress.current = 0;
        progress.clear_sub();

        let conn = self.pool.get()?;
        let updated = conn.execute(
            "UPDATE jobs SET unique_id = ?1, status = ?2, status_time = ?3, started_at = NULL, ended_at = NULL,
                    errors = 0, progress = ?4
             WHERE id = ?5",
            params![
                Uuid::new_v4().to_string(),
                Status::PENDING.0,
                Utc::now(),
                serde_json::to_string(&progress)?,
                id,
            ],
        );
        match updated {
            Err(e) if is_unique_violation(&e) => {
                return Err(EngineError::DuplicateJob {
                    job_type: job.job_type.to_string(),
                    target_id: job.target_id,
                })
            }
            other => other?,
        };
        drop(conn);

        old_workspace.clear_abort()?;
        old_workspace.remove()?;

        let job = self.get(id)?;
        self.log(&job, LogLevel::Info, "Job restarted from scratch")?;
        Ok(job)
    }

    /// Mark jobs that have been running longer than `max_age` as never-finished.
    pub fn reap_stale(&self, max_age: chrono::Duration) -> Result<Vec<i64>> {
        let cutoff = Utc::now() - max_age;
        let mut reaped = Vec::new();
        for mut job in self.active()? {
            let stale = job.status.is_in_progress() && job.started_at.is_some_and(|t| t < cutoff);
            if !stale {
                continue;
            }
            match self.update_status(&mut job, Status::NEVER_FINISHED) {
                Ok(()) => {
                    warn!("Job {} exceeded max age, marked never-finished", job.id);
                    self.log(&job, LogLevel::Error, "Job exceeded its maximum age")?;
                    reaped.push(job.id);
                }
                Err(EngineError::StatusRegression { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(reaped)
    }

    /// Remove workspaces of aborted jobs that no worker is going to resume.
    pub fn sweep_aborted(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT * FROM jobs WHERE status = ?")?;
        let aborted = stmt
            .query_map(params![Status::ABORTED.0], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut removed = 0;
        for job in aborted {
            let workspace = self.workspace(&job);
            if workspace.exists() {
                workspace.remove()?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn log(&self, job: &Job, level: LogLevel, message: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO job_log (job_id, logged_at, level, status, message) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![job.id, Utc::now(), level.as_str(), job.status.0, message],
        )?;
        Ok(())
    }

    /// Oldest first.
    pub fn logs(&self, job_id: i64, limit: usize) -> Result<Vec<JobLogEntry>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM (SELECT * FROM job_log WHERE job_id = ? ORDER BY id DESC LIMIT ?) ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![job_id, limit as i64], row_to_log)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn duplicate(new: &NewJob) -> EngineError {
    EngineError::DuplicateJob {
        job_type: new.job_type.to_string(),
        target_id: new.target_id.clone(),
    }
}
