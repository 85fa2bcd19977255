//! Configuration management for the backup worker.
//!
//! Loads configuration from a TOML file with environment variable overrides.

use crate::destination::{DestinationRecord, DestinationSet, RetryConfig};
use crate::executor::ItemErrorPolicy;
use crate::fs::walker::{default_excludes, WalkOptions};
use crate::job::JobType;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub destinations: Vec<DestinationRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Stamped on the jobs this worker runs
    #[serde(default = "default_worker_id")]
    pub id: String,

    /// Job workspaces live under here
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Queue database (default: `{data_dir}/queue.db`)
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// Seconds one invocation may run before suspending (0 = unlimited)
    #[serde(default = "default_time_budget_secs")]
    pub time_budget_secs: u64,

    /// Started jobs older than this are marked never-finished
    #[serde(default = "default_max_job_age_hours")]
    pub max_job_age_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Also write logs to this file
    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Site directory to back up and restore into
    #[serde(default = "default_source_root")]
    pub root: PathBuf,

    #[serde(default = "default_excludes")]
    pub exclude: Vec<String>,

    #[serde(default)]
    pub follow_links: bool,

    /// SQLite database dumped alongside the files
    #[serde(default)]
    pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Failed items tolerated per job type; absent means unlimited
    #[serde(default = "default_max_item_errors")]
    pub max_item_errors: HashMap<JobType, u32>,
}

// Default values
fn default_worker_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "backup-worker-01".to_string())
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/backup-engine")
}

fn default_time_budget_secs() -> u64 {
    50
}

fn default_max_job_age_hours() -> u64 {
    24
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_source_root() -> PathBuf {
    PathBuf::from("/var/www")
}

fn default_max_item_errors() -> HashMap<JobType, u32> {
    HashMap::from([(JobType::RetentionCleanup, 0)])
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            id: default_worker_id(),
            data_dir: default_data_dir(),
            db_path: None,
            time_budget_secs: default_time_budget_secs(),
            max_job_age_hours: default_max_job_age_hours(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: default_log_level(), file: None }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            root: default_source_root(),
            exclude: default_excludes(),
            follow_links: false,
            database: None,
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self { max_item_errors: default_max_item_errors() }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            retry: RetryConfig::default(),
            log: LogConfig::default(),
            source: SourceConfig::default(),
            policy: PolicyConfig::default(),
            destinations: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply `BACKUP_*`
    /// environment overrides and validate.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// [`Config::from_file`] when a path is given, otherwise the defaults
    /// with environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        let mut config = Config::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env<F: Fn(&str) -> Option<String>>(&mut self, var: F) -> Result<()> {
        if let Some(id) = var("BACKUP_WORKER_ID") {
            self.worker.id = id;
        }
        if let Some(dir) = var("BACKUP_DATA_DIR") {
            self.worker.data_dir = PathBuf::from(dir);
        }
        if let Some(secs) = var("BACKUP_TIME_BUDGET_SECS") {
            self.worker.time_budget_secs = secs
                .parse()
                .map_err(|_| EngineError::Config(format!("BACKUP_TIME_BUDGET_SECS is not a number: {}", secs)))?;
        }
        if let Some(level) = var("BACKUP_LOG_LEVEL") {
            self.log.level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker.id.trim().is_empty() {
            return Err(EngineError::Config("worker.id must not be empty".into()));
        }
        if self.retry.max_tries == 0 {
            return Err(EngineError::Config("retry.max_tries must be at least 1".into()));
        }
        self.destination_set().map(|_| ())
    }

    pub fn db_path(&self) -> PathBuf {
        self.worker
            .db_path
            .clone()
            .unwrap_or_else(|| self.worker.data_dir.join("queue.db"))
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_secs(self.worker.time_budget_secs)
    }

    pub fn max_job_age(&self) -> chrono::Duration {
        chrono::Duration::hours(self.worker.max_job_age_hours as i64)
    }

    pub fn destination_set(&self) -> Result<DestinationSet> {
        DestinationSet::new(self.destinations.clone(), self.retry.clone())
    }

    pub fn walk_options(&self) -> WalkOptions {
        WalkOptions {
            follow_links: self.source.follow_links,
            max_depth: None,
            exclude_patterns: self.source.exclude.clone(),
        }
    }

    pub fn item_policy(&self, job_type: JobType) -> ItemErrorPolicy {
        ItemErrorPolicy {
            max_item_errors: self.policy.max_item_errors.get(&job_type).copied(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
[worker]
id = "worker-a"
data_dir = "/tmp/backup-data"
time_budget_secs = 25

[retry]
max_tries = 3

[source]
root = "/srv/site"
exclude = ["cache", "*.log"]
database = "/srv/site/site.db"

[policy.max_item_errors]
backup = 10
retention-cleanup = 2

[[destinations]]
id = "nas"
name = "NAS"
type = "local"
path = "/mnt/nas"
root = "site-backups"
is_default = true
"#;

    #[test]
    fn test_load_sample() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, SAMPLE)?;

        let config = Config::from_file(&path)?;
        assert_eq!(config.worker.data_dir, PathBuf::from("/tmp/backup-data"));
        assert_eq!(config.worker.max_job_age_hours, 24);
        assert_eq!(config.db_path(), PathBuf::from("/tmp/backup-data/queue.db"));
        assert_eq!(config.retry.max_tries, 3);
        assert_eq!(config.source.exclude, vec!["cache", "*.log"]);
        assert_eq!(config.item_policy(JobType::Backup).max_item_errors, Some(10));
        assert_eq!(config.item_policy(JobType::Restore).max_item_errors, None);
        assert_eq!(config.destinations.len(), 1);
        assert_eq!(config.destination_set()?.default_record().map(|r| r.id.as_str()), Some("nas"));
        Ok(())
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.time_budget(), Duration::from_secs(50));
        assert_eq!(config.item_policy(JobType::RetentionCleanup).max_item_errors, Some(0));
        assert_eq!(config.item_policy(JobType::Backup).max_item_errors, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() -> Result<()> {
        let mut config = Config::default();
        let vars = HashMap::from([("BACKUP_DATA_DIR", "/data"), ("BACKUP_TIME_BUDGET_SECS", "0")]);
        config.apply_env(|k| vars.get(k).map(|v| v.to_string()))?;
        assert_eq!(config.worker.data_dir, PathBuf::from("/data"));
        assert_eq!(config.time_budget(), Duration::ZERO);

        let bad = HashMap::from([("BACKUP_TIME_BUDGET_SECS", "soon")]);
        assert!(config.apply_env(|k| bad.get(k).map(|v| v.to_string())).is_err());
        Ok(())
    }

    #[test]
    fn test_two_defaults_rejected() {
        let mut config = Config::default();
        let mut a = DestinationRecord::local("a", Path::new("/mnt/a"));
        a.is_default = true;
        let mut b = DestinationRecord::local("b", Path::new("/mnt/b"));
        b.is_default = true;
        config.destinations = vec![a, b];
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }
}
