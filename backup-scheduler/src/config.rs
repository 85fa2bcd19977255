use std::path::PathBuf;

/// Every minute, on the minute.
pub const DEFAULT_TICK_SCHEDULE: &str = "0 * * * * *";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    /// Engine configuration file. Engine defaults plus `BACKUP_*` variables
    /// when unset.
    pub engine_config: Option<PathBuf>,
    /// Six-field cron expression (seconds first) for worker ticks.
    pub tick_schedule: String,
    pub log_level: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars<F: Fn(&str) -> Option<String>>(var: F) -> Self {
        Self {
            port: var("PORT").and_then(|v| v.parse().ok()).unwrap_or(3000),
            engine_config: var("ENGINE_CONFIG").map(PathBuf::from),
            tick_schedule: var("TICK_SCHEDULE").unwrap_or_else(|| DEFAULT_TICK_SCHEDULE.into()),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".into()),
        }
    }
}
