use crate::db::connection::DbPool;
use crate::Result;
use rusqlite::Connection;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  unique_id TEXT NOT NULL,
  job_type TEXT NOT NULL,
  target_id TEXT NOT NULL,
  status INTEGER NOT NULL DEFAULT 0,
  status_time TEXT NOT NULL,
  started_at TEXT,
  ended_at TEXT,
  errors INTEGER NOT NULL DEFAULT 0,
  progress TEXT NOT NULL DEFAULT '{}',
  item_data TEXT NOT NULL DEFAULT '{}',
  created_at TEXT NOT NULL
);

-- At most one non-terminal job per (type, target).
CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_active_target ON jobs(job_type, target_id) WHERE status < 100;
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, id);

CREATE TABLE IF NOT EXISTS job_log (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
  logged_at TEXT NOT NULL,
  level TEXT NOT NULL CHECK(level IN ('info','warn','error')),
  status INTEGER NOT NULL,
  message TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_job_log_job_id ON job_log(job_id, id);

CREATE TABLE IF NOT EXISTS snapshots (
  destination_id TEXT NOT NULL,
  name TEXT NOT NULL,
  created_at TEXT NOT NULL,
  files INTEGER NOT NULL DEFAULT 0,
  bytes INTEGER NOT NULL DEFAULT 0,
  has_database INTEGER NOT NULL DEFAULT 0,
  job_id INTEGER,
  PRIMARY KEY (destination_id, name)
);
"#;

pub fn migrate(pool: &DbPool) -> Result<()> {
    tracing::debug!("[DB] Applying queue schema");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    // Idempotent migrations for existing databases
    if !has_column(&conn, "jobs", "worker_id")? {
        conn.execute_batch("ALTER TABLE jobs ADD COLUMN worker_id TEXT")?;
    }

    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns.iter().any(|c| c == column))
}
