//! Local index of snapshots known to exist on each destination.
//!
//! The destination's own `snapshot.json` markers are authoritative; this
//! table is a cache rebuilt by the reindex job.

use crate::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub destination_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub files: u64,
    pub bytes: u64,
    pub has_database: bool,
    #[serde(default)]
    pub job_id: Option<i64>,
}

fn row_to_snapshot(row: &Row) -> rusqlite::Result<Snapshot> {
    Ok(Snapshot {
        destination_id: row.get("destination_id")?,
        name: row.get("name")?,
        created_at: row.get("created_at")?,
        files: row.get::<_, i64>("files")? as u64,
        bytes: row.get::<_, i64>("bytes")? as u64,
        has_database: row.get("has_database")?,
        job_id: row.get("job_id")?,
    })
}

pub fn upsert(conn: &Connection, snapshot: &Snapshot) -> Result<()> {
    conn.execute(
        "INSERT INTO snapshots (destination_id, name, created_at, files, bytes, has_database, job_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(destination_id, name) DO UPDATE SET
           created_at = excluded.created_at, files = excluded.files, bytes = excluded.bytes,
           has_database = excluded.has_database, job_id = COALESCE(excluded.job_id, snapshots.job_id)",
        params![
            snapshot.destination_id,
            snapshot.name,
            snapshot.created_at,
            snapshot.files as i64,
            snapshot.bytes as i64,
            snapshot.has_database,
            snapshot.job_id,
        ],
    )?;
    Ok(())
}

/// Newest first.
pub fn find_by_destination(conn: &Connection, destination_id: &str) -> Result<Vec<Snapshot>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM snapshots WHERE destination_id = ? ORDER BY name DESC",
    )?;
    let rows = stmt.query_map(params![destination_id], row_to_snapshot)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn find_all(conn: &Connection) -> Result<Vec<Snapshot>> {
    let mut stmt = conn.prepare("SELECT * FROM snapshots ORDER BY destination_id, name DESC")?;
    let rows = stmt.query_map([], row_to_snapshot)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn delete(conn: &Connection, destination_id: &str, name: &str) -> Result<bool> {
    let n = conn.execute(
        "DELETE FROM snapshots WHERE destination_id = ? AND name = ?",
        params![destination_id, name],
    )?;
    Ok(n > 0)
}

/// Drop index rows for `destination_id` whose name is not in `keep`.
pub fn retain(conn: &Connection, destination_id: &str, keep: &[String]) -> Result<usize> {
    let mut removed = 0;
    for snapshot in find_by_destination(conn, destination_id)? {
        if !keep.contains(&snapshot.name) && delete(conn, destination_id, &snapshot.name)? {
            removed += 1;
        }
    }
    Ok(removed)
}
