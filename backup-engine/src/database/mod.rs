//! Resumable SQLite dump and import.
//!
//! The dump is one SQL statement per line. Rows are exported in batches and
//! every batch is appended to the dump as its own zstd frame, after which a
//! cursor file records how far the export got. Restarting truncates the dump
//! back to the last recorded frame boundary and carries on from the cursor.
//!
//! Import streams the decoded dump and applies statements in transactions,
//! keeping a count of applied statements so a resumed import skips them.

use crate::budget::Flow;
use crate::executor::JobContext;
use crate::{EngineError, Result};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const DUMP_FILE: &str = "database.sql.zst";

const EXPORT_CURSOR: &str = "database-export.cursor";
const IMPORT_CURSOR: &str = "database-import.cursor";

const BATCH_ROWS: u64 = 500;
const IMPORT_BATCH: u64 = 200;
const COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpSummary {
    pub tables: u64,
    pub rows: u64,
    pub bytes: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ExportCursor {
    /// Index into the sorted table list. `tables.len()` means all rows are
    /// out and only the trailing schema objects remain.
    table: usize,
    /// Rows of `table` already in the dump.
    rows: u64,
    rows_total: u64,
    /// Dump length at the last complete frame.
    dump_len: u64,
    done: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ImportCursor {
    applied: u64,
}

struct Table {
    name: String,
    sql: String,
}

impl Table {
    fn without_rowid(&self) -> bool {
        self.sql.to_ascii_uppercase().contains("WITHOUT ROWID")
    }
}

fn cursor_path(dump: &Path, name: &str) -> PathBuf {
    dump.with_file_name(name)
}

fn read_cursor<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

/// Write via a temp file and rename so a crash leaves the old cursor intact.
fn write_cursor<T: Serialize>(path: &Path, cursor: &T) -> Result<()> {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&serde_json::to_vec(cursor)?)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Render a text value as a single-line SQL literal.
fn quote_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for c in text.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\n' => out.push_str("'||char(10)||'"),
            '\r' => out.push_str("'||char(13)||'"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

fn sql_literal(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) if f.is_nan() => "NULL".to_string(),
        ValueRef::Real(f) if f.is_infinite() => if f > 0.0 { "9e999" } else { "-9e999" }.to_string(),
        ValueRef::Real(f) => format!("{:?}", f),
        ValueRef::Text(bytes) => quote_text(&String::from_utf8_lossy(bytes)),
        ValueRef::Blob(bytes) => {
            let mut out = String::with_capacity(bytes.len() * 2 + 3);
            out.push_str("X'");
            for b in bytes {
                let _ = write!(out, "{:02X}", b);
            }
            out.push('\'');
            out
        }
    }
}

fn single_line(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn list_tables(conn: &Connection) -> Result<Vec<Table>> {
    let mut stmt = conn.prepare(
        "SELECT name, sql FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND sql IS NOT NULL
         ORDER BY name",
    )?;
    let tables = stmt
        .query_map([], |row| Ok(Table { name: row.get(0)?, sql: row.get(1)? }))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(tables)
}

/// Indexes, views and triggers, emitted after all rows.
fn trailing_schema(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT type, name, sql FROM sqlite_master
         WHERE type IN ('index', 'view', 'trigger') AND sql IS NOT NULL AND name NOT LIKE 'sqlite_%'
         ORDER BY CASE type WHEN 'index' THEN 0 WHEN 'view' THEN 1 ELSE 2 END, name",
    )?;
    let rows = stmt.query_map([], |row| {
        let kind: String = row.get(0)?;
        let name: String = row.get(1)?;
        let sql: String = row.get(2)?;
        Ok(format!(
            "DROP {} IF EXISTS {};\n{};\n",
            kind.to_ascii_uppercase(),
            quote_ident(&name),
            single_line(&sql)
        ))
    })?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

/// Append `rows` of `table` starting at `offset` to `out`. Returns how many
/// rows were written.
fn dump_rows(conn: &Connection, table: &Table, offset: u64, out: &mut String) -> Result<u64> {
    let order = if table.without_rowid() { "" } else { " ORDER BY rowid" };
    let sql = format!("SELECT * FROM {}{} LIMIT ?1 OFFSET ?2", quote_ident(&table.name), order);
    let mut stmt = conn.prepare(&sql)?;
    let columns = stmt.column_count();
    let mut rows = stmt.query(rusqlite::params![BATCH_ROWS as i64, offset as i64])?;

    let mut count = 0;
    while let Some(row) = rows.next()? {
        out.push_str("INSERT OR REPLACE INTO ");
        out.push_str(&quote_ident(&table.name));
        out.push_str(" VALUES (");
        for i in 0..columns {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&sql_literal(row.get_ref(i)?));
        }
        out.push_str(");\n");
        count += 1;
    }
    Ok(count)
}

fn append_frame(dump: &Path, sql: &str) -> Result<u64> {
    let frame = zstd::encode_all(sql.as_bytes(), COMPRESSION_LEVEL).map_err(|e| EngineError::Compression(e.to_string()))?;
    let mut file = OpenOptions::new().create(true).append(true).open(dump)?;
    file.write_all(&frame)?;
    file.sync_data()?;
    Ok(file.metadata()?.len())
}

/// Export the SQLite database at `source` into the dump file `dump`.
pub fn export(ctx: &mut JobContext<'_>, source: &Path, dump: &Path) -> Result<Flow<DumpSummary>> {
    let conn = Connection::open_with_flags(source, OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX)?;
    let tables = list_tables(&conn)?;
    let cursor_file = cursor_path(dump, EXPORT_CURSOR);
    let mut cursor: ExportCursor = read_cursor(&cursor_file)?;

    // Drop a frame that was being written when the last run stopped.
    match fs::metadata(dump) {
        Ok(meta) if meta.len() > cursor.dump_len => {
            debug!("Truncating dump {} from {} to {} bytes", dump.display(), meta.len(), cursor.dump_len);
            OpenOptions::new().write(true).open(dump)?.set_len(cursor.dump_len)?;
        }
        Ok(meta) if meta.len() < cursor.dump_len => {
            return Err(EngineError::Validation(format!("dump {} is shorter than its cursor", dump.display())));
        }
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && cursor.dump_len == 0 => {}
        Err(e) => return Err(e.into()),
    }

    while !cursor.done {
        if let Flow::Yield(reason) = ctx.check_budget()? {
            return Ok(Flow::Yield(reason));
        }

        let mut sql = String::new();
        match tables.get(cursor.table) {
            Some(table) => {
                if cursor.rows == 0 {
                    ctx.update_progress(|p| p.start_sub(format!("Exporting {}", table.name), 0))?;
                    sql.push_str(&format!("DROP TABLE IF EXISTS {};\n", quote_ident(&table.name)));
                    sql.push_str(&single_line(&table.sql));
                    sql.push_str(";\n");
                }
                let written = dump_rows(&conn, table, cursor.rows, &mut sql)?;
                cursor.rows += written;
                cursor.rows_total += written;
                if written < BATCH_ROWS {
                    cursor.table += 1;
                    cursor.rows = 0;
                }
            }
            None => {
                for statement in trailing_schema(&conn)? {
                    sql.push_str(&statement);
                }
                cursor.done = true;
            }
        }

        if !sql.is_empty() {
            cursor.dump_len = append_frame(dump, &sql)?;
        }
        write_cursor(&cursor_file, &cursor)?;
        let rows = cursor.rows;
        ctx.update_progress(|p| p.sub_current = rows)?;
    }

    let summary = DumpSummary {
        tables: tables.len() as u64,
        rows: cursor.rows_total,
        bytes: cursor.dump_len,
    };
    info!(
        "Exported {} tables, {} rows into {} ({} bytes)",
        summary.tables,
        summary.rows,
        dump.display(),
        summary.bytes
    );
    ctx.update_progress(|p| p.clear_sub())?;
    Ok(Flow::Done(summary))
}

/// Apply the dump at `dump` to the SQLite database at `target`. Returns the
/// number of statements applied in total.
pub fn import(ctx: &mut JobContext<'_>, dump: &Path, target: &Path) -> Result<Flow<u64>> {
    let cursor_file = cursor_path(dump, IMPORT_CURSOR);
    let mut cursor: ImportCursor = read_cursor(&cursor_file)?;

    let conn = Connection::open(target)?;
    conn.execute_batch("PRAGMA foreign_keys = OFF;")?;

    let decoder = zstd::stream::read::Decoder::new(File::open(dump)?).map_err(|e| EngineError::Compression(e.to_string()))?;
    let mut statements = BufReader::new(decoder).lines().filter(|line| !matches!(line, Ok(l) if l.trim().is_empty()));

    for _ in 0..cursor.applied {
        if statements.next().transpose()?.is_none() {
            return Err(EngineError::Validation(format!(
                "dump {} has fewer statements than already applied ({})",
                dump.display(),
                cursor.applied
            )));
        }
    }
    if cursor.applied > 0 {
        debug!("Resuming import after {} statements", cursor.applied);
    }
    ctx.update_progress(|p| {
        p.start_sub("Importing database", 0);
        p.sub_current = cursor.applied;
    })?;

    let mut in_batch = 0u64;
    conn.execute_batch("BEGIN")?;
    for statement in statements {
        let statement = statement?;

        if let Flow::Yield(reason) = ctx.check_budget()? {
            conn.execute_batch("COMMIT")?;
            write_cursor(&cursor_file, &cursor)?;
            let applied = cursor.applied;
            ctx.update_progress(|p| p.sub_current = applied)?;
            return Ok(Flow::Yield(reason));
        }

        conn.execute_batch(&statement)?;
        cursor.applied += 1;
        in_batch += 1;

        if in_batch == IMPORT_BATCH {
            conn.execute_batch("COMMIT")?;
            write_cursor(&cursor_file, &cursor)?;
            let applied = cursor.applied;
            ctx.update_progress(|p| p.sub_current = applied)?;
            conn.execute_batch("BEGIN")?;
            in_batch = 0;
        }
    }
    conn.execute_batch("COMMIT")?;
    write_cursor(&cursor_file, &cursor)?;

    info!("Imported {} statements into {}", cursor.applied, target.display());
    ctx.update_progress(|p| p.clear_sub())?;
    Ok(Flow::Done(cursor.applied))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{Clock, ManualClock, TimeBudget};
    use crate::executor::tests::Harness;
    use crate::executor::ItemErrorPolicy;
    use crate::job::JobType;
    use std::time::Duration;

    struct TickClock(ManualClock);

    impl Clock for TickClock {
        fn elapsed(&self) -> Duration {
            let now = self.0.elapsed();
            self.0.advance(Duration::from_secs(1));
            now
        }
    }

    fn ticking(ticks: u64) -> TimeBudget {
        TimeBudget::with_clock(Duration::from_secs(ticks), Box::new(TickClock(ManualClock::new())))
    }

    fn seed(path: &Path) -> Result<()> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE posts (id INTEGER PRIMARY KEY, title TEXT NOT NULL, body TEXT, score REAL, raw BLOB);
             CREATE INDEX idx_posts_title ON posts(title);
             CREATE TABLE tags (name TEXT PRIMARY KEY, post_id INTEGER) WITHOUT ROWID;",
        )?;
        let tx = conn.unchecked_transaction()?;
        for i in 0..1203i64 {
            tx.execute(
                "INSERT INTO posts (id, title, body, score, raw) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    i,
                    format!("post {}", i),
                    if i % 3 == 0 { None } else { Some(format!("it's line one\nline two of {}", i)) },
                    i as f64 / 4.0,
                    vec![0u8, 1, 0xFF, (i % 256) as u8],
                ],
            )?;
        }
        tx.execute("INSERT INTO tags VALUES ('rust', 1), ('sql', 2)", [])?;
        tx.commit()?;
        Ok(())
    }

    fn fingerprint(path: &Path) -> Result<Vec<String>> {
        let conn = Connection::open(path)?;
        let mut stmt = conn.prepare("SELECT id, title, body, score, hex(raw) FROM posts ORDER BY id")?;
        let mut out = stmt
            .query_map([], |row| {
                Ok(format!(
                    "{}|{}|{:?}|{}|{}",
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, String>(4)?
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut stmt = conn.prepare("SELECT name, post_id FROM tags ORDER BY name")?;
        out.extend(
            stmt.query_map([], |row| Ok(format!("{}={}", row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?,
        );
        Ok(out)
    }

    #[test]
    fn test_quote_text() {
        assert_eq!(quote_text("plain"), "'plain'");
        assert_eq!(quote_text("it's"), "'it''s'");
        assert_eq!(quote_text("a\nb"), "'a'||char(10)||'b'");
    }

    #[test]
    fn test_sql_literal() {
        assert_eq!(sql_literal(ValueRef::Null), "NULL");
        assert_eq!(sql_literal(ValueRef::Integer(-4)), "-4");
        assert_eq!(sql_literal(ValueRef::Real(1.0)), "1.0");
        assert_eq!(sql_literal(ValueRef::Blob(&[0x00, 0xAB])), "X'00AB'");
    }

    #[test]
    fn test_export_and_import_across_invocations() -> Result<()> {
        let h = Harness::new(JobType::Backup)?;
        let source = h.dir.path().join("site.db");
        seed(&source)?;
        let dump = h.dir.path().join(DUMP_FILE);

        let mut rounds = 0;
        let summary = loop {
            rounds += 1;
            assert!(rounds < 20, "export never finished");
            let mut ctx = h.context(ticking(2), ItemErrorPolicy::default())?;
            if let Flow::Done(summary) = export(&mut ctx, &source, &dump)? {
                break summary;
            }
        };
        assert!(rounds > 1);
        assert_eq!(summary.tables, 2);
        assert_eq!(summary.rows, 1205);
        assert_eq!(summary.bytes, fs::metadata(&dump)?.len());

        let target = h.dir.path().join("restored.db");
        let mut rounds = 0;
        let applied = loop {
            rounds += 1;
            assert!(rounds < 5000, "import never finished");
            let mut ctx = h.context(ticking(300), ItemErrorPolicy::default())?;
            if let Flow::Done(applied) = import(&mut ctx, &dump, &target)? {
                break applied;
            }
        };
        assert!(rounds > 1);
        // Two tables (drop + create), 1205 rows, one index (drop + create).
        assert_eq!(applied, 4 + 1205 + 2);
        assert_eq!(fingerprint(&target)?, fingerprint(&source)?);
        Ok(())
    }

    #[test]
    fn test_export_drops_torn_frame() -> Result<()> {
        let h = Harness::new(JobType::Backup)?;
        let source = h.dir.path().join("site.db");
        seed(&source)?;
        let dump = h.dir.path().join(DUMP_FILE);

        let mut ctx = h.context(ticking(2), ItemErrorPolicy::default())?;
        assert!(!export(&mut ctx, &source, &dump)?.is_done());

        // Half a frame from a run that died mid-write.
        let mut file = OpenOptions::new().append(true).open(&dump)?;
        file.write_all(&[0x28, 0xB5, 0x2F, 0xFD, 0x00])?;
        drop(file);

        let mut ctx = h.context(TimeBudget::unlimited(), ItemErrorPolicy::default())?;
        let summary = export(&mut ctx, &source, &dump)?.done().expect("export done");
        assert_eq!(summary.rows, 1205);

        let target = h.dir.path().join("restored.db");
        let mut ctx = h.context(TimeBudget::unlimited(), ItemErrorPolicy::default())?;
        assert!(import(&mut ctx, &dump, &target)?.is_done());
        assert_eq!(fingerprint(&target)?, fingerprint(&source)?);
        Ok(())
    }
}
