//! Backup: the site's files, and its database when one is configured, to one
//! or more destinations.

use super::snapshot::{self, SnapshotMarker, NAME_FORMAT};
use super::{Completion, DriverEnv, JobDriver};
use crate::budget::Flow;
use crate::database::{self, DumpSummary, DUMP_FILE};
use crate::db::snapshots::{self, Snapshot};
use crate::destination::Destination;
use crate::executor::{manifest, JobContext};
use crate::job::status::backup;
use crate::job::{LogLevel, NewJob};
use crate::proceed;
use crate::transfer::{self, progress::Throughput};
use crate::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupItem {
    /// Snapshot name; generated from the start time when absent.
    #[serde(default)]
    pub snapshot: Option<String>,
    /// Destination ids; every enabled, writable destination when empty.
    #[serde(default)]
    pub destinations: Vec<String>,
    #[serde(default)]
    pub manual: bool,
    #[serde(default)]
    pub after_job_done: Option<NewJob>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Plan {
    name: String,
    created_at: DateTime<Utc>,
    /// Fixed when the job starts so `destination#idx` keeps naming the
    /// same destination across invocations.
    destinations: Vec<String>,
}

fn check_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.starts_with('.')
        || name.chars().any(|c| c == '/' || c == '\\' || c.is_control());
    if bad {
        return Err(EngineError::Validation(format!("invalid snapshot name {:?}", name)));
    }
    Ok(())
}

pub struct BackupDriver;

struct Run<'e> {
    env: &'e DriverEnv<'e>,
    plan: Plan,
    manual: bool,
    dump: Option<(PathBuf, DumpSummary)>,
    meter: Throughput,
}

impl JobDriver for BackupDriver {
    fn run(&self, ctx: &mut JobContext<'_>, env: &DriverEnv<'_>) -> Result<Flow<Completion>> {
        let item: BackupItem = ctx.job().item()?;
        ctx.set_status(backup::PREPARING)?;

        let plan = proceed!(ctx.run_step("plan", item.snapshot.clone(), |_, requested| {
            let created_at = Utc::now();
            let name = match requested {
                Some(name) => {
                    check_name(&name)?;
                    name
                }
                None => created_at.format(NAME_FORMAT).to_string(),
            };
            let destinations = if item.destinations.is_empty() {
                env.destinations.backup_targets()
            } else {
                item.destinations.clone()
            };
            if destinations.is_empty() {
                return Err(EngineError::Validation("no enabled, writable destination to back up to".into()));
            }
            Ok(Flow::Done(Plan { name, created_at, destinations }))
        })?);
        let targets = plan.destinations.clone();

        let dump = match &env.config.source.database {
            Some(db) => {
                ctx.set_status(backup::EXPORTING_DATABASE)?;
                let path = ctx.workspace().file(DUMP_FILE);
                let summary = proceed!(ctx.run_step("database-export", db.as_path(), |ctx, db| {
                    ctx.update_progress(|p| p.start_step("Exporting database", 0))?;
                    database::export(ctx, db, &path)
                })?);
                Some((path, summary))
            }
            None => None,
        };

        ctx.set_status(backup::UPLOADING_FILES)?;
        let mut run = Run { env, plan, manual: item.manual, dump, meter: Throughput::start() };
        let stored = proceed!(ctx.run_for_each("destination", &targets, &mut run, back_up_to)?);
        if stored.all_failed() {
            return Err(EngineError::AllDestinationsFailed(targets.len()));
        }

        let summary = format!(
            "Snapshot {} stored on {} of {} destinations ({} this run)",
            run.plan.name,
            stored.succeeded().count(),
            targets.len(),
            run.meter.summary()
        );
        Ok(Flow::Done(Completion {
            partial: stored.failed > 0,
            summary,
            follow_up: item.after_job_done,
        }))
    }
}

fn back_up_to(ctx: &mut JobContext<'_>, run: &mut Run<'_>, id: &String) -> Result<Flow<Snapshot>> {
    let mut dest = run.env.destinations.open(id)?;
    dest.connect()?;
    let result = upload_snapshot(ctx, run, dest.as_mut());
    dest.disconnect();
    result
}

fn upload_snapshot(ctx: &mut JobContext<'_>, run: &mut Run<'_>, dest: &mut dyn Destination) -> Result<Flow<Snapshot>> {
    let id = dest.record().id.clone();
    let display = dest.record().display_name().to_string();
    let name = run.plan.name.clone();

    proceed!(ctx.run_step(&format!("{}:register", id), &mut *dest, |_, dest| {
        dest.register().map(Flow::Done)
    })?);

    let root = run.env.config.source.root.clone();
    let options = run.env.config.walk_options();
    let manifest_path = ctx.workspace().file(&format!("{}.manifest", id));
    let listing = proceed!(ctx.run_step(&format!("{}:manifest", id), (), |ctx, ()| {
        ctx.update_progress(|p| p.start_step(format!("Scanning {}", root.display()), 0))?;
        let summary = manifest::build(&manifest_path, &root, &options)?;
        if summary.skipped > 0 {
            ctx.log(
                LogLevel::Warn,
                &format!("{} entries left out: names are not UTF-8 or contain a newline", summary.skipped),
            )?;
        }
        Ok(Flow::Done(summary))
    })?);

    ctx.set_status(backup::UPLOADING_FILES)?;
    let files_dir = snapshot::files_path(&name);
    let message = format!("Uploading files to {}", display);
    let meter = &mut run.meter;
    proceed!(ctx.run_step(&format!("{}:files", id), &mut *dest, |ctx, dest| {
        ctx.update_progress(|p| {
            if p.message != message {
                p.start_step(message.clone(), listing.entries);
            }
        })?;
        dest.create_dir(&files_dir)?;
        transfer::upload_manifest(ctx, dest, &manifest_path, &root, &files_dir, meter)
    })?);

    let database = match &run.dump {
        Some((path, summary)) => {
            ctx.set_status(backup::UPLOADING_DATABASE)?;
            let remote = snapshot::dump_path(&name);
            let meter = &mut run.meter;
            proceed!(ctx.run_step(&format!("{}:database", id), &mut *dest, |ctx, dest| {
                ctx.update_progress(|p| p.start_step(format!("Uploading database to {}", display), 1))?;
                let sent = proceed!(transfer::upload_file(ctx, dest, path, &remote)?);
                meter.add_bytes(sent);
                Ok(Flow::Done(()))
            })?);
            Some(*summary)
        }
        None => None,
    };

    ctx.set_status(backup::FINALIZING)?;
    let marker = SnapshotMarker {
        name: name.clone(),
        created_at: run.plan.created_at,
        files: listing.files,
        bytes: listing.bytes,
        database,
        manual: run.manual,
        job_id: Some(ctx.job().id),
    };
    let marker_file = ctx.workspace().file(&format!("{}.snapshot.json", id));
    proceed!(ctx.run_step(&format!("{}:commit", id), &mut *dest, |_, dest| {
        std::fs::write(&marker_file, serde_json::to_vec_pretty(&marker)?)?;
        dest.copy_to_remote(&marker_file, &snapshot::marker_path(&name))?;
        Ok(Flow::Done(()))
    })?);

    let snapshot = marker.to_snapshot(&id);
    let conn = ctx.queue().pool().get()?;
    snapshots::upsert(&conn, &snapshot)?;
    drop(conn);

    ctx.log(LogLevel::Info, &format!("Snapshot {} committed to {}", name, display))?;
    Ok(Flow::Done(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{Clock, ManualClock, TimeBudget};
    use crate::config::Config;
    use crate::drivers::tests::local_set;
    use crate::executor::tests::Harness;
    use crate::executor::ItemErrorPolicy;
    use crate::job::JobType;
    use rusqlite::Connection;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    struct TickClock(ManualClock);

    impl Clock for TickClock {
        fn elapsed(&self) -> Duration {
            let now = self.0.elapsed();
            self.0.advance(Duration::from_secs(1));
            now
        }
    }

    fn site(base: &Path) -> Result<PathBuf> {
        let root = base.join("site");
        fs::create_dir_all(root.join("uploads/2026"))?;
        fs::create_dir_all(root.join(".git"))?;
        fs::write(root.join("index.php"), b"<?php echo 'hi';")?;
        fs::write(root.join("uploads/2026/photo.jpg"), vec![7u8; 100])?;
        fs::write(root.join(".git/HEAD"), b"ref: main")?;
        Ok(root)
    }

    fn config(base: &Path, database: bool) -> Result<Config> {
        let mut config = Config::default();
        config.source.root = site(base)?;
        if database {
            let db = base.join("site.db");
            let conn = Connection::open(&db)?;
            conn.execute_batch("CREATE TABLE options (name TEXT PRIMARY KEY, value TEXT); INSERT INTO options VALUES ('title', 'My site');")?;
            config.source.database = Some(db);
        }
        Ok(config)
    }

    fn run_to_end(h: &Harness, env: &DriverEnv<'_>, budget: impl Fn() -> TimeBudget) -> Result<(Completion, u32)> {
        let mut rounds = 0;
        loop {
            rounds += 1;
            assert!(rounds < 500, "backup never finished");
            let mut ctx = h.context(budget(), ItemErrorPolicy::default())?;
            if let Flow::Done(done) = BackupDriver.run(&mut ctx, env)? {
                return Ok((done, rounds));
            }
        }
    }

    #[test]
    fn test_backup_to_local_destination() -> Result<()> {
        let item = BackupItem { snapshot: Some("nightly".into()), ..Default::default() };
        let h = Harness::for_job(NewJob::new(JobType::Backup, "site", &item)?)?;
        let config = config(h.dir.path(), true)?;
        let destinations = local_set(&h.dir.path().join("mounts"), &["nas"])?;
        let env = DriverEnv { config: &config, destinations: &destinations };

        let (done, rounds) = run_to_end(&h, &env, TimeBudget::unlimited)?;
        assert_eq!(rounds, 1);
        assert!(!done.partial);

        let snap = h.dir.path().join("mounts/nas/nightly");
        assert_eq!(fs::read(snap.join("files/index.php"))?, b"<?php echo 'hi';");
        assert_eq!(fs::read(snap.join("files/uploads/2026/photo.jpg"))?, vec![7u8; 100]);
        assert!(!snap.join("files/.git").exists());
        assert!(snap.join(DUMP_FILE).is_file());

        let marker: SnapshotMarker = serde_json::from_slice(&fs::read(snap.join(snapshot::MARKER_FILE))?)?;
        assert_eq!(marker.files, 2);
        assert_eq!(marker.bytes, 116);
        assert_eq!(marker.database.map(|d| d.rows), Some(1));

        let conn = h.queue.pool().get()?;
        let indexed = snapshots::find_by_destination(&conn, "nas")?;
        assert_eq!(indexed.len(), 1);
        assert!(indexed[0].has_database);
        assert_eq!(h.queue.get(h.job_id)?.status, backup::FINALIZING);
        Ok(())
    }

    #[test]
    fn test_backup_resumes_across_invocations() -> Result<()> {
        let h = Harness::for_job(NewJob::new(JobType::Backup, "site", &BackupItem::default())?)?;
        let config = config(h.dir.path(), false)?;
        let destinations = local_set(&h.dir.path().join("mounts"), &["nas"])?;
        let env = DriverEnv { config: &config, destinations: &destinations };

        let budget = || TimeBudget::with_clock(Duration::from_secs(3), Box::new(TickClock(ManualClock::new())));
        let (done, rounds) = run_to_end(&h, &env, budget)?;
        assert!(rounds > 1);
        assert!(!done.partial);

        let conn = h.queue.pool().get()?;
        let indexed = snapshots::find_by_destination(&conn, "nas")?;
        assert_eq!(indexed.len(), 1);
        let snap = h.dir.path().join("mounts/nas").join(&indexed[0].name);
        assert_eq!(fs::read(snap.join("files/uploads/2026/photo.jpg"))?, vec![7u8; 100]);
        assert!(!snap.join("files/uploads/2026/.photo.jpg.bkpart").exists());
        assert!(snap.join(snapshot::MARKER_FILE).is_file());
        assert!(!snap.join(DUMP_FILE).exists());
        Ok(())
    }

    #[test]
    fn test_one_failed_destination_is_partial() -> Result<()> {
        let h = Harness::for_job(NewJob::new(JobType::Backup, "site", &BackupItem::default())?)?;
        let config = config(h.dir.path(), false)?;
        let destinations = local_set(&h.dir.path().join("mounts"), &["nas", "usb"])?;
        fs::remove_dir_all(h.dir.path().join("mounts/usb"))?;
        let env = DriverEnv { config: &config, destinations: &destinations };

        let (done, _) = run_to_end(&h, &env, TimeBudget::unlimited)?;
        assert!(done.partial);
        assert_eq!(h.queue.get(h.job_id)?.errors, 1);

        let conn = h.queue.pool().get()?;
        assert_eq!(snapshots::find_by_destination(&conn, "nas")?.len(), 1);
        assert!(snapshots::find_by_destination(&conn, "usb")?.is_empty());
        Ok(())
    }

    #[test]
    fn test_all_destinations_failing_fails_the_job() -> Result<()> {
        let h = Harness::for_job(NewJob::new(JobType::Backup, "site", &BackupItem::default())?)?;
        let config = config(h.dir.path(), false)?;
        let destinations = local_set(&h.dir.path().join("mounts"), &["usb"])?;
        fs::remove_dir_all(h.dir.path().join("mounts/usb"))?;
        let env = DriverEnv { config: &config, destinations: &destinations };

        let mut ctx = h.context(TimeBudget::unlimited(), ItemErrorPolicy::default())?;
        let err = BackupDriver.run(&mut ctx, &env).err();
        assert!(matches!(err, Some(EngineError::AllDestinationsFailed(1))));
        Ok(())
    }

    #[test]
    fn test_targets_fixed_when_job_starts() -> Result<()> {
        let h = Harness::for_job(NewJob::new(JobType::Backup, "site", &BackupItem::default())?)?;
        let config = config(h.dir.path(), false)?;
        let mounts = h.dir.path().join("mounts");
        let before = local_set(&mounts, &["nas"])?;
        let env = DriverEnv { config: &config, destinations: &before };

        let spent = ManualClock::new();
        spent.advance(Duration::from_secs(1));
        let budget = TimeBudget::with_clock(Duration::from_secs(1), Box::new(spent));
        let mut ctx = h.context(budget, ItemErrorPolicy::default())?;
        assert!(!BackupDriver.run(&mut ctx, &env)?.is_done());

        // A destination added while the job was suspended sorts first.
        let after = local_set(&mounts, &["usb", "nas"])?;
        let env = DriverEnv { config: &config, destinations: &after };
        let (done, _) = run_to_end(&h, &env, TimeBudget::unlimited)?;
        assert!(done.summary.contains("on 1 of 1 destinations"), "{}", done.summary);

        let conn = h.queue.pool().get()?;
        assert_eq!(snapshots::find_by_destination(&conn, "nas")?.len(), 1);
        assert!(snapshots::find_by_destination(&conn, "usb")?.is_empty());
        assert!(fs::read_dir(mounts.join("usb"))?.next().is_none());
        Ok(())
    }

    #[test]
    fn test_snapshot_name_checks() {
        assert!(check_name("2026-01-01_00-00-00").is_ok());
        assert!(check_name("before upgrade").is_ok());
        for bad in ["", "..", ".hidden", "a/b", "tab\there"] {
            assert!(check_name(bad).is_err(), "{:?}", bad);
        }
    }
}
