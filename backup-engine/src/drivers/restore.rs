//! Restore a snapshot into the site, or download it as-is.

use super::snapshot::{self, SnapshotMarker};
use super::{Completion, DriverEnv, JobDriver};
use crate::budget::Flow;
use crate::database::{self, DUMP_FILE};
use crate::destination::Destination;
use crate::executor::manifest::{self, ManifestEntry, ManifestSummary, ManifestWriter};
use crate::executor::JobContext;
use crate::job::status::restore;
use crate::proceed;
use crate::transfer::{self, progress::Throughput};
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreItem {
    pub snapshot: String,
    /// The default destination when absent.
    #[serde(default)]
    pub destination: Option<String>,
    /// Restore files here instead of the configured site root.
    #[serde(default)]
    pub target_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub include_database: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadItem {
    pub snapshot: String,
    #[serde(default)]
    pub destination: Option<String>,
    pub target_dir: PathBuf,
}

pub struct RestoreDriver;
pub struct DownloadDriver;

fn destination_id(env: &DriverEnv<'_>, requested: Option<String>) -> Result<String> {
    match requested {
        Some(id) => Ok(id),
        None => env
            .destinations
            .default_record()
            .map(|r| r.id.clone())
            .ok_or_else(|| EngineError::Validation("no destination given and no default destination".into())),
    }
}

/// Write a manifest of everything under `prefix`, children before their
/// directory so consuming from the tail creates directories first.
fn list_remote(path: &Path, dest: &mut dyn Destination, prefix: &str) -> Result<ManifestSummary> {
    if path.exists() {
        return manifest::summarize(path);
    }

    fn walk(dest: &mut dyn Destination, prefix: &str, rel: &str, out: &mut ManifestWriter) -> Result<()> {
        let dir = if rel.is_empty() { prefix.to_string() } else { format!("{}/{}", prefix, rel) };
        let entries: Vec<_> = dest.list_dir(&dir)?.collect();
        for entry in entries {
            let child = if rel.is_empty() { entry.name.clone() } else { format!("{}/{}", rel, entry.name) };
            let mtime = entry.modified.map(|m| m.timestamp()).unwrap_or(0);
            if entry.is_dir {
                walk(dest, prefix, &child, out)?;
                out.push(&ManifestEntry::dir(&child, mtime))?;
            } else {
                out.push(&ManifestEntry::file(&child, entry.size, mtime))?;
            }
        }
        Ok(())
    }

    let mut writer = ManifestWriter::create(path)?;
    walk(dest, prefix, "", &mut writer)?;
    writer.finish()
}

/// Marker check, listing and file download shared by restore and download.
fn fetch_snapshot(
    ctx: &mut JobContext<'_>,
    dest: &mut dyn Destination,
    name: &str,
    remote_prefix: &str,
    target: &Path,
    meter: &mut Throughput,
) -> Result<Flow<SnapshotMarker>> {
    ctx.set_status(restore::LISTING)?;
    let marker = proceed!(ctx.run_step("marker", &mut *dest, |ctx, dest| {
        match snapshot::read_marker(dest, ctx.workspace(), name)? {
            Some(marker) => Ok(Flow::Done(marker)),
            None => Err(EngineError::NotFound(format!("snapshot '{}' (no {})", name, snapshot::MARKER_FILE))),
        }
    })?);

    let manifest_path = ctx.workspace().file("restore.manifest");
    let listing = proceed!(ctx.run_step("listing", &mut *dest, |ctx, dest| {
        ctx.update_progress(|p| p.start_step(format!("Listing {}", remote_prefix), 0))?;
        Ok(Flow::Done(list_remote(&manifest_path, dest, remote_prefix)?))
    })?);

    ctx.set_status(restore::DOWNLOADING)?;
    std::fs::create_dir_all(target)?;
    let message = format!("Downloading {} to {}", name, target.display());
    proceed!(ctx.run_step("files", &mut *dest, |ctx, dest| {
        ctx.update_progress(|p| {
            if p.message != message {
                p.start_step(message.clone(), listing.entries);
            }
        })?;
        transfer::download_manifest(ctx, dest, &manifest_path, remote_prefix, target, meter)
    })?);

    Ok(Flow::Done(marker))
}

impl JobDriver for RestoreDriver {
    fn run(&self, ctx: &mut JobContext<'_>, env: &DriverEnv<'_>) -> Result<Flow<Completion>> {
        let item: RestoreItem = ctx.job().item()?;
        let id = destination_id(env, item.destination.clone())?;
        let target = item.target_dir.clone().unwrap_or_else(|| env.config.source.root.clone());

        let mut dest = env.destinations.open(&id)?;
        dest.connect()?;
        let mut meter = Throughput::start();
        let files_prefix = snapshot::files_path(&item.snapshot);
        let marker = proceed!(fetch_snapshot(ctx, dest.as_mut(), &item.snapshot, &files_prefix, &target, &mut meter)?);

        let imported = match (&marker.database, &env.config.source.database) {
            (Some(_), Some(database)) if item.include_database => {
                ctx.set_status(restore::IMPORTING_DATABASE)?;
                let dump = ctx.workspace().file(DUMP_FILE);
                let remote = snapshot::dump_path(&item.snapshot);
                proceed!(ctx.run_step("database-download", dest.as_mut(), |ctx, dest| {
                    ctx.update_progress(|p| p.start_step("Downloading database", 1))?;
                    transfer::download_file(ctx, dest, &remote, &dump, None)
                })?);
                let statements = proceed!(ctx.run_step("database-import", database.as_path(), |ctx, database| {
                    ctx.update_progress(|p| p.start_step("Importing database", 1))?;
                    database::import(ctx, &dump, database)
                })?);
                Some(statements)
            }
            (Some(_), None) if item.include_database => {
                return Err(EngineError::Config("snapshot has a database but source.database is not set".into()));
            }
            _ => None,
        };
        dest.disconnect();

        let mut summary = format!("Restored {} from {} into {} ({})", item.snapshot, id, target.display(), meter.summary());
        if let Some(statements) = imported {
            summary.push_str(&format!(", {} database statements", statements));
        }
        Ok(Flow::Done(Completion::done(summary)))
    }
}

impl JobDriver for DownloadDriver {
    fn run(&self, ctx: &mut JobContext<'_>, env: &DriverEnv<'_>) -> Result<Flow<Completion>> {
        let item: DownloadItem = ctx.job().item()?;
        let id = destination_id(env, item.destination.clone())?;

        let mut dest = env.destinations.open(&id)?;
        dest.connect()?;
        let mut meter = Throughput::start();
        proceed!(fetch_snapshot(ctx, dest.as_mut(), &item.snapshot, &item.snapshot, &item.target_dir, &mut meter)?);
        dest.disconnect();

        Ok(Flow::Done(Completion::done(format!(
            "Downloaded {} from {} to {} ({})",
            item.snapshot,
            id,
            item.target_dir.display(),
            meter.summary()
        ))))
    }
}
