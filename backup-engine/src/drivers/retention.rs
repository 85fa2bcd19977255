//! Delete all but the newest snapshots on a destination.

use super::snapshot;
use super::{Completion, DriverEnv, JobDriver};
use crate::budget::Flow;
use crate::db::snapshots;
use crate::executor::JobContext;
use crate::job::status::maintenance;
use crate::job::LogLevel;
use crate::proceed;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionItem {
    pub destination: String,
    /// Complete snapshots to keep, newest first.
    pub keep: usize,
}

pub struct RetentionDriver;

impl JobDriver for RetentionDriver {
    fn run(&self, ctx: &mut JobContext<'_>, env: &DriverEnv<'_>) -> Result<Flow<Completion>> {
        let item: RetentionItem = ctx.job().item()?;
        if item.keep == 0 {
            return Err(EngineError::Validation("retention must keep at least one snapshot".into()));
        }
        let mut dest = env.destinations.open(&item.destination)?;
        dest.connect()?;

        ctx.set_status(maintenance::SCANNING)?;
        let keep = item.keep;
        let victims = proceed!(ctx.run_step("candidates", dest.as_mut(), |ctx, dest| {
            let mut complete = Vec::new();
            for name in snapshot::list_snapshot_dirs(dest)? {
                if let Some(marker) = snapshot::read_marker(dest, ctx.workspace(), &name)? {
                    complete.push(marker);
                }
            }
            complete.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.name.cmp(&a.name)));
            Ok(Flow::Done(complete.into_iter().skip(keep).map(|m| m.name).collect::<Vec<_>>()))
        })?);

        ctx.set_status(maintenance::UPDATING)?;
        ctx.update_progress(|p| p.start_step(format!("Deleting {} snapshots", victims.len()), victims.len() as u64))?;
        let destination_id = item.destination.clone();
        let deleted = proceed!(ctx.run_for_each("delete", &victims, dest.as_mut(), |ctx, dest, name| {
            // The marker goes first so a half-deleted snapshot is never taken
            // for a complete one.
            if dest.file_exists(&snapshot::marker_path(name))? {
                dest.remove_file(&snapshot::marker_path(name))?;
            }
            dest.remove_dir(name)?;

            let conn = ctx.queue().pool().get()?;
            snapshots::delete(&conn, &destination_id, name)?;
            drop(conn);

            ctx.log(LogLevel::Info, &format!("Deleted snapshot {}", name))?;
            ctx.update_progress(|p| p.current += 1)?;
            Ok(Flow::Done(()))
        })?);
        dest.disconnect();

        let removed = deleted.succeeded().count();
        Ok(Flow::Done(Completion {
            partial: deleted.failed > 0,
            summary: format!(
                "Removed {} of {} expired snapshots from {}, keeping {}",
                removed,
                victims.len(),
                item.destination,
                item.keep
            ),
            follow_up: None,
        }))
    }
}
