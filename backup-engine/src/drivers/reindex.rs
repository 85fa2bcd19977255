//! Rebuild the local snapshot index of one destination from the markers
//! stored on it.

use super::snapshot::{self, SnapshotMarker};
use super::{Completion, DriverEnv, JobDriver};
use crate::budget::Flow;
use crate::db::snapshots;
use crate::executor::JobContext;
use crate::job::status::maintenance;
use crate::proceed;
use crate::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReindexItem {
    pub destination: String,
}

pub struct ReindexDriver;

impl JobDriver for ReindexDriver {
    fn run(&self, ctx: &mut JobContext<'_>, env: &DriverEnv<'_>) -> Result<Flow<Completion>> {
        let item: ReindexItem = ctx.job().item()?;
        let mut dest = env.destinations.open(&item.destination)?;
        dest.connect()?;

        ctx.set_status(maintenance::SCANNING)?;
        let names = proceed!(ctx.run_step("list", dest.as_mut(), |_, dest| {
            Ok(Flow::Done(snapshot::list_snapshot_dirs(dest)?))
        })?);
        ctx.update_progress(|p| p.start_step(format!("Reading {} snapshot markers", names.len()), names.len() as u64))?;

        let markers = proceed!(ctx.run_for_each("marker", &names, dest.as_mut(), |ctx, dest, name| {
            let marker = snapshot::read_marker(dest, ctx.workspace(), name)?;
            ctx.update_progress(|p| p.current += 1)?;
            Ok(Flow::Done(marker))
        })?);
        dest.disconnect();

        ctx.set_status(maintenance::UPDATING)?;
        let found: Vec<&SnapshotMarker> = markers.succeeded().flatten().collect();
        let keep: Vec<String> = found.iter().map(|m| m.name.clone()).collect();

        let mut conn = ctx.queue().pool().get()?;
        let tx = conn.transaction()?;
        for marker in &found {
            snapshots::upsert(&tx, &marker.to_snapshot(&item.destination))?;
        }
        let dropped = snapshots::retain(&tx, &item.destination, &keep)?;
        tx.commit()?;

        Ok(Flow::Done(Completion {
            partial: markers.failed > 0,
            summary: format!(
                "Indexed {} snapshots on {} ({} stale entries removed, {} incomplete skipped)",
                found.len(),
                item.destination,
                dropped,
                names.len() - found.len() - markers.failed
            ),
            follow_up: None,
        }))
    }
}
