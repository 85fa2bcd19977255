//! Resumable file movement between the local disk and a destination.
//!
//! Large files go through the [`ChunkTransfer`](crate::destination::ChunkTransfer)
//! contract one chunk at a time, with a budget check before every chunk.
//! The upload session is memoized per job; the offset to resume from is
//! asked of the destination each time.

pub mod progress;

use crate::budget::Flow;
use crate::destination::{join_remote, Destination};
use crate::executor::manifest::Manifest;
use crate::executor::JobContext;
use crate::fs::partial_path as part_path;
use crate::job::LogLevel;
use crate::proceed;
use crate::{EngineError, Result};
use progress::{format_bytes, Throughput};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, warn};

/// Manifest progress is persisted every this many entries.
const PROGRESS_EVERY: u64 = 50;

/// Upload one local file. Returns the bytes sent by this invocation.
pub fn upload_file(ctx: &mut JobContext<'_>, dest: &mut dyn Destination, local: &Path, remote: &str) -> Result<Flow<u64>> {
    let total = fs::metadata(local)?.len();
    let chunk = dest.effective_chunk_size();

    if total <= chunk {
        dest.copy_to_remote(local, remote)?;
        return Ok(Flow::Done(total));
    }

    let key = format!("upload-session:{}:{}", dest.record().id, remote);
    let session = proceed!(ctx.run_step(&key, &mut *dest, |_, dest| {
        dest.prepare_upload(remote, total).map(Flow::Done)
    })?);
    if session.total_size != total {
        return Err(EngineError::Validation(format!(
            "{} changed size during upload ({} -> {} bytes)",
            local.display(),
            session.total_size,
            total
        )));
    }

    let mut offset = dest.upload_offset(&session)?;
    if offset > 0 {
        debug!("Resuming {} at {} of {}", remote, format_bytes(offset), format_bytes(total));
    }
    ctx.update_progress(|p| {
        p.start_sub(remote, total);
        p.sub_current = offset;
    })?;

    let mut file = File::open(local)?;
    let mut buf = vec![0u8; chunk.min(total) as usize];
    let mut sent = 0;
    while offset < total {
        proceed!(ctx.check_budget()?);

        let len = chunk.min(total - offset) as usize;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf[..len])?;
        dest.upload_chunk(&session, offset, &buf[..len])?;

        offset += len as u64;
        sent += len as u64;
        ctx.update_progress(|p| p.sub_current = offset)?;
    }

    file.seek(SeekFrom::Start(0))?;
    dest.finalize_upload(&session, &mut file)?;
    ctx.update_progress(|p| p.clear_sub())?;
    Ok(Flow::Done(sent))
}

/// Download one remote file to `local`, through a hidden partial file next
/// to it.
///
/// An existing `local` is always replaced; only a partial file left by an
/// earlier invocation is resumed. Returns the bytes received by this
/// invocation.
pub fn download_file(
    ctx: &mut JobContext<'_>,
    dest: &mut dyn Destination,
    remote: &str,
    local: &Path,
    size: Option<u64>,
) -> Result<Flow<u64>> {
    let total = match size {
        Some(size) => size,
        None => dest.file_size(remote)?,
    };
    if let Some(parent) = local.parent() {
        fs::create_dir_all(parent)?;
    }

    let part = part_path(local);
    let chunk = dest.effective_chunk_size();
    if total <= chunk {
        dest.copy_to_local(remote, &part)?;
        fs::rename(&part, local)?;
        return Ok(Flow::Done(total));
    }

    let mut file = OpenOptions::new().create(true).write(true).truncate(false).open(&part)?;
    let mut offset = file.metadata()?.len().min(total);
    file.set_len(offset)?;
    file.seek(SeekFrom::Start(offset))?;
    ctx.update_progress(|p| {
        p.start_sub(remote, total);
        p.sub_current = offset;
    })?;

    let mut received = 0;
    while offset < total {
        proceed!(ctx.check_budget()?);

        let end = (offset + chunk).min(total);
        let data = dest.download_chunk(remote, offset, end)?;
        if data.is_empty() {
            return Err(EngineError::Validation(format!(
                "{} ended at {} bytes, expected {}",
                remote, offset, total
            )));
        }
        file.write_all(&data)?;

        offset += data.len() as u64;
        received += data.len() as u64;
        ctx.update_progress(|p| p.sub_current = offset)?;
    }

    file.sync_all()?;
    drop(file);
    fs::rename(&part, local)?;
    ctx.update_progress(|p| p.clear_sub())?;
    Ok(Flow::Done(received))
}

/// Direction of a manifest transfer.
enum Direction<'a> {
    Upload { local_root: &'a Path, remote_prefix: &'a str },
    Download { remote_prefix: &'a str, local_root: &'a Path },
}

/// Upload every entry of the manifest at `manifest_path`, consuming it.
///
/// Entry paths are relative to `local_root` and land under `remote_prefix`.
/// Entries that vanished since the walk are skipped with a warning. Other
/// failures count against the job via [`JobContext::item_failed`].
pub fn upload_manifest(
    ctx: &mut JobContext<'_>,
    dest: &mut dyn Destination,
    manifest_path: &Path,
    local_root: &Path,
    remote_prefix: &str,
    meter: &mut Throughput,
) -> Result<Flow<()>> {
    drain_manifest(ctx, dest, manifest_path, Direction::Upload { local_root, remote_prefix }, meter)
}

/// Download every entry of a manifest listing paths under `remote_prefix`
/// into `local_root`, consuming it.
pub fn download_manifest(
    ctx: &mut JobContext<'_>,
    dest: &mut dyn Destination,
    manifest_path: &Path,
    remote_prefix: &str,
    local_root: &Path,
    meter: &mut Throughput,
) -> Result<Flow<()>> {
    drain_manifest(ctx, dest, manifest_path, Direction::Download { remote_prefix, local_root }, meter)
}

fn drain_manifest(
    ctx: &mut JobContext<'_>,
    dest: &mut dyn Destination,
    manifest_path: &Path,
    direction: Direction<'_>,
    meter: &mut Throughput,
) -> Result<Flow<()>> {
    let mut manifest = Manifest::open(manifest_path)?;
    let mut handled = 0u64;

    while let Some(pending) = manifest.peek()? {
        if let Flow::Yield(reason) = ctx.check_budget()? {
            return Ok(Flow::Yield(reason));
        }

        let entry = &pending.entry;
        let result = match &direction {
            Direction::Upload { local_root, remote_prefix } => {
                let remote = join_remote(remote_prefix, &entry.path)?;
                if entry.is_dir() {
                    dest.create_dir(&remote).map(|_| Flow::Done(0))
                } else {
                    upload_file(ctx, dest, &local_root.join(&entry.path), &remote)
                }
            }
            Direction::Download { remote_prefix, local_root } => {
                let remote = join_remote(remote_prefix, &entry.path)?;
                let local = local_root.join(&entry.path);
                if entry.is_dir() {
                    fs::create_dir_all(&local).map(|_| Flow::Done(0)).map_err(EngineError::from)
                } else {
                    download_file(ctx, dest, &remote, &local, Some(entry.size))
                }
            }
        };

        match result {
            Ok(Flow::Done(bytes)) => {
                meter.add_bytes(bytes);
                if !entry.is_dir() {
                    meter.add_file();
                }
            }
            Ok(Flow::Yield(reason)) => {
                ctx.save_progress()?;
                return Ok(Flow::Yield(reason));
            }
            Err(e) if e.is_vanished() => {
                warn!("Skipping {}: {}", entry.path, e);
                ctx.log(LogLevel::Warn, &format!("Skipped {} (no longer exists)", entry.path))?;
            }
            Err(e) => ctx.item_failed(&entry.path, e)?,
        }

        manifest.commit(pending)?;
        ctx.progress_mut().current += 1;
        handled += 1;
        if handled % PROGRESS_EVERY == 0 {
            ctx.save_progress()?;
        }
    }

    ctx.save_progress()?;
    Ok(Flow::Done(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{ManualClock, TimeBudget, YieldReason};
    use crate::destination::testing::MemoryDestination;
    use crate::executor::manifest;
    use crate::executor::tests::Harness;
    use crate::executor::ItemErrorPolicy;
    use crate::fs::walker::WalkOptions;
    use crate::job::JobType;
    use std::time::Duration;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// A budget that runs out after `ticks` budget checks.
    struct TickClock {
        clock: ManualClock,
    }

    impl crate::budget::Clock for TickClock {
        fn elapsed(&self) -> Duration {
            let now = self.clock.elapsed();
            self.clock.advance(Duration::from_secs(1));
            now
        }
    }

    fn ticking(ticks: u64) -> TimeBudget {
        TimeBudget::with_clock(Duration::from_secs(ticks), Box::new(TickClock { clock: ManualClock::new() }))
    }

    #[test]
    fn test_small_file_is_copied_whole() -> Result<()> {
        let h = Harness::new(JobType::Backup)?;
        let src = h.dir.path().join("small.bin");
        fs::write(&src, b"hello")?;

        let mut dest = MemoryDestination::new("mem").with_chunk_size(16);
        let state = dest.state();
        let mut ctx = h.context(TimeBudget::unlimited(), ItemErrorPolicy::default())?;
        assert_eq!(upload_file(&mut ctx, &mut dest, &src, "a/small.bin")?, Flow::Done(5));
        assert_eq!(state.borrow().files["a/small.bin"], b"hello");
        assert_eq!(state.borrow().calls("prepare_upload"), 0);
        Ok(())
    }

    #[test]
    fn test_upload_resumes_without_resending() -> Result<()> {
        let h = Harness::new(JobType::Backup)?;
        let data = pattern(100);
        let src = h.dir.path().join("big.bin");
        fs::write(&src, &data)?;

        let mut dest = MemoryDestination::new("mem").with_chunk_size(10);
        let state = dest.state();

        // Ten chunks; only some fit in the first invocation.
        let mut ctx = h.context(ticking(4), ItemErrorPolicy::default())?;
        let flow = upload_file(&mut ctx, &mut dest, &src, "big.bin")?;
        assert_eq!(flow, Flow::Yield(YieldReason::TimeBudget));
        let sent = state.borrow().calls("upload_chunk");
        assert!(sent > 0 && sent < 10);
        let first = state.borrow().chunk_bytes;
        assert_eq!(first, sent as u64 * 10);

        let mut ctx = h.context(TimeBudget::unlimited(), ItemErrorPolicy::default())?;
        let flow = upload_file(&mut ctx, &mut dest, &src, "big.bin")?;
        assert_eq!(flow, Flow::Done(100 - first));

        let state = state.borrow();
        assert_eq!(state.calls("upload_chunk") - sent, 10 - sent);
        assert_eq!(state.calls("finalize_upload"), 1);
        assert_eq!(state.chunk_bytes, 100);
        assert_eq!(state.calls("prepare_upload"), 1);
        assert_eq!(state.files["big.bin"], data);
        Ok(())
    }

    #[test]
    fn test_failed_chunk_resumes_at_backend_offset() -> Result<()> {
        let h = Harness::new(JobType::Backup)?;
        let data = pattern(35);
        let src = h.dir.path().join("big.bin");
        fs::write(&src, &data)?;

        let mut dest = MemoryDestination::new("mem").with_chunk_size(10);
        let state = dest.state();
        state.borrow_mut().fail_call("upload_chunk", 2, EngineError::Transport("connection reset".into()));

        let mut ctx = h.context(TimeBudget::unlimited(), ItemErrorPolicy::default())?;
        let result = upload_file(&mut ctx, &mut dest, &src, "big.bin");
        assert!(matches!(result, Err(EngineError::Transport(_))));

        let flow = upload_file(&mut ctx, &mut dest, &src, "big.bin")?;
        assert_eq!(flow, Flow::Done(25));
        let state = state.borrow();
        // One accepted chunk, one failed, then the remaining three.
        assert_eq!(state.calls("upload_chunk"), 5);
        assert_eq!(state.files["big.bin"], data);
        assert_eq!(state.chunk_bytes, 35);
        assert_eq!(state.calls("prepare_upload"), 1);
        Ok(())
    }

    #[test]
    fn test_download_resumes_from_part_file() -> Result<()> {
        let h = Harness::new(JobType::Restore)?;
        let data = pattern(45);
        let mut dest = MemoryDestination::new("mem").with_chunk_size(10);
        let state = dest.state();
        state.borrow_mut().files.insert("snap/big.bin".into(), data.clone());

        let target = h.dir.path().join("out/big.bin");
        let mut ctx = h.context(ticking(3), ItemErrorPolicy::default())?;
        let flow = download_file(&mut ctx, &mut dest, "snap/big.bin", &target, None)?;
        assert_eq!(flow, Flow::Yield(YieldReason::TimeBudget));
        assert!(!target.exists());
        let partial = fs::metadata(part_path(&target))?.len();
        assert!(partial > 0 && partial < 45);

        let mut ctx = h.context(TimeBudget::unlimited(), ItemErrorPolicy::default())?;
        let flow = download_file(&mut ctx, &mut dest, "snap/big.bin", &target, Some(45))?;
        assert_eq!(flow, Flow::Done(45 - partial));
        assert_eq!(fs::read(&target)?, data);
        assert!(!part_path(&target).exists());

        assert_eq!(state.borrow().calls("download_chunk"), 5);
        Ok(())
    }

    #[test]
    fn test_download_replaces_modified_file_of_same_size() -> Result<()> {
        let h = Harness::new(JobType::Restore)?;
        let mut dest = MemoryDestination::new("mem").with_chunk_size(10);
        let state = dest.state();
        state.borrow_mut().files.insert("snap/top.txt".into(), b"top".to_vec());
        state.borrow_mut().files.insert("snap/big.bin".into(), pattern(25));

        let out = h.dir.path().join("out");
        fs::create_dir_all(&out)?;
        fs::write(out.join("top.txt"), b"BAD")?;
        fs::write(out.join("big.bin"), vec![0u8; 25])?;

        let mut ctx = h.context(TimeBudget::unlimited(), ItemErrorPolicy::default())?;
        assert_eq!(download_file(&mut ctx, &mut dest, "snap/top.txt", &out.join("top.txt"), Some(3))?, Flow::Done(3));
        assert_eq!(download_file(&mut ctx, &mut dest, "snap/big.bin", &out.join("big.bin"), Some(25))?, Flow::Done(25));
        assert_eq!(fs::read(out.join("top.txt"))?, b"top");
        assert_eq!(fs::read(out.join("big.bin"))?, pattern(25));
        Ok(())
    }

    #[test]
    fn test_manifest_upload_is_resumable_and_conserves_entries() -> Result<()> {
        let h = Harness::new(JobType::Backup)?;
        let root = h.dir.path().join("src");
        fs::create_dir_all(root.join("docs/deep"))?;
        fs::write(root.join("a.txt"), b"alpha")?;
        fs::write(root.join("docs/b.txt"), pattern(30))?;
        fs::write(root.join("docs/deep/c.txt"), b"gamma")?;

        let job = h.queue.get(h.job_id)?;
        let ws = h.queue.workspace(&job);
        ws.ensure()?;
        let manifest_path = ws.file("files.manifest");
        let summary = manifest::build(&manifest_path, &root, &WalkOptions::default())?;
        assert_eq!(summary.entries, 5);

        let mut dest = MemoryDestination::new("mem").with_chunk_size(8);
        let state = dest.state();
        let mut meter = Throughput::start();

        let mut rounds = 0;
        loop {
            rounds += 1;
            assert!(rounds < 50, "upload never finished");
            let mut ctx = h.context(ticking(3), ItemErrorPolicy::default())?;
            match upload_manifest(&mut ctx, &mut dest, &manifest_path, &root, "snap/files", &mut meter)? {
                Flow::Done(()) => break,
                Flow::Yield(_) => continue,
            }
        }
        assert!(rounds > 1);

        let state = state.borrow();
        assert_eq!(state.files["snap/files/a.txt"], b"alpha");
        assert_eq!(state.files["snap/files/docs/b.txt"], pattern(30));
        assert_eq!(state.files["snap/files/docs/deep/c.txt"], b"gamma");
        assert!(state.dirs.contains("snap/files/docs/deep"));
        assert_eq!(state.chunk_bytes, 30);
        assert_eq!(meter.files(), 3);
        assert!(Manifest::open(&manifest_path)?.is_empty()?);
        assert_eq!(h.queue.get(h.job_id)?.progress.current, 5);
        Ok(())
    }

    #[test]
    fn test_vanished_file_is_skipped() -> Result<()> {
        let h = Harness::new(JobType::Backup)?;
        let root = h.dir.path().join("src");
        fs::create_dir_all(&root)?;
        fs::write(root.join("keep.txt"), b"keep")?;
        fs::write(root.join("gone.txt"), b"gone")?;

        let job = h.queue.get(h.job_id)?;
        let ws = h.queue.workspace(&job);
        ws.ensure()?;
        let manifest_path = ws.file("files.manifest");
        manifest::build(&manifest_path, &root, &WalkOptions::default())?;
        fs::remove_file(root.join("gone.txt"))?;

        let mut dest = MemoryDestination::new("mem");
        let state = dest.state();
        let mut ctx = h.context(TimeBudget::unlimited(), ItemErrorPolicy::default())?;
        let flow = upload_manifest(&mut ctx, &mut dest, &manifest_path, &root, "", &mut Throughput::start())?;
        assert!(flow.is_done());

        assert!(state.borrow().files.contains_key("keep.txt"));
        assert!(!state.borrow().files.contains_key("gone.txt"));
        assert_eq!(h.queue.get(h.job_id)?.errors, 0);
        Ok(())
    }
}
