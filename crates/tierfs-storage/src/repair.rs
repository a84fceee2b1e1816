//! Crash repair for interrupted migrations.
//!
//! After a crash a file can be left in one of the intermediate xattr states
//! of the migration machines. All of them are recognizable from the xattr
//! set plus `fstat`, and all resolve to a consistent state without talking
//! to the remote store:
//!
//! - `stub` present but data blocks still allocated: the crash hit between
//!   setting the stub and truncating. The local copy is authoritative, so
//!   the remote markers are stripped and the file returns to the local
//!   state (the next scan may demote it again; the already uploaded object
//!   is orphaned, which the demotion machine accepts too).
//! - `object_id` present without `stub`: a promotion lost its tail. The
//!   file is local with stale metadata; the leftovers are stripped.
//! - `locked` present and old: the owning worker died. The lock is removed
//!   once it is older than [`STALE_LOCK_AGE`], measured against the file's
//!   ctime, which every xattr operation bumps.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tierfs_core::{TierError, TierResult};
use tracing::info;

use crate::fileops::{self, LockGuard, LockState, TierXattr};

/// Minimum lock age before it is considered abandoned.
pub const STALE_LOCK_AGE: Duration = Duration::from_secs(600);

/// What a repair pass did to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairAction {
    /// Stripped `stub`/`object_id`/`stat` from a file that still holds its
    /// data locally.
    ClearedRemoteMarkers,
    /// Stripped a dangling `object_id`/`stat` pair from a local file.
    ClearedStaleMetadata,
    /// Removed a `locked` attribute abandoned by a dead worker.
    ReleasedStaleLock,
}

/// Inspects and repairs a single file, path form.
///
/// # Errors
///
/// `FileOp` if the file cannot be opened or its state cannot be read.
pub fn repair_file(path: &Path) -> TierResult<Option<RepairAction>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|err| TierError::file_op("open", err))?;
    repair_open_file(&file, path)
}

/// Inspects and repairs a single already-open file.
///
/// Returns the action taken, or `None` when the file is consistent or a
/// live migration holds the lock.
///
/// # Errors
///
/// `FileOp` if the xattr state cannot be read or updated.
pub fn repair_open_file(file: &File, path: &Path) -> TierResult<Option<RepairAction>> {
    let fd = file.as_raw_fd();
    let st = fileops::stat_fd(fd)?;

    if fileops::has_xattr(fd, TierXattr::Locked)? {
        if lock_age(&st) < STALE_LOCK_AGE {
            return Ok(None);
        }
        fileops::unlock(fd)?;
        info!(path = %path.display(), "released stale migration lock");
        return Ok(Some(RepairAction::ReleasedStaleLock));
    }

    match fileops::try_lock(fd)? {
        LockState::AlreadyLocked => return Ok(None),
        LockState::Acquired => {}
    }
    let _lock = LockGuard::new(fd);

    let has_stub = fileops::has_xattr(fd, TierXattr::Stub)?;
    let has_id = fileops::has_xattr(fd, TierXattr::ObjectId)?;

    if has_stub && st.st_blocks > 0 {
        fileops::remove_xattr(fd, TierXattr::Stub, false)?;
        fileops::remove_xattr(fd, TierXattr::ObjectId, true)?;
        fileops::remove_xattr(fd, TierXattr::Stat, true)?;
        info!(
            path = %path.display(),
            "cleared remote markers from a file with local data"
        );
        return Ok(Some(RepairAction::ClearedRemoteMarkers));
    }

    if !has_stub && has_id {
        fileops::remove_xattr(fd, TierXattr::ObjectId, false)?;
        fileops::remove_xattr(fd, TierXattr::Stat, true)?;
        info!(path = %path.display(), "cleared stale tiering metadata");
        return Ok(Some(RepairAction::ClearedStaleMetadata));
    }

    Ok(None)
}

fn lock_age(st: &libc::stat) -> Duration {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    Duration::from_secs(now.saturating_sub(st.st_ctime).max(0) as u64)
}
