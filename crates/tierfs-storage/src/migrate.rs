//! Transactional per-file migration between the local and remote tiers.
//!
//! Both directions follow the same discipline: open the file once and work
//! through the descriptor, take the xattr migration lock, check the current
//! location, move the data, then flip the xattr state. Every step after the
//! lock has a defined rollback so that a failure leaves the file either
//! fully local or fully remote; the lock itself is released on every exit
//! path via [`fileops::LockGuard`].
//!
//! Demotion ends by truncating the file to zero and extending it back to
//! its original length, which yields a hole-only sparse file: external
//! `stat` keeps reporting the original size while no data blocks remain
//! allocated.

use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;

use tierfs_core::{TierError, TierResult};
use tracing::{debug, warn};

use crate::fileops::{self, LockGuard, LockState, SavedStat, SetMode, TierXattr};
use crate::object_store::ObjectStore;

/// Result of a migration attempt that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateOutcome {
    /// The file was moved to the target tier.
    Done,
    /// The file was already in the target tier; nothing was changed.
    NoOp,
    /// Another worker holds the migration lock; nothing was changed.
    Contended,
}

/// Drives single-file migrations against a remote store.
pub struct Migrator {
    store: Arc<dyn ObjectStore>,
}

impl Migrator {
    /// Creates a migrator backed by `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Demotes a file: uploads its content and replaces it with a sparse
    /// stub of unchanged logical size.
    ///
    /// # Errors
    ///
    /// `FileOp` for syscall failures, `ObjectStore` for upload failures. In
    /// every error case the xattrs added so far are rolled back; an already
    /// uploaded object may be orphaned in the remote store.
    pub async fn demote(&self, path: &Path) -> TierResult<MigrateOutcome> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| TierError::file_op("open", err))?;
        let fd = file.as_raw_fd();

        match fileops::try_lock(fd)? {
            LockState::AlreadyLocked => {
                debug!(path = %path.display(), "demotion skipped, file is locked");
                return Ok(MigrateOutcome::Contended);
            }
            LockState::Acquired => {}
        }
        let _lock = LockGuard::new(fd);

        if !fileops::is_local_fd(fd)? {
            debug!(path = %path.display(), "demotion skipped, file is already remote");
            return Ok(MigrateOutcome::NoOp);
        }

        let object_id = self.store.object_id_for(path);
        self.store.upload(&file, &object_id).await?;

        // From here on every failure must strip the attributes added so far.
        fileops::set_xattr(fd, TierXattr::ObjectId, object_id.as_bytes(), SetMode::CreateOnly)?;

        if let Err(err) = fileops::set_xattr(fd, TierXattr::Stub, &[], SetMode::CreateOnly) {
            rollback(fd, path, &[TierXattr::ObjectId]);
            return Err(err);
        }

        let saved = match fileops::stat_fd(fd) {
            Ok(st) => SavedStat {
                size: st.st_size,
                blocks: st.st_blocks,
            },
            Err(err) => {
                rollback(fd, path, &[TierXattr::Stub, TierXattr::ObjectId]);
                return Err(err);
            }
        };
        if let Err(err) = fileops::set_xattr(fd, TierXattr::Stat, &saved.to_bytes(), SetMode::CreateOnly)
        {
            rollback(fd, path, &[TierXattr::Stub, TierXattr::ObjectId]);
            return Err(err);
        }

        if let Err(err) = fileops::truncate(fd, 0) {
            rollback(
                fd,
                path,
                &[TierXattr::Stat, TierXattr::Stub, TierXattr::ObjectId],
            );
            return Err(err);
        }
        if let Err(err) = fileops::truncate(fd, saved.size) {
            rollback(
                fd,
                path,
                &[TierXattr::Stat, TierXattr::Stub, TierXattr::ObjectId],
            );
            return Err(err);
        }

        debug!(
            path = %path.display(),
            object_id,
            size = saved.size,
            "file demoted to remote store"
        );
        Ok(MigrateOutcome::Done)
    }

    /// Promotes a file: downloads its content back over the stub and clears
    /// the tiering attributes.
    ///
    /// Attributes are removed in the order `stub`, `object_id`, `stat`, so
    /// a partial failure leaves a recognizable intermediate state (`stub`
    /// absent but `object_id` present reads as local with stale metadata,
    /// which a later scan repairs).
    ///
    /// # Errors
    ///
    /// `FileOp` for syscall failures, `ObjectStore`/`ObjectNotFound` for
    /// download failures, `Invalid` if the xattr state violates the
    /// stub-implies-object-id invariant.
    pub async fn promote(&self, path: &Path) -> TierResult<MigrateOutcome> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| TierError::file_op("open", err))?;
        let fd = file.as_raw_fd();

        match fileops::try_lock(fd)? {
            LockState::AlreadyLocked => {
                debug!(path = %path.display(), "promotion skipped, file is locked");
                return Ok(MigrateOutcome::Contended);
            }
            LockState::Acquired => {}
        }
        let _lock = LockGuard::new(fd);

        if fileops::is_local_fd(fd)? {
            debug!(path = %path.display(), "promotion skipped, file is already local");
            return Ok(MigrateOutcome::NoOp);
        }

        let object_id = read_object_id(fd, path, self.store.object_id_max_len())?;
        self.store.download(&file, &object_id).await?;

        fileops::remove_xattr(fd, TierXattr::Stub, false)?;
        fileops::remove_xattr(fd, TierXattr::ObjectId, false)?;
        fileops::remove_xattr(fd, TierXattr::Stat, true)?;

        debug!(path = %path.display(), object_id, "file promoted to local store");
        Ok(MigrateOutcome::Done)
    }
}

fn read_object_id(fd: RawFd, path: &Path, max_len: usize) -> TierResult<String> {
    let mut buf = vec![0u8; max_len];
    let len = fileops::get_xattr(fd, TierXattr::ObjectId, &mut buf)?.ok_or_else(|| {
        TierError::invalid(format!(
            "`{}` is marked remote but carries no object id",
            path.display()
        ))
    })?;
    String::from_utf8(buf[..len].to_vec())
        .map_err(|_| TierError::invalid("object id is not valid UTF-8"))
}

fn rollback(fd: RawFd, path: &Path, attrs: &[TierXattr]) {
    for attr in attrs {
        if let Err(err) = fileops::remove_xattr(fd, *attr, true) {
            warn!(
                path = %path.display(),
                attr = attr.name(),
                error = %err,
                "failed to roll back tiering attribute"
            );
        }
    }
}
