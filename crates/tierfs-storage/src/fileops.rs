//! File-descriptor level primitives for the tiering state machine.
//!
//! Per-file tiering state is anchored in four extended attributes under the
//! `user.tierfs` namespace:
//!
//! | name | presence means | value |
//! |---|---|---|
//! | `stub` | file data lives remotely | empty |
//! | `locked` | a migration is in progress | empty |
//! | `object_id` | remote key for this file | string |
//! | `stat` | saved pre-truncation metadata | packed `{i64 size; i64 blocks}` |
//!
//! `try_lock` relies on the create-only flag of `fsetxattr(2)`, which is
//! atomic with respect to the filesystem, so the lock is observable across
//! threads, processes and out-of-band tools alike.

use std::ffi::{CStr, CString};
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

use tierfs_core::{TierError, TierResult};

/// The four tiering attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierXattr {
    /// File data lives in the remote store.
    Stub,
    /// Migration-in-progress exclusion flag.
    Locked,
    /// Remote key under which the file content is stored.
    ObjectId,
    /// Saved size metadata from before truncation.
    Stat,
}

impl TierXattr {
    /// Full on-disk key, NUL terminated for the raw syscalls.
    #[must_use]
    pub fn key(self) -> &'static CStr {
        match self {
            Self::Stub => c_key(b"user.tierfs.stub\0"),
            Self::Locked => c_key(b"user.tierfs.locked\0"),
            Self::ObjectId => c_key(b"user.tierfs.object_id\0"),
            Self::Stat => c_key(b"user.tierfs.stat\0"),
        }
    }

    /// Short attribute name for log messages.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Stub => "stub",
            Self::Locked => "locked",
            Self::ObjectId => "object_id",
            Self::Stat => "stat",
        }
    }
}

const fn c_key(bytes: &'static [u8]) -> &'static CStr {
    // Keys are compile-time literals with a single trailing NUL.
    unsafe { CStr::from_bytes_with_nul_unchecked(bytes) }
}

/// Behavior of [`set_xattr`] towards an existing attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    /// Fail if the attribute already exists (`XATTR_CREATE`).
    CreateOnly,
    /// Fail if the attribute does not exist (`XATTR_REPLACE`).
    ReplaceOnly,
    /// Create or replace.
    Either,
}

impl SetMode {
    fn flags(self) -> libc::c_int {
        match self {
            Self::CreateOnly => libc::XATTR_CREATE,
            Self::ReplaceOnly => libc::XATTR_REPLACE,
            Self::Either => 0,
        }
    }
}

/// Outcome of a lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// This caller now holds the migration lock.
    Acquired,
    /// Another thread or process holds it.
    AlreadyLocked,
}

/// Sets a tiering attribute on an open file.
///
/// # Errors
///
/// `FileOp` with the original errno, including `EEXIST`/`ENODATA` conflicts
/// with the requested mode.
pub fn set_xattr(fd: RawFd, attr: TierXattr, value: &[u8], mode: SetMode) -> TierResult<()> {
    let rc = unsafe {
        libc::fsetxattr(
            fd,
            attr.key().as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            mode.flags(),
        )
    };
    if rc != 0 {
        return Err(TierError::last_os_error("fsetxattr"));
    }
    Ok(())
}

/// Reads a tiering attribute into `buf`.
///
/// Returns `None` when the attribute is absent; this distinction carries the
/// file-state information and must not be collapsed into an error.
///
/// # Errors
///
/// `FileOp` for any failure other than attribute absence, including a `buf`
/// too small for the value (`ERANGE`).
pub fn get_xattr(fd: RawFd, attr: TierXattr, buf: &mut [u8]) -> TierResult<Option<usize>> {
    let rc = unsafe {
        libc::fgetxattr(
            fd,
            attr.key().as_ptr(),
            buf.as_mut_ptr().cast(),
            buf.len(),
        )
    };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENODATA) {
            return Ok(None);
        }
        return Err(TierError::file_op("fgetxattr", err));
    }
    Ok(Some(rc as usize))
}

/// True if the attribute is present, without reading its value.
///
/// # Errors
///
/// `FileOp` for any failure other than attribute absence.
pub fn has_xattr(fd: RawFd, attr: TierXattr) -> TierResult<bool> {
    let rc = unsafe { libc::fgetxattr(fd, attr.key().as_ptr(), ptr::null_mut(), 0) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENODATA) {
            return Ok(false);
        }
        return Err(TierError::file_op("fgetxattr", err));
    }
    Ok(true)
}

/// Removes a tiering attribute. Idempotent when `ignore_absent` is set.
///
/// # Errors
///
/// `FileOp` on failure; absence counts as failure only when `ignore_absent`
/// is false.
pub fn remove_xattr(fd: RawFd, attr: TierXattr, ignore_absent: bool) -> TierResult<()> {
    let rc = unsafe { libc::fremovexattr(fd, attr.key().as_ptr()) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if ignore_absent && err.raw_os_error() == Some(libc::ENODATA) {
            return Ok(());
        }
        return Err(TierError::file_op("fremovexattr", err));
    }
    Ok(())
}

/// Attempts to take the migration lock. The create-only set is the single
/// source of exclusion for migrations.
///
/// # Errors
///
/// `FileOp` for failures other than losing the race.
pub fn try_lock(fd: RawFd) -> TierResult<LockState> {
    let rc = unsafe {
        libc::fsetxattr(
            fd,
            TierXattr::Locked.key().as_ptr(),
            ptr::null(),
            0,
            libc::XATTR_CREATE,
        )
    };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EEXIST) {
            return Ok(LockState::AlreadyLocked);
        }
        return Err(TierError::file_op("fsetxattr", err));
    }
    Ok(LockState::Acquired)
}

/// Releases the migration lock.
///
/// # Errors
///
/// `FileOp` if the lock attribute cannot be removed, including when it was
/// not held.
pub fn unlock(fd: RawFd) -> TierResult<()> {
    remove_xattr(fd, TierXattr::Locked, false)
}

/// Holds the migration lock and releases it when dropped, so every exit
/// path of a migration unwinds through `unlock`.
pub struct LockGuard {
    fd: RawFd,
}

impl LockGuard {
    /// Adopts an already-acquired lock on `fd`.
    #[must_use]
    pub fn new(fd: RawFd) -> Self {
        Self { fd }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = unlock(self.fd) {
            tracing::warn!(fd = self.fd, error = %err, "failed to release migration lock");
        }
    }
}

/// True iff the file content is local (no `stub` attribute).
///
/// # Errors
///
/// `FileOp` if the attribute state cannot be read.
pub fn is_local_fd(fd: RawFd) -> TierResult<bool> {
    Ok(!has_xattr(fd, TierXattr::Stub)?)
}

/// Path variant of [`is_local_fd`].
///
/// # Errors
///
/// `FileOp` if the attribute state cannot be read.
pub fn is_local_path(path: &Path) -> TierResult<bool> {
    let cpath = cstring_path(path)?;
    let rc = unsafe {
        libc::getxattr(
            cpath.as_ptr(),
            TierXattr::Stub.key().as_ptr(),
            ptr::null_mut(),
            0,
        )
    };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENODATA) {
            return Ok(true);
        }
        return Err(TierError::file_op("getxattr", err));
    }
    Ok(false)
}

/// True iff `fd` refers to a regular file.
///
/// # Errors
///
/// `FileOp` if `fstat` fails.
pub fn is_regular_fd(fd: RawFd) -> TierResult<bool> {
    let st = stat_fd(fd)?;
    Ok((st.st_mode & libc::S_IFMT) == libc::S_IFREG)
}

/// Path variant of [`is_regular_fd`]; does not follow symlinks.
///
/// # Errors
///
/// `FileOp` if the metadata cannot be read.
pub fn is_regular_path(path: &Path) -> TierResult<bool> {
    let meta =
        std::fs::symlink_metadata(path).map_err(|err| TierError::file_op("lstat", err))?;
    Ok(meta.file_type().is_file())
}

/// `fstat` wrapper.
///
/// # Errors
///
/// `FileOp` if the call fails.
pub fn stat_fd(fd: RawFd) -> TierResult<libc::stat> {
    let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
    if unsafe { libc::fstat(fd, st.as_mut_ptr()) } != 0 {
        return Err(TierError::last_os_error("fstat"));
    }
    Ok(unsafe { st.assume_init() })
}

/// `ftruncate` wrapper.
///
/// # Errors
///
/// `FileOp` if the call fails.
pub fn truncate(fd: RawFd, len: i64) -> TierResult<()> {
    if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
        return Err(TierError::last_os_error("ftruncate"));
    }
    Ok(())
}

fn cstring_path(path: &Path) -> TierResult<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| TierError::invalid("path contains an interior NUL byte"))
}

/// Pre-truncation metadata persisted in the `stat` attribute.
///
/// The on-disk layout is frozen: two little-endian `i64` fields, 16 bytes
/// total. Signed 64-bit types keep the record portable across platforms
/// with differing native `off_t`/`blkcnt_t` widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedStat {
    /// Logical file size in bytes (`st_size`).
    pub size: i64,
    /// Allocated 512-byte blocks (`st_blocks`).
    pub blocks: i64,
}

impl SavedStat {
    /// Encoded length of the attribute value.
    pub const ENCODED_LEN: usize = 16;

    /// Encodes the record for storage in the `stat` attribute.
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..8].copy_from_slice(&self.size.to_le_bytes());
        out[8..].copy_from_slice(&self.blocks.to_le_bytes());
        out
    }

    /// Decodes a stored record.
    ///
    /// # Errors
    ///
    /// `Invalid` if `bytes` is not exactly [`Self::ENCODED_LEN`] long.
    pub fn from_bytes(bytes: &[u8]) -> TierResult<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(TierError::invalid(format!(
                "stat attribute must be {} bytes, got {}",
                Self::ENCODED_LEN,
                bytes.len()
            )));
        }
        let mut size = [0u8; 8];
        let mut blocks = [0u8; 8];
        size.copy_from_slice(&bytes[..8]);
        blocks.copy_from_slice(&bytes[8..]);
        Ok(Self {
            size: i64::from_le_bytes(size),
            blocks: i64::from_le_bytes(blocks),
        })
    }
}
