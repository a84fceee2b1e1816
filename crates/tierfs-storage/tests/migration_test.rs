//! End-to-end migration tests against the in-memory object store, on a real
//! filesystem so the xattr state machine and sparse truncation are exercised
//! for real.

use std::fs::{self, File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tierfs_storage::fileops::{self, LockState, SetMode, TierXattr};
use tierfs_storage::repair::{self, RepairAction};
use tierfs_storage::{MemoryStore, MigrateOutcome, Migrator};

/// Scratch directory on the build filesystem, skipped (with a note) when it
/// does not support user xattrs.
fn scratch_dir() -> Option<tempfile::TempDir> {
    let base = Path::new(env!("CARGO_TARGET_TMPDIR"));
    fs::create_dir_all(base).unwrap();
    let dir = tempfile::tempdir_in(base).unwrap();

    let probe = dir.path().join("xattr-probe");
    fs::write(&probe, b"x").unwrap();
    let file = open_rw(&probe);
    if fileops::set_xattr(file.as_raw_fd(), TierXattr::Stub, &[], SetMode::Either).is_err() {
        eprintln!("skipping: filesystem has no user xattr support");
        return None;
    }
    fileops::remove_xattr(file.as_raw_fd(), TierXattr::Stub, false).unwrap();
    drop(file);
    fs::remove_file(&probe).unwrap();
    Some(dir)
}

fn open_rw(path: &Path) -> File {
    OpenOptions::new().read(true).write(true).open(path).unwrap()
}

fn cold_file(dir: &Path, name: &str, len: usize) -> (PathBuf, Vec<u8>) {
    let content: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    let path = dir.join(name);
    fs::write(&path, &content).unwrap();
    (path, content)
}

fn xattr_set(path: &Path) -> (bool, bool, bool, bool) {
    let file = open_rw(path);
    let fd = file.as_raw_fd();
    (
        fileops::has_xattr(fd, TierXattr::Stub).unwrap(),
        fileops::has_xattr(fd, TierXattr::ObjectId).unwrap(),
        fileops::has_xattr(fd, TierXattr::Stat).unwrap(),
        fileops::has_xattr(fd, TierXattr::Locked).unwrap(),
    )
}

#[tokio::test]
async fn demote_then_promote_returns_identical_content() {
    let Some(dir) = scratch_dir() else { return };
    let (path, content) = cold_file(dir.path(), "x", 4096);

    let blocks_before = {
        let file = open_rw(&path);
        fileops::stat_fd(file.as_raw_fd()).unwrap().st_blocks
    };

    let store = Arc::new(MemoryStore::new());
    let migrator = Migrator::new(store.clone());

    let outcome = migrator.demote(&path).await.unwrap();
    assert_eq!(outcome, MigrateOutcome::Done);

    // Stub state: remote markers present, lock released, logical size kept,
    // data blocks freed.
    assert_eq!(xattr_set(&path), (true, true, true, false));
    let st = {
        let file = open_rw(&path);
        fileops::stat_fd(file.as_raw_fd()).unwrap()
    };
    assert_eq!(st.st_size, 4096);
    assert!(st.st_blocks <= blocks_before);

    // The remote object holds the original bytes under the derived id.
    let object_id = {
        use tierfs_storage::ObjectStore;
        store.object_id_for(&path)
    };
    assert_eq!(store.object(&object_id).unwrap(), content);

    let outcome = migrator.promote(&path).await.unwrap();
    assert_eq!(outcome, MigrateOutcome::Done);

    assert_eq!(xattr_set(&path), (false, false, false, false));
    assert_eq!(fs::read(&path).unwrap(), content);
}

#[tokio::test]
async fn demote_on_remote_file_is_a_noop() {
    let Some(dir) = scratch_dir() else { return };
    let (path, _) = cold_file(dir.path(), "x", 512);

    let store = Arc::new(MemoryStore::new());
    let migrator = Migrator::new(store.clone());

    assert_eq!(migrator.demote(&path).await.unwrap(), MigrateOutcome::Done);
    assert_eq!(migrator.demote(&path).await.unwrap(), MigrateOutcome::NoOp);

    // Exactly one upload happened.
    let uploads = store
        .calls()
        .iter()
        .filter(|c| c.starts_with("upload"))
        .count();
    assert_eq!(uploads, 1);
}

#[tokio::test]
async fn promote_on_local_file_is_a_noop() {
    let Some(dir) = scratch_dir() else { return };
    let (path, content) = cold_file(dir.path(), "x", 512);

    let migrator = Migrator::new(Arc::new(MemoryStore::new()));
    assert_eq!(migrator.promote(&path).await.unwrap(), MigrateOutcome::NoOp);
    assert_eq!(fs::read(&path).unwrap(), content);
}

#[tokio::test]
async fn locked_file_reports_contended_without_side_effects() {
    let Some(dir) = scratch_dir() else { return };
    let (path, content) = cold_file(dir.path(), "x", 1024);

    let holder = open_rw(&path);
    assert_eq!(
        fileops::try_lock(holder.as_raw_fd()).unwrap(),
        LockState::Acquired
    );

    let migrator = Migrator::new(Arc::new(MemoryStore::new()));
    assert_eq!(
        migrator.demote(&path).await.unwrap(),
        MigrateOutcome::Contended
    );

    // The loser changed nothing.
    assert_eq!(fs::read(&path).unwrap(), content);
    let fd = holder.as_raw_fd();
    assert!(!fileops::has_xattr(fd, TierXattr::Stub).unwrap());
    assert!(!fileops::has_xattr(fd, TierXattr::ObjectId).unwrap());

    fileops::unlock(fd).unwrap();
    assert_eq!(migrator.demote(&path).await.unwrap(), MigrateOutcome::Done);
}

#[tokio::test]
async fn only_one_concurrent_demotion_wins() {
    let Some(dir) = scratch_dir() else { return };
    let (path, _) = cold_file(dir.path(), "x", 2048);

    let store = Arc::new(MemoryStore::new());
    let migrator = Arc::new(Migrator::new(store));

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let migrator = Arc::clone(&migrator);
        let path = path.clone();
        tasks.push(tokio::spawn(async move { migrator.demote(&path).await }));
    }

    let mut done = 0;
    let mut benign = 0;
    for task in tasks {
        match task.await.unwrap().unwrap() {
            MigrateOutcome::Done => done += 1,
            MigrateOutcome::Contended | MigrateOutcome::NoOp => benign += 1,
        }
    }
    assert_eq!(done, 1);
    assert_eq!(benign, 3);
    assert_eq!(xattr_set(&path), (true, true, true, false));
}

#[tokio::test]
async fn failed_upload_rolls_back_to_a_plain_local_file() {
    let Some(dir) = scratch_dir() else { return };
    let (path, content) = cold_file(dir.path(), "x", 1024);

    let store = Arc::new(MemoryStore::new());
    store.fail_next_uploads(1);
    let migrator = Migrator::new(store.clone());

    assert!(migrator.demote(&path).await.is_err());
    assert_eq!(xattr_set(&path), (false, false, false, false));
    assert_eq!(fs::read(&path).unwrap(), content);
    assert_eq!(store.object_count(), 0);

    // The next attempt succeeds cleanly.
    assert_eq!(migrator.demote(&path).await.unwrap(), MigrateOutcome::Done);
}

#[tokio::test]
async fn failed_download_keeps_the_remote_state() {
    let Some(dir) = scratch_dir() else { return };
    let (path, _) = cold_file(dir.path(), "x", 1024);

    let store = Arc::new(MemoryStore::new());
    let migrator = Migrator::new(store.clone());
    migrator.demote(&path).await.unwrap();

    store.fail_next_downloads(1);
    assert!(migrator.promote(&path).await.is_err());

    // Still a stub, still unlocked, retryable.
    assert_eq!(xattr_set(&path), (true, true, true, false));
    assert_eq!(migrator.promote(&path).await.unwrap(), MigrateOutcome::Done);
}

#[test]
fn unlock_after_try_lock_restores_the_xattr_set() {
    let Some(dir) = scratch_dir() else { return };
    let (path, _) = cold_file(dir.path(), "x", 64);

    let file = open_rw(&path);
    let fd = file.as_raw_fd();
    fileops::set_xattr(fd, TierXattr::ObjectId, b"some-id", SetMode::CreateOnly).unwrap();

    assert_eq!(fileops::try_lock(fd).unwrap(), LockState::Acquired);
    assert_eq!(
        fileops::try_lock(fd).unwrap(),
        LockState::AlreadyLocked
    );
    fileops::unlock(fd).unwrap();

    let mut buf = [0u8; 64];
    let len = fileops::get_xattr(fd, TierXattr::ObjectId, &mut buf)
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..len], b"some-id");
    assert!(!fileops::has_xattr(fd, TierXattr::Locked).unwrap());
}

#[test]
fn crash_between_stub_and_truncate_is_repaired() {
    let Some(dir) = scratch_dir() else { return };
    let (path, content) = cold_file(dir.path(), "x", 4096);

    // Simulate the crash window: remote markers set, data never truncated.
    {
        let file = open_rw(&path);
        let fd = file.as_raw_fd();
        fileops::set_xattr(fd, TierXattr::ObjectId, b"x-id", SetMode::CreateOnly).unwrap();
        fileops::set_xattr(fd, TierXattr::Stub, &[], SetMode::CreateOnly).unwrap();
    }

    let action = repair::repair_file(&path).unwrap();
    assert_eq!(action, Some(RepairAction::ClearedRemoteMarkers));
    assert_eq!(xattr_set(&path), (false, false, false, false));
    assert_eq!(fs::read(&path).unwrap(), content);
}

#[test]
fn stale_object_id_without_stub_is_repaired() {
    let Some(dir) = scratch_dir() else { return };
    let (path, _) = cold_file(dir.path(), "x", 256);

    {
        let file = open_rw(&path);
        fileops::set_xattr(
            file.as_raw_fd(),
            TierXattr::ObjectId,
            b"dangling",
            SetMode::CreateOnly,
        )
        .unwrap();
    }

    let action = repair::repair_file(&path).unwrap();
    assert_eq!(action, Some(RepairAction::ClearedStaleMetadata));
    assert_eq!(xattr_set(&path), (false, false, false, false));
}

#[test]
fn fresh_lock_is_left_alone() {
    let Some(dir) = scratch_dir() else { return };
    let (path, _) = cold_file(dir.path(), "x", 256);

    let holder = open_rw(&path);
    fileops::try_lock(holder.as_raw_fd()).unwrap();

    assert_eq!(repair::repair_file(&path).unwrap(), None);
    assert!(fileops::has_xattr(holder.as_raw_fd(), TierXattr::Locked).unwrap());
}

#[test]
fn consistent_files_need_no_repair() {
    let Some(dir) = scratch_dir() else { return };
    let (path, _) = cold_file(dir.path(), "x", 256);

    assert_eq!(repair::repair_file(&path).unwrap(), None);
    assert_eq!(xattr_set(&path), (false, false, false, false));
}
