//! Filesystem scanner: walks the mount point and feeds demotion candidates
//! into the demotion queue.
//!
//! The walk stays on one filesystem, never follows symlinks, and keeps at
//! most half of the descriptor rlimit open. A file is a candidate iff it is
//! a regular, local, unlocked file whose `atime` is at least the eviction
//! age old. Candidates are offered to the queue without blocking; a full
//! queue just defers the file to the next scan.
//!
//! Scanning is gated by the occupancy watermarks: eviction turns on when
//! the mount is at least `demote_start_rate` full and off again once it
//! drains to `demote_stop_rate`.

use std::ffi::CString;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tierfs_core::{Config, TierError, TierResult};
use tierfs_queue::Queue;
use tierfs_storage::fileops::{self, TierXattr};
use tierfs_storage::repair;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Counters for one scan pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScanStats {
    /// Candidates handed to the demotion queue.
    pub enqueued: u64,
    /// Candidates skipped because the queue was full.
    pub deferred: u64,
    /// Files repaired from an inconsistent state.
    pub repaired: u64,
    /// Per-file errors (logged and skipped).
    pub errors: u64,
    /// True when the watermark gate kept this pass from enqueueing.
    pub idle: bool,
}

/// Periodic filesystem scanner.
pub struct Scanner {
    config: Arc<Config>,
    demote_queue: Arc<Queue>,
    token: CancellationToken,
    evicting: bool,
}

impl Scanner {
    /// Creates a scanner feeding `demote_queue`.
    #[must_use]
    pub fn new(config: Arc<Config>, demote_queue: Arc<Queue>, token: CancellationToken) -> Self {
        Self {
            config,
            demote_queue,
            token,
            evicting: false,
        }
    }

    /// Scan loop: runs until cancelled or the consecutive-failure bound is
    /// exceeded. Each pass is followed by a sleep topping the elapsed time
    /// up to the configured interval.
    pub fn run(mut self) {
        info!(mount = %self.config.fs_mount_point.display(), "scanner started");
        let mut consecutive_failures: i64 = 0;

        while !self.token.is_cancelled() {
            let started = Instant::now();
            match self.scan_once() {
                Ok(stats) => {
                    consecutive_failures = 0;
                    debug!(
                        enqueued = stats.enqueued,
                        deferred = stats.deferred,
                        repaired = stats.repaired,
                        errors = stats.errors,
                        idle = stats.idle,
                        "scan pass finished"
                    );
                }
                Err(err) => {
                    consecutive_failures += 1;
                    error!(
                        error = %err,
                        failures = consecutive_failures,
                        "filesystem scan failed"
                    );
                    if self.config.scan_max_fails >= 0
                        && consecutive_failures > self.config.scan_max_fails
                    {
                        error!(
                            limit = self.config.scan_max_fails,
                            "scanner exceeded its failure bound, giving up"
                        );
                        return;
                    }
                }
            }

            let elapsed = started.elapsed();
            let interval = self.config.scan_interval();
            if elapsed < interval {
                self.sleep_cancellable(interval - elapsed);
            }
        }
        info!("scanner stopped");
    }

    /// One scan pass over the mount point.
    ///
    /// # Errors
    ///
    /// Whole-scan failures only: occupancy probe or rlimit probe errors.
    /// Per-file errors are counted in the returned stats.
    pub fn scan_once(&mut self) -> TierResult<ScanStats> {
        let mut stats = ScanStats::default();

        let occupancy = occupancy(&self.config.fs_mount_point)?;
        self.apply_watermarks(occupancy);
        if !self.evicting {
            stats.idle = true;
            return Ok(stats);
        }

        let now = now_secs();
        let walker = WalkDir::new(&self.config.fs_mount_point)
            .follow_links(false)
            .same_file_system(true)
            .max_open(descriptor_budget()?);

        for entry in walker {
            if self.token.is_cancelled() {
                break;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    stats.errors += 1;
                    debug!(error = %err, "cannot visit directory entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            match self.consider(entry.path(), now) {
                Ok(Candidate::Enqueued) => stats.enqueued += 1,
                Ok(Candidate::Deferred) => stats.deferred += 1,
                Ok(Candidate::Repaired) => stats.repaired += 1,
                Ok(Candidate::Skipped) => {}
                Err(err) => {
                    stats.errors += 1;
                    debug!(path = %entry.path().display(), error = %err, "cannot examine file");
                }
            }
        }

        Ok(stats)
    }

    /// Watermark hysteresis: start evicting at or above the start rate,
    /// stop at or below the stop rate.
    fn apply_watermarks(&mut self, occupancy: f64) {
        if !self.evicting && occupancy >= self.config.demote_start_rate {
            self.evicting = true;
            info!(occupancy, "local tier above start watermark, eviction active");
        } else if self.evicting && occupancy <= self.config.demote_stop_rate {
            self.evicting = false;
            info!(occupancy, "local tier below stop watermark, eviction idle");
        }
    }

    fn consider(&self, path: &Path, now: u64) -> TierResult<Candidate> {
        let record_len = path.as_os_str().as_bytes().len() + 1;
        if record_len > self.config.path_max {
            warn!(path = %path.display(), "path exceeds PathMax, skipping");
            return Ok(Candidate::Skipped);
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| TierError::file_op("open", err))?;
        let fd = file.as_raw_fd();

        if !fileops::is_regular_fd(fd)? {
            return Ok(Candidate::Skipped);
        }

        if fileops::has_xattr(fd, TierXattr::Locked)? {
            // A live migration, or a stale lock for repair to judge.
            if repair::repair_open_file(&file, path)?.is_some() {
                return Ok(Candidate::Repaired);
            }
            return Ok(Candidate::Skipped);
        }

        if !fileops::is_local_fd(fd)? {
            // Remote files are not candidates, but a crash may have left
            // data behind; hand those to repair.
            if repair::repair_open_file(&file, path)?.is_some() {
                return Ok(Candidate::Repaired);
            }
            return Ok(Candidate::Skipped);
        }

        if fileops::has_xattr(fd, TierXattr::ObjectId)? {
            if repair::repair_open_file(&file, path)?.is_some() {
                return Ok(Candidate::Repaired);
            }
            return Ok(Candidate::Skipped);
        }

        let st = fileops::stat_fd(fd)?;
        let age = now.saturating_sub(st.st_atime.max(0) as u64);
        if age < self.config.eviction_age_sec {
            return Ok(Candidate::Skipped);
        }

        let mut record = Vec::with_capacity(record_len);
        record.extend_from_slice(path.as_os_str().as_bytes());
        record.push(0);

        match self.demote_queue.try_push(&record) {
            Ok(()) => Ok(Candidate::Enqueued),
            Err(TierError::WouldBlock) => {
                debug!(path = %path.display(), "demotion queue full, deferring");
                Ok(Candidate::Deferred)
            }
            Err(err) => Err(err),
        }
    }

    fn sleep_cancellable(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.token.is_cancelled() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            std::thread::sleep(remaining.min(Duration::from_millis(200)));
        }
    }
}

enum Candidate {
    Enqueued,
    Deferred,
    Repaired,
    Skipped,
}

/// Used fraction of the filesystem holding `path`.
fn occupancy(path: &Path) -> TierResult<f64> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| TierError::invalid("mount point contains an interior NUL byte"))?;
    let mut vfs = std::mem::MaybeUninit::<libc::statvfs>::uninit();
    if unsafe { libc::statvfs(cpath.as_ptr(), vfs.as_mut_ptr()) } != 0 {
        return Err(TierError::last_os_error("statvfs"));
    }
    let vfs = unsafe { vfs.assume_init() };
    if vfs.f_blocks == 0 {
        return Err(TierError::invalid("mount reports zero total blocks"));
    }
    Ok((vfs.f_blocks - vfs.f_bavail) as f64 / vfs.f_blocks as f64)
}

/// Half the descriptor rlimit, the walk's simultaneous-open budget.
fn descriptor_budget() -> TierResult<usize> {
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) } != 0 {
        return Err(TierError::last_os_error("getrlimit"));
    }
    if rlim.rlim_cur <= 2 {
        return Err(TierError::resource_exhausted(
            "fewer than two file descriptors available for scanning",
        ));
    }
    Ok((rlim.rlim_cur / 2) as usize)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanner_with_rates(start: f64, stop: f64) -> Scanner {
        let mut config = Config::default();
        config.demote_start_rate = start;
        config.demote_stop_rate = stop;
        Scanner::new(
            Arc::new(config),
            Arc::new(Queue::init(4, 64, None).unwrap()),
            CancellationToken::new(),
        )
    }

    #[test]
    fn watermarks_form_a_hysteresis_loop() {
        let mut scanner = scanner_with_rates(0.8, 0.7);
        assert!(!scanner.evicting);

        scanner.apply_watermarks(0.75);
        assert!(!scanner.evicting);

        scanner.apply_watermarks(0.8);
        assert!(scanner.evicting);

        // Stays active in the band between the watermarks.
        scanner.apply_watermarks(0.75);
        assert!(scanner.evicting);

        scanner.apply_watermarks(0.7);
        assert!(!scanner.evicting);
    }

    #[test]
    fn occupancy_is_a_fraction() {
        let occupancy = occupancy(Path::new("/")).unwrap();
        assert!((0.0..=1.0).contains(&occupancy));
    }

    #[test]
    fn descriptor_budget_is_positive() {
        assert!(descriptor_budget().unwrap() > 0);
    }
}
