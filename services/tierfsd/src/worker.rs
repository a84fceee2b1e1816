//! Transfer workers: consume prioritized queue pairs and drive the
//! migrator.
//!
//! A worker always drains its primary queue first and falls back to the
//! secondary only when the primary is empty. Idle waits are bounded so the
//! cancellation token is observed at every dequeue boundary even when both
//! queues stay empty. Failures are counted per worker and summarized
//! periodically instead of being escalated one by one.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tierfs_core::TierError;
use tierfs_queue::Queue;
use tierfs_storage::{MigrateOutcome, Migrator};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Which migrator operation this worker performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local to remote.
    Demote,
    /// Remote to local.
    Promote,
}

/// One failure summary per this many failures.
const FAILURE_SUMMARY_EVERY: u64 = 1024;

/// Bound on an idle wait, so cancellation and primary-queue arrivals are
/// noticed promptly.
const IDLE_POLL: Duration = Duration::from_millis(500);

/// Queue-consuming migration worker.
pub struct Worker {
    name: &'static str,
    direction: Direction,
    primary: Option<Arc<Queue>>,
    secondary: Arc<Queue>,
    migrator: Arc<Migrator>,
    token: CancellationToken,
    handle: Handle,
    path_max: usize,
}

impl Worker {
    /// Creates a worker consuming `(primary, secondary)` with strict
    /// priority. `handle` is the runtime used for the migrator's async I/O.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        name: &'static str,
        direction: Direction,
        primary: Option<Arc<Queue>>,
        secondary: Arc<Queue>,
        migrator: Arc<Migrator>,
        token: CancellationToken,
        handle: Handle,
        path_max: usize,
    ) -> Self {
        Self {
            name,
            direction,
            primary,
            secondary,
            migrator,
            token,
            handle,
            path_max,
        }
    }

    /// Worker loop: runs until cancelled.
    pub fn run(self) {
        info!(worker = self.name, "worker started");
        let mut buf = vec![0u8; self.path_max];
        let mut failures: u64 = 0;

        loop {
            if self.token.is_cancelled() {
                info!(worker = self.name, failures, "worker stopped");
                return;
            }

            let Some(len) = dequeue(self.primary.as_deref(), &self.secondary, &mut buf, IDLE_POLL)
            else {
                continue;
            };
            let path = decode_record(&buf[..len]);

            let result = self.handle.block_on(async {
                match self.direction {
                    Direction::Demote => self.migrator.demote(&path).await,
                    Direction::Promote => self.migrator.promote(&path).await,
                }
            });

            match result {
                Ok(MigrateOutcome::Done) => {}
                Ok(MigrateOutcome::NoOp | MigrateOutcome::Contended) => {
                    debug!(worker = self.name, path = %path.display(), "nothing to do");
                }
                Err(err) => {
                    failures += 1;
                    debug!(worker = self.name, path = %path.display(), error = %err, "migration failed");
                    if failures % FAILURE_SUMMARY_EVERY == 0 {
                        warn!(worker = self.name, failures, "accumulated migration failures");
                    }
                }
            }
        }
    }
}

/// Strict-priority dequeue: primary without blocking, then secondary, then
/// a bounded wait on the secondary. Returns the record length, or `None`
/// when the wait expired.
fn dequeue(
    primary: Option<&Queue>,
    secondary: &Queue,
    buf: &mut [u8],
    idle_poll: Duration,
) -> Option<usize> {
    if let Some(primary) = primary {
        match primary.try_pop(buf) {
            Ok(len) => return Some(len),
            Err(TierError::WouldBlock) => {}
            Err(err) => {
                warn!(error = %err, "primary queue pop failed");
                return None;
            }
        }
    }
    match secondary.try_pop(buf) {
        Ok(len) => return Some(len),
        Err(TierError::WouldBlock) => {}
        Err(err) => {
            warn!(error = %err, "secondary queue pop failed");
            return None;
        }
    }
    match secondary.pop_timeout(buf, idle_poll) {
        Ok(len) => Some(len),
        Err(TierError::WouldBlock) => None,
        Err(err) => {
            warn!(error = %err, "secondary queue pop failed");
            None
        }
    }
}

/// Strips the NUL terminator from a queued record and rebuilds the path.
fn decode_record(record: &[u8]) -> PathBuf {
    let bytes = match record.last() {
        Some(0) => &record[..record.len() - 1],
        _ => record,
    };
    PathBuf::from(OsStr::from_bytes(bytes))
}
