//! Supervisor: builds the queues and the object store, starts the worker
//! tasks, and tears everything down on shutdown.
//!
//! The promotion primary queue lives in a named shared-memory object so an
//! interposition layer in another process can enqueue promotion requests
//! when a stub is opened; every other queue is process-private. Workers
//! run on blocking threads and observe a shared cancellation token; on
//! shutdown the supervisor cancels and then waits a bounded time, reporting
//! any worker that fails to join as wedged.

use std::sync::Arc;
use std::time::Duration;

use tierfs_core::{Config, TierError, TierResult, PROGRAM_NAME};
use tierfs_queue::Queue;
use tierfs_storage::{object_store, Migrator};
use tokio::runtime::Handle;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::scanner::Scanner;
use crate::worker::{Direction, Worker};

/// How long workers get to wind down after cancellation.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs the daemon until a shutdown signal arrives or a worker dies.
///
/// # Errors
///
/// Initialization failures (`ResourceExhausted`, `ConfigInvalid`,
/// `ObjectStore`) and `Internal` when a worker exits unexpectedly or fails
/// to stop within the shutdown timeout.
pub async fn run(config: Config) -> TierResult<()> {
    config.validate()?;
    let config = Arc::new(config);

    let shm_name = format!("/{PROGRAM_NAME}");
    let promote_primary = Arc::new(Queue::init(
        config.primary_promote_qsize,
        config.path_max,
        Some(&shm_name),
    )?);
    let promote_secondary = Arc::new(Queue::init(
        config.secondary_promote_qsize,
        config.path_max,
        None,
    )?);
    let demote_primary = Arc::new(Queue::init(
        config.primary_demote_qsize,
        config.path_max,
        None,
    )?);
    let demote_secondary = Arc::new(Queue::init(
        config.secondary_demote_qsize,
        config.path_max,
        None,
    )?);

    let store = object_store::from_config(&config)?;
    store.connect().await?;
    let migrator = Arc::new(Migrator::new(Arc::clone(&store)));

    let token = CancellationToken::new();
    let handle = Handle::current();
    let mut workers: JoinSet<&'static str> = JoinSet::new();

    {
        let scanner = Scanner::new(
            Arc::clone(&config),
            Arc::clone(&demote_secondary),
            token.clone(),
        );
        workers.spawn_blocking(move || {
            scanner.run();
            "scanner"
        });
    }
    {
        let worker = Worker::new(
            "demotion",
            Direction::Demote,
            Some(Arc::clone(&demote_primary)),
            Arc::clone(&demote_secondary),
            Arc::clone(&migrator),
            token.clone(),
            handle.clone(),
            config.path_max,
        );
        workers.spawn_blocking(move || {
            worker.run();
            "demotion"
        });
    }
    {
        let worker = Worker::new(
            "promotion",
            Direction::Promote,
            Some(Arc::clone(&promote_primary)),
            Arc::clone(&promote_secondary),
            Arc::clone(&migrator),
            token.clone(),
            handle,
            config.path_max,
        );
        workers.spawn_blocking(move || {
            worker.run();
            "promotion"
        });
    }

    info!(shm = %shm_name, "tiering daemon running");

    let mut unexpected_exit = false;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        Some(result) = workers.join_next() => {
            unexpected_exit = true;
            match result {
                Ok(name) => error!(worker = name, "worker exited unexpectedly"),
                Err(err) => error!(error = %err, "worker panicked"),
            }
        }
    }

    token.cancel();
    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        while let Some(result) = workers.join_next().await {
            if let Err(err) = result {
                error!(error = %err, "worker panicked during shutdown");
            }
        }
    })
    .await;

    store.disconnect().await;

    if drained.is_err() {
        error!(wedged = workers.len(), "workers failed to stop in time");
        return Err(TierError::internal(format!(
            "{} worker(s) wedged at shutdown",
            workers.len()
        )));
    }
    if unexpected_exit {
        return Err(TierError::internal("a worker exited unexpectedly"));
    }

    info!("tiering daemon stopped");
    Ok(())
}
