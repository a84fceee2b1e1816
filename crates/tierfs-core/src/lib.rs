//! Core types shared by every tierfs crate: the error taxonomy, the daemon
//! configuration record and its file format, and the program identity used
//! for on-disk and shared-memory names.

pub mod config;
pub mod error;

pub use config::{Config, TransferProtocol};
pub use error::{TierError, TierResult};

/// Fixed program identifier. Extended attributes live under
/// `user.tierfs.<name>` and the shared promotion queue is backed by the
/// POSIX shared-memory object `/tierfs`.
pub const PROGRAM_NAME: &str = "tierfs";
