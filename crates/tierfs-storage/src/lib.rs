//! Storage layer of the tiering daemon: xattr-anchored per-file state,
//! transactional demotion/promotion, crash repair, and the remote
//! object-store adapters.
//!
//! The persistent per-file state lives in four extended attributes under
//! `user.tierfs.*`; see [`fileops`] for the state machine primitives and
//! [`migrate`] for the transactional transitions between the local and
//! remote states.

pub mod fileops;
pub mod migrate;
pub mod object_store;
pub mod repair;

pub use migrate::{MigrateOutcome, Migrator};
pub use object_store::{MemoryStore, ObjectStore, S3Store};
pub use repair::RepairAction;
