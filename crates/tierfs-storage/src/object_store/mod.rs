//! Remote object-store adapters.
//!
//! [`ObjectStore`] is the uniform interface the migrator drives; concrete
//! backends are resolved from the `RemoteStoreProtocol` config option
//! through a small name-to-constructor table. S3 is the only wire protocol;
//! [`MemoryStore`] exists for tests.

mod memory;
mod s3;

pub use memory::MemoryStore;
pub use s3::S3Store;

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tierfs_core::{Config, TierError, TierResult};

/// Uniform interface over remote storage backends.
///
/// Implementations must be thread-safe; a single instance is shared by all
/// workers. `upload`/`download` stream through the caller's descriptor and
/// must duplicate it internally so that closing their own stream does not
/// invalidate it.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Establishes and verifies access to the remote store. Called once at
    /// startup, before any transfer.
    ///
    /// # Errors
    ///
    /// `ObjectStore` if the backend is unreachable or rejects the
    /// configuration.
    async fn connect(&self) -> TierResult<()>;

    /// Gracefully releases the backend connection.
    async fn disconnect(&self);

    /// Uploads the file's content under `object_id`, overwriting any
    /// existing object.
    ///
    /// # Errors
    ///
    /// `ObjectStore` for non-retryable backend failures, `FileOp` if the
    /// descriptor cannot be duplicated or read.
    async fn upload(&self, file: &File, object_id: &str) -> TierResult<()>;

    /// Downloads the object `object_id` into the file, from offset zero.
    ///
    /// # Errors
    ///
    /// `ObjectNotFound` if no such object exists; `ObjectStore` for other
    /// backend failures; `FileOp` if the descriptor cannot be written.
    async fn download(&self, file: &File, object_id: &str) -> TierResult<()>;

    /// Deterministic, bounded remote key for a path.
    fn object_id_for(&self, path: &Path) -> String;

    /// Upper bound on the length of any key this backend accepts.
    fn object_id_max_len(&self) -> usize;
}

type Constructor = fn(&Config) -> TierResult<Arc<dyn ObjectStore>>;

/// Supported protocol tags and their constructors.
const REGISTRY: &[(&str, Constructor)] = &[("s3", make_s3)];

fn make_s3(config: &Config) -> TierResult<Arc<dyn ObjectStore>> {
    Ok(Arc::new(S3Store::from_config(config)?))
}

/// Resolves the configured remote protocol to a store instance.
///
/// # Errors
///
/// `ConfigInvalid` if the protocol tag is unknown, plus whatever the
/// backend constructor rejects.
pub fn from_config(config: &Config) -> TierResult<Arc<dyn ObjectStore>> {
    let constructor = REGISTRY
        .iter()
        .find(|(name, _)| *name == config.remote_protocol)
        .map(|(_, constructor)| constructor)
        .ok_or_else(|| {
            TierError::config_invalid(format!(
                "unsupported remote store protocol `{}`",
                config.remote_protocol
            ))
        })?;
    constructor(config)
}

/// Default object-id derivation: the path reversed with `/` replaced by
/// `-`, truncated to `max_len` bytes. Deterministic and bounded; collision
/// handling is the caller's concern.
#[must_use]
pub fn reversed_object_id(path: &Path, max_len: usize) -> String {
    let text = path.to_string_lossy();
    let mut id = String::with_capacity(text.len().min(max_len));
    for c in text.chars().rev() {
        let c = if c == '/' { '-' } else { c };
        if id.len() + c.len_utf8() > max_len {
            break;
        }
        id.push(c);
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn reversed_object_id_reverses_and_substitutes() {
        let id = reversed_object_id(&PathBuf::from("/mnt/data/x"), 1024);
        assert_eq!(id, "x-atad-tnm-");
    }

    #[test]
    fn reversed_object_id_is_bounded() {
        let long = "/a".repeat(2000);
        let id = reversed_object_id(&PathBuf::from(long), 1024);
        assert_eq!(id.len(), 1024);
    }

    #[test]
    fn reversed_object_id_is_deterministic() {
        let path = PathBuf::from("/mnt/data/some/deep/file.bin");
        assert_eq!(
            reversed_object_id(&path, 1024),
            reversed_object_id(&path, 1024)
        );
    }

    #[test]
    fn registry_resolves_s3() {
        let mut config = Config::default();
        config.remote_protocol = "s3".to_string();
        config.s3_endpoint = "localhost:9000".to_string();
        config.s3_bucket = "tierfs-test".to_string();
        config.s3_access_key = "ak".to_string();
        config.s3_secret_key = "sk".to_string();

        let store = from_config(&config).unwrap();
        assert_eq!(store.object_id_max_len(), 1024);
    }

    #[test]
    fn registry_rejects_unknown_protocol() {
        let mut config = Config::default();
        config.remote_protocol = "gopher".to_string();

        match from_config(&config) {
            Err(err) => assert!(matches!(err, TierError::ConfigInvalid { .. })),
            Ok(_) => panic!("expected ConfigInvalid error"),
        }
    }
}
