//! In-memory [`ObjectStore`] used by tests.
//!
//! Stores objects in a map, records every call, and can inject a bounded
//! number of failures per operation so rollback paths can be exercised.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tierfs_core::{TierError, TierResult};

/// In-memory object store with call history and failure injection.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    calls: Mutex<Vec<String>>,
    fail_uploads: AtomicU32,
    fail_downloads: AtomicU32,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a stored object's content.
    #[must_use]
    pub fn object(&self, object_id: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(object_id).cloned()
    }

    /// Seeds an object directly.
    pub fn insert_object(&self, object_id: impl Into<String>, data: Vec<u8>) {
        self.objects.lock().unwrap().insert(object_id.into(), data);
    }

    /// Number of stored objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Operations performed so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Makes the next `n` uploads fail.
    pub fn fail_next_uploads(&self, n: u32) {
        self.fail_uploads.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` downloads fail.
    pub fn fail_next_downloads(&self, n: u32) {
        self.fail_downloads.store(n, Ordering::SeqCst);
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn should_fail(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl super::ObjectStore for MemoryStore {
    async fn connect(&self) -> TierResult<()> {
        self.record("connect".to_string());
        Ok(())
    }

    async fn disconnect(&self) {
        self.record("disconnect".to_string());
    }

    async fn upload(&self, file: &File, object_id: &str) -> TierResult<()> {
        self.record(format!("upload {object_id}"));
        if Self::should_fail(&self.fail_uploads) {
            return Err(TierError::object_store("injected upload failure"));
        }

        let mut reader = file;
        reader
            .seek(SeekFrom::Start(0))
            .map_err(|err| TierError::file_op("lseek", err))?;
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .map_err(|err| TierError::file_op("read", err))?;

        self.objects
            .lock()
            .unwrap()
            .insert(object_id.to_string(), data);
        Ok(())
    }

    async fn download(&self, file: &File, object_id: &str) -> TierResult<()> {
        self.record(format!("download {object_id}"));
        if Self::should_fail(&self.fail_downloads) {
            return Err(TierError::object_store("injected download failure"));
        }

        let data = self
            .object(object_id)
            .ok_or_else(|| TierError::ObjectNotFound {
                object_id: object_id.to_string(),
            })?;

        let mut writer = file;
        writer
            .seek(SeekFrom::Start(0))
            .map_err(|err| TierError::file_op("lseek", err))?;
        writer
            .write_all(&data)
            .map_err(|err| TierError::file_op("write", err))?;
        file.set_len(data.len() as u64)
            .map_err(|err| TierError::file_op("ftruncate", err))?;
        writer
            .flush()
            .map_err(|err| TierError::file_op("write", err))?;
        Ok(())
    }

    fn object_id_for(&self, path: &Path) -> String {
        super::reversed_object_id(path, 1024)
    }

    fn object_id_max_len(&self) -> usize {
        1024
    }
}

#[cfg(test)]
mod tests {
    use super::super::ObjectStore;
    use super::*;

    #[tokio::test]
    async fn failure_injection_is_bounded() {
        let store = MemoryStore::new();
        store.fail_next_uploads(1);

        let file = tempfile::tempfile().unwrap();
        assert!(store.upload(&file, "id").await.is_err());
        assert!(store.upload(&file, "id").await.is_ok());
    }

    #[tokio::test]
    async fn records_calls_in_order() {
        let store = MemoryStore::new();
        store.connect().await.unwrap();
        let file = tempfile::tempfile().unwrap();
        store.upload(&file, "a").await.unwrap();

        assert_eq!(store.calls(), vec!["connect".to_string(), "upload a".to_string()]);
    }

    #[tokio::test]
    async fn download_of_missing_object_is_not_found() {
        let store = MemoryStore::new();
        let file = tempfile::tempfile().unwrap();
        let err = store.download(&file, "nope").await.unwrap_err();
        assert!(matches!(err, TierError::ObjectNotFound { .. }));
    }
}
