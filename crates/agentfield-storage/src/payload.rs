//! [`PayloadStore`] implementations: an in-memory default (tests, and any
//! run where losing spilled payloads on restart is acceptable) and a
//! filesystem-backed one for a real deployment, grounded on the pack's
//! `FilesystemBlobStorage` (`queue-keeper-core::adapters`).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::{PayloadStore, StorageError};

#[derive(Default)]
pub struct InMemoryPayloadStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryPayloadStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PayloadStore for InMemoryPayloadStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<String, StorageError> {
        let uri = format!("mem://{}", Uuid::new_v4());
        self.blobs.lock().unwrap().insert(uri.clone(), bytes);
        Ok(uri)
    }

    async fn get(&self, uri: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.blobs.lock().unwrap().get(uri).cloned())
    }
}

/// Stores each payload as one file under `base_dir`, named by a random
/// UUID. `base_dir` is created on first use if missing.
pub struct FsPayloadStore {
    base_dir: PathBuf,
}

impl FsPayloadStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.base_dir.join(format!("{id}.bin"))
    }
}

#[async_trait]
impl PayloadStore for FsPayloadStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<String, StorageError> {
        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let id = Uuid::new_v4();
        let path = self.path_for(id);
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(format!("file://{}", path.display()))
    }

    async fn get(&self, uri: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let Some(path) = uri.strip_prefix("file://") else {
            return Err(StorageError::Backend(format!("not a file:// uri: {uri}")));
        };
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Backend(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_round_trips() {
        let store = InMemoryPayloadStore::new();
        let uri = store.put(b"hello".to_vec()).await.unwrap();
        assert!(uri.starts_with("mem://"));
        assert_eq!(store.get(&uri).await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(store.get("mem://missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn fs_store_round_trips() {
        let dir = std::env::temp_dir().join(format!("agentfield-payload-test-{}", Uuid::new_v4()));
        let store = FsPayloadStore::new(&dir);
        let uri = store.put(b"spilled".to_vec()).await.unwrap();
        assert!(uri.starts_with("file://"));
        assert_eq!(store.get(&uri).await.unwrap(), Some(b"spilled".to_vec()));

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
