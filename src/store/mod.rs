use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::SyncError;

/// Keys are namespaced `component.name` strings so unrelated features can
/// share one store without colliding.
pub mod keys {
    pub const PENDING_OPERATIONS: &str = "queue.pending";
    pub const LAST_POSITION: &str = "tracker.last_position";
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, SyncError>;
    async fn put(&self, key: &str, value: String) -> Result<(), SyncError>;
    async fn remove(&self, key: &str) -> Result<(), SyncError>;
}

#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<(), SyncError> {
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), SyncError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

/// Single-file JSON store. Writes go to a sibling tmp file first and are
/// renamed into place so a crash mid-write never truncates existing state.
pub struct FileKvStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileKvStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let path = path.into();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|err| SyncError::Storage(format!("corrupt store {}: {err}", path.display())))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => {
                return Err(SyncError::Storage(format!(
                    "read {}: {err}",
                    path.display()
                )))
            }
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    async fn persist(&self, entries: &HashMap<String, String>) -> Result<(), SyncError> {
        let body = serde_json::to_vec_pretty(entries)
            .map_err(|err| SyncError::Storage(format!("serialize store: {err}")))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|err| SyncError::Storage(format!("write {}: {err}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|err| SyncError::Storage(format!("rename {}: {err}", self.path.display())))
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<(), SyncError> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), value);
        self.persist(&entries).await
    }

    async fn remove(&self, key: &str) -> Result<(), SyncError> {
        let mut entries = self.entries.lock().await;
        entries.remove(key);
        self.persist(&entries).await
    }
}
