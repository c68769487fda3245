//! Entry persistence.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::Result;
use crate::domain::WatchEntry;

/// Loads and saves the full entry list.
#[async_trait]
pub trait EntryStore: Send + Sync {
    async fn load(&self) -> Result<Vec<WatchEntry>>;
    async fn save(&self, entries: &[WatchEntry]) -> Result<()>;
}

/// Entries as a pretty-printed JSON array, written atomically via a temp file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EntryStore for JsonFileStore {
    async fn load(&self) -> Result<Vec<WatchEntry>> {
        if !tokio::fs::try_exists(&self.path).await? {
            debug!(path = %self.path.display(), "No entry file, starting empty");
            return Ok(Vec::new());
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    async fn save(&self, entries: &[WatchEntry]) -> Result<()> {
        let json = serde_json::to_string_pretty(entries)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, &json).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;

        debug!(path = %self.path.display(), count = entries.len(), "Entries persisted");
        Ok(())
    }
}

/// In-memory store, for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<Vec<WatchEntry>>,
    saves: Mutex<usize>,
}

impl MemoryStore {
    pub fn with_entries(entries: Vec<WatchEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
            saves: Mutex::new(0),
        }
    }

    /// How many times `save` was called.
    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }

    pub fn entries(&self) -> Vec<WatchEntry> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl EntryStore for MemoryStore {
    async fn load(&self) -> Result<Vec<WatchEntry>> {
        Ok(self.entries.lock().clone())
    }

    async fn save(&self, entries: &[WatchEntry]) -> Result<()> {
        *self.entries.lock() = entries.to_vec();
        *self.saves.lock() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_json_store_persists_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("data").join("entries.json"));

        assert!(store.load().await.unwrap().is_empty());

        let entry = WatchEntry::new("https://live.example.com/1", "One", 300);
        store.save(std::slice::from_ref(&entry)).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, entry.id);
        assert!(!store.path().with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_json_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entries.json");
        std::fs::write(&path, "not json").unwrap();

        let err = JsonFileStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, crate::Error::Serialization(_)));
    }
}
