//! Keyed durable records: the native stand-in for browser local storage.
//!
//! Each key holds one JSON document that is overwritten wholesale. The
//! session record, persisted cookies and the pending external-login marker
//! all live here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};

pub trait RecordStorage: Send + Sync {
    /// Read the record stored under `key`, if any.
    fn load(&self, key: &str) -> Result<Option<String>>;

    /// Replace the record stored under `key`.
    fn save(&self, key: &str, contents: &str) -> Result<()>;

    /// Erase the record stored under `key`. Missing records are not an error.
    fn remove(&self, key: &str) -> Result<()>;
}

/// One `<key>.json` file per record inside a directory.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl RecordStorage for FileStorage {
    fn load(&self, key: &str) -> Result<Option<String>> {
        let path = self.record_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read record file: {}", key))?;
        Ok(Some(contents))
    }

    fn save(&self, key: &str, contents: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create data directory {}", self.dir.display()))?;
        let path = self.record_path(key);
        // Write-then-rename so a crash never leaves a half-written record.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)
            .with_context(|| format!("Failed to write record file: {}", key))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace record file: {}", key))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.record_path(key);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove record file: {}", key))?;
        }
        Ok(())
    }
}

/// Process-local storage, used for ephemeral sessions and in tests.
#[derive(Default)]
pub struct MemoryStorage {
    records: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RecordStorage for MemoryStorage {
    fn load(&self, key: &str) -> Result<Option<String>> {
        Ok(self.records().get(key).cloned())
    }

    fn save(&self, key: &str, contents: &str) -> Result<()> {
        self.records().insert(key.to_string(), contents.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.records().remove(key);
        Ok(())
    }
}
