//! Durable key to artifact storage behind the cache.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::core::cache::CacheEntry;
use crate::core::error::StorageError;

/// Durable mapping from signature key to cache entry.
///
/// Writes must be atomic: a reader sees either the previous entry or the new one.
pub trait ArtifactStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError>;
    fn put(&self, entry: &CacheEntry) -> Result<(), StorageError>;
    fn delete(&self, key: &str) -> Result<(), StorageError>;
    fn keys(&self) -> Result<Vec<String>, StorageError>;
}

/// One JSON file per entry under a directory (`<dir>/<key>.json`).
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

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric())
}

impl ArtifactStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        if !is_valid_key(key) {
            return Ok(None);
        }
        let path = self.path_for(key);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&text)?))
    }

    fn put(&self, entry: &CacheEntry) -> Result<(), StorageError> {
        if !is_valid_key(&entry.key) {
            return Err(StorageError::Unavailable(format!("invalid key '{}'", entry.key)));
        }
        fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(entry)?;
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", entry.key, uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, json)?;
        if let Err(e) = fs::rename(&tmp, self.path_for(&entry.key)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        if !is_valid_key(key) {
            return Ok(());
        }
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let dir = match fs::read_dir(&self.dir) {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut keys = Vec::new();
        for item in dir {
            let name = item?.file_name().to_string_lossy().to_string();
            if let Some(key) = name.strip_suffix(".json") {
                if is_valid_key(key) {
                    keys.push(key.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Process-local storage, mainly for embedding and tests.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> StorageError {
        StorageError::Unavailable("memory storage lock poisoned".to_string())
    }
}

impl ArtifactStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, entry: &CacheEntry) -> Result<(), StorageError> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        entries.insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        entries.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        let mut keys: Vec<String> = entries.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::Trust;

    fn entry(key: &str) -> CacheEntry {
        CacheEntry::new(key, "merge {#0} {#1}", "{\"params\": [], \"body\": 1}", Trust::Trusted)
    }

    #[test]
    fn test_file_storage_roundtrip_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join(".lambdai"));

        assert!(storage.get("abc123").unwrap().is_none());
        assert!(storage.keys().unwrap().is_empty());

        storage.put(&entry("abc123")).unwrap();
        let loaded = storage.get("abc123").unwrap().unwrap();
        assert_eq!(loaded.source, entry("abc123").source);
        assert_eq!(storage.keys().unwrap(), vec!["abc123".to_string()]);

        storage.delete("abc123").unwrap();
        storage.delete("abc123").unwrap();
        assert!(storage.get("abc123").unwrap().is_none());
    }

    #[test]
    fn test_file_storage_replaces_whole_entry() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());

        storage.put(&entry("k1")).unwrap();
        let mut replacement = entry("k1");
        replacement.source = "{\"params\": [], \"body\": 2}".to_string();
        replacement.trust = Trust::Untrusted;
        storage.put(&replacement).unwrap();

        let loaded = storage.get("k1").unwrap().unwrap();
        assert_eq!(loaded.source, replacement.source);
        assert_eq!(loaded.trust, Trust::Untrusted);
        // No temp files are left behind
        let files: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_file_storage_rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        assert!(storage.put(&entry("../escape")).is_err());
        assert!(storage.get("../escape").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        assert!(matches!(storage.get("bad"), Err(StorageError::Serialization(_))));
    }

    #[test]
    fn test_memory_storage() {
        let storage = MemoryStorage::new();
        storage.put(&entry("a")).unwrap();
        storage.put(&entry("b")).unwrap();
        assert_eq!(storage.keys().unwrap(), vec!["a".to_string(), "b".to_string()]);
        storage.delete("a").unwrap();
        assert!(storage.get("a").unwrap().is_none());
    }
}
