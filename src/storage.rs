//! Persisted transport key for follow-up usage tests
//!
//! After a successful import the server's copy of the TEK can be saved so
//! later runs can exercise the imported key without repeating the exchange.
//! A missing key is a normal state: [`TekStorage::load`] returns `None`.

use crate::types::SymmetricKey;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroize;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage state poisoned")]
    Poisoned,
}

/// Storage for the server-side copy of the transport key
pub trait TekStorage: Send + Sync {
    fn save(&self, key: &SymmetricKey) -> Result<(), StorageError>;

    /// `None` when nothing is stored or the stored value is unreadable
    fn load(&self) -> Option<SymmetricKey>;

    fn clear(&self) -> Result<(), StorageError>;
}

#[derive(Default)]
pub struct MemoryTekStorage {
    key: Mutex<Option<SymmetricKey>>,
}

impl MemoryTekStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TekStorage for MemoryTekStorage {
    fn save(&self, key: &SymmetricKey) -> Result<(), StorageError> {
        *self.key.lock().map_err(|_| StorageError::Poisoned)? = Some(key.clone());
        Ok(())
    }

    fn load(&self) -> Option<SymmetricKey> {
        self.key.lock().ok().and_then(|guard| guard.clone())
    }

    fn clear(&self) -> Result<(), StorageError> {
        *self.key.lock().map_err(|_| StorageError::Poisoned)? = None;
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct StoredKey {
    key: String,
    saved_at: DateTime<Utc>,
}

/// JSON file holding the Base64 key bytes
#[derive(Debug, Clone)]
pub struct FileTekStorage {
    path: PathBuf,
}

impl FileTekStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileTekStorage { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Option<SymmetricKey>, String> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path).map_err(|e| e.to_string())?;
        let mut stored: StoredKey = serde_json::from_str(&contents).map_err(|e| e.to_string())?;
        let mut bytes = BASE64.decode(&stored.key).map_err(|e| e.to_string())?;
        stored.key.zeroize();
        let key = SymmetricKey::from_slice(&bytes).map_err(|e| e.to_string());
        bytes.zeroize();
        key.map(Some)
    }
}

impl TekStorage for FileTekStorage {
    fn save(&self, key: &SymmetricKey) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut stored = StoredKey {
            key: BASE64.encode(key.as_slice()),
            saved_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&stored);
        stored.key.zeroize();
        fs::write(&self.path, json?)?;
        debug!(path = %self.path.display(), "Saved transport key");
        Ok(())
    }

    fn load(&self) -> Option<SymmetricKey> {
        match self.read() {
            Ok(key) => key,
            Err(e) => {
                warn!(path = %self.path.display(), "Failed to load stored key: {}", e);
                None
            }
        }
    }

    fn clear(&self) -> Result<(), StorageError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage() {
        let storage = MemoryTekStorage::new();
        assert!(storage.load().is_none());

        let key = SymmetricKey::generate(256).unwrap();
        storage.save(&key).unwrap();
        assert_eq!(storage.load().unwrap(), key);

        storage.clear().unwrap();
        assert!(storage.load().is_none());
    }

    #[test]
    fn test_file_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileTekStorage::new(dir.path().join("keys").join("tek.json"));
        assert!(storage.load().is_none());

        let key = SymmetricKey::generate(192).unwrap();
        storage.save(&key).unwrap();
        assert_eq!(storage.load().unwrap(), key);

        storage.clear().unwrap();
        assert!(storage.load().is_none());
        // Clearing twice is fine
        storage.clear().unwrap();
    }

    #[test]
    fn test_corrupt_file_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tek.json");
        fs::write(&path, "not json").unwrap();
        assert!(FileTekStorage::new(&path).load().is_none());

        fs::write(&path, r#"{"key":"AAAA","saved_at":"2024-01-01T00:00:00Z"}"#).unwrap();
        assert!(FileTekStorage::new(&path).load().is_none());
    }
}
