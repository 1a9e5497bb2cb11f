//! Transcript persistence.
//!
//! The whole transcript is written as one blob under [`STORAGE_KEY`] and
//! overwritten on every save. There is no merging: the last write wins.

use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::error::PersistenceError;
use crate::models::{Message, PersistedTranscript};

pub const STORAGE_KEY: &str = "chatHistory";

/// String key/value storage.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, PersistenceError>;
    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError>;
    fn remove(&self, key: &str) -> Result<(), PersistenceError>;
}

/// One `<key>.json` file per key inside a directory.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PersistenceError::Read(e)),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        std::fs::create_dir_all(&self.dir).map_err(PersistenceError::Write)?;
        std::fs::write(self.path_for(key), value).map_err(PersistenceError::Write)
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PersistenceError::Write(e)),
        }
    }
}

#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(())
    }
}

pub struct PersistenceManager {
    storage: Arc<dyn Storage>,
}

impl PersistenceManager {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Restores the saved transcript. Never fails: unreadable storage gives
    /// an empty transcript, and a malformed entry is also removed.
    pub fn load(&self) -> Vec<Message> {
        let raw = match self.storage.get(STORAGE_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                tracing::warn!(error = %e, "could not read saved transcript");
                return Vec::new();
            }
        };

        match serde_json::from_str::<PersistedTranscript>(&raw) {
            Ok(saved) => {
                tracing::debug!(messages = saved.messages.len(), "restored transcript");
                saved.messages
            }
            Err(e) => {
                tracing::warn!(error = %PersistenceError::Malformed(e), "discarding saved transcript");
                if let Err(e) = self.storage.remove(STORAGE_KEY) {
                    tracing::warn!(error = %e, "could not clear saved transcript");
                }
                Vec::new()
            }
        }
    }

    /// Overwrites the saved transcript. Failures are logged and ignored.
    pub fn save(&self, messages: &[Message]) {
        if let Err(e) = self.try_save(messages) {
            tracing::warn!(error = %e, "transcript not saved");
        }
    }

    pub fn try_save(&self, messages: &[Message]) -> Result<(), PersistenceError> {
        let blob = PersistedTranscript {
            messages: messages.to_vec(),
            timestamp: Utc::now(),
        };
        let raw = serde_json::to_string(&blob).map_err(PersistenceError::Serialize)?;
        self.storage.set(STORAGE_KEY, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageKind;

    /// Storage whose writes always fail.
    struct FullStorage;

    impl Storage for FullStorage {
        fn get(&self, _key: &str) -> Result<Option<String>, PersistenceError> {
            Ok(None)
        }
        fn set(&self, _key: &str, _value: &str) -> Result<(), PersistenceError> {
            Err(PersistenceError::Write(std::io::Error::new(
                std::io::ErrorKind::Other,
                "quota exceeded",
            )))
        }
        fn remove(&self, _key: &str) -> Result<(), PersistenceError> {
            Ok(())
        }
    }

    fn transcript() -> Vec<Message> {
        vec![
            Message::user("make this friendlier"),
            Message::assistant("Sure! Here's a warmer version."),
            Message::new("Sorry, something went wrong.", MessageKind::Error),
        ]
    }

    #[test]
    fn test_save_then_load_preserves_order_and_fields() {
        let storage = Arc::new(MemoryStorage::new());
        let manager = PersistenceManager::new(storage.clone());
        let messages = transcript();

        manager.save(&messages);
        let restored = PersistenceManager::new(storage).load();
        assert_eq!(restored, messages);
    }

    #[test]
    fn test_file_storage_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = PersistenceManager::new(Arc::new(FileStorage::new(dir.path().join("state"))));
        let messages = transcript();

        manager.save(&messages);
        assert!(dir.path().join("state").join("chatHistory.json").exists());
        assert_eq!(manager.load(), messages);
    }

    #[test]
    fn test_malformed_entry_is_cleared() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(STORAGE_KEY, "{not json").unwrap();

        let manager = PersistenceManager::new(storage.clone());
        assert!(manager.load().is_empty());
        assert_eq!(storage.get(STORAGE_KEY).unwrap(), None);
    }

    #[test]
    fn test_missing_entry_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = PersistenceManager::new(Arc::new(FileStorage::new(dir.path())));
        assert!(manager.load().is_empty());
    }

    #[test]
    fn test_save_failure_is_swallowed() {
        let manager = PersistenceManager::new(Arc::new(FullStorage));
        manager.save(&transcript());
        assert!(manager.try_save(&transcript()).is_err());
    }

    #[test]
    fn test_save_overwrites() {
        let storage = Arc::new(MemoryStorage::new());
        let manager = PersistenceManager::new(storage);
        manager.save(&transcript());
        manager.save(&[Message::user("only one")]);
        let restored = manager.load();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].content, "only one");
    }
}
