//! Persistence for the outbound queue
//!
//! [`KeyValueStore`] is a small synchronous key-value abstraction (memory or one
//! file per key). [`QueueStorage`] layers typed, namespaced access on top of it and
//! is the only writer of `outbound:*` keys.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use plexmcp_shared::TicketId;

use super::PendingOutboundMessage;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),
}

/// Durable string key-value storage
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
    /// All keys starting with `prefix`, sorted
    fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// In-memory store, for tests and clients without a queue directory
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.lock().remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// One JSON file per key under a directory
///
/// `:` in keys is stored as `~` so file names stay portable.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
        if !valid || key.contains("..") {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", key.replace(':', "~"))))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.path_for(key)?) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(key)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            let key = stem.replace('~', ":");
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Typed access to persisted queue entries
#[derive(Clone)]
pub struct QueueStorage {
    store: Arc<dyn KeyValueStore>,
    namespace: String,
}

impl QueueStorage {
    pub fn new(store: Arc<dyn KeyValueStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    fn prefix(&self) -> String {
        format!("{}:outbound:", self.namespace)
    }

    fn key(&self, ticket_id: TicketId) -> String {
        format!("{}{}", self.prefix(), ticket_id)
    }

    /// Replace the persisted queue for a ticket
    pub fn save(
        &self,
        ticket_id: TicketId,
        messages: &[PendingOutboundMessage],
    ) -> Result<(), StorageError> {
        let key = self.key(ticket_id);
        if messages.is_empty() {
            return self.store.remove(&key);
        }
        let value = serde_json::to_string(messages)?;
        self.store.set(&key, &value)
    }

    /// Every persisted queue, skipping entries that no longer parse
    pub fn load_all(&self) -> Result<Vec<(TicketId, Vec<PendingOutboundMessage>)>, StorageError> {
        let prefix = self.prefix();
        let mut queues = Vec::new();

        for key in self.store.keys(&prefix)? {
            let Some(value) = self.store.get(&key)? else {
                continue;
            };
            let ticket_id = key
                .strip_prefix(&prefix)
                .and_then(|id| uuid::Uuid::parse_str(id).ok())
                .map(TicketId::from);

            match (ticket_id, serde_json::from_str::<Vec<PendingOutboundMessage>>(&value)) {
                (Some(ticket_id), Ok(messages)) => queues.push((ticket_id, messages)),
                (_, Err(e)) => {
                    tracing::warn!(key = %key, error = %e, "Skipping unreadable outbound queue entry");
                }
                (None, _) => {
                    tracing::warn!(key = %key, "Skipping outbound queue entry with invalid ticket id");
                }
            }
        }

        Ok(queues)
    }
}
