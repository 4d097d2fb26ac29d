//! Value storage behind `STORE` and `FIND_VALUE`.
//!
//! The persistence backend is pluggable through the [`Storage`] trait;
//! [`MemoryStorage`] is the in-process default. [`StoreService`] turns
//! backend results into protocol results: a failed `put` answers
//! `success_boolean = false`, a failed or empty `get` falls back to the
//! closest known contacts. Values larger than [`MAX_VALUE_SIZE`] are
//! refused, since no `FIND_VALUE` reply could carry them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use arxen_transport::messages::RpcResult;
use arxen_transport::wire::MAX_VALUE_SIZE;
use arxen_types::{Contact, NodeId};
use tracing::{debug, warn};

/// Failure reported by a [`Storage`] backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The backend refuses new keys.
    #[error("storage full: {capacity} entries")]
    Full { capacity: usize },

    /// Any other backend failure.
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Key/value persistence used by the store service.
pub trait Storage: Send + Sync {
    /// Store `value` under `key`, replacing any previous value.
    fn put(&self, key: NodeId, value: Vec<u8>) -> Result<(), StorageError>;

    /// Fetch the value stored under `key`.
    fn get(&self, key: &NodeId) -> Result<Option<Vec<u8>>, StorageError>;
}

/// In-memory [`Storage`], optionally bounded in number of keys.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<NodeId, Vec<u8>>>,
    capacity: Option<usize>,
}

impl MemoryStorage {
    /// An unbounded store.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that rejects new keys once it holds `capacity` of them.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::default(),
            capacity: Some(capacity),
        }
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<NodeId, Vec<u8>>>, StorageError> {
        self.entries
            .lock()
            .map_err(|_| StorageError::Backend("storage lock poisoned".into()))
    }
}

impl Storage for MemoryStorage {
    fn put(&self, key: NodeId, value: Vec<u8>) -> Result<(), StorageError> {
        let mut entries = self.lock()?;
        if let Some(capacity) = self.capacity {
            if entries.len() >= capacity && !entries.contains_key(&key) {
                return Err(StorageError::Full { capacity });
            }
        }
        entries.insert(key, value);
        Ok(())
    }

    fn get(&self, key: &NodeId) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.lock()?.get(key).cloned())
    }
}

/// Serves `STORE` and `FIND_VALUE` against a [`Storage`] backend.
#[derive(Clone)]
pub struct StoreService {
    storage: Arc<dyn Storage>,
}

impl StoreService {
    /// Serve values from `storage`.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Persist a value. Returns whether the backend accepted it.
    pub fn store(&self, key: NodeId, value: Vec<u8>) -> bool {
        let len = value.len();
        if len > MAX_VALUE_SIZE {
            warn!(key = %key, len, max = MAX_VALUE_SIZE, "Refusing oversized value");
            return false;
        }
        match self.storage.put(key, value) {
            Ok(()) => {
                debug!(key = %key, len, "Value stored");
                true
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to store value");
                false
            }
        }
    }

    /// Fetch a value, treating backend failures as a miss.
    pub fn get(&self, key: &NodeId) -> Option<Vec<u8>> {
        match self.storage.get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read value");
                None
            }
        }
    }

    /// `STORE` result.
    pub fn handle_store(&self, key: NodeId, value: Vec<u8>) -> RpcResult {
        RpcResult::SuccessBoolean(self.store(key, value))
    }

    /// `FIND_VALUE` result: the value if held, otherwise whatever `closest`
    /// yields.
    pub fn handle_find_value<F>(&self, key: &NodeId, closest: F) -> RpcResult
    where
        F: FnOnce() -> Vec<Contact>,
    {
        match self.get(key) {
            Some(value) => RpcResult::Value(value),
            None => RpcResult::NodeList(closest()),
        }
    }
}

impl std::fmt::Debug for StoreService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreService").finish_non_exhaustive()
    }
}
