/// Durable shared map: string hashes plus time-bounded exclusive leases.
///
/// The queue only talks to this trait. `SqliteStore` is the multi-process
/// implementation; `MemoryStore` serves single-process runs and tests.
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to encode or decode stored value: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to prepare store at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Proof of holding a lease. Only the holder's token can release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    pub name: String,
    pub token: Uuid,
}

impl LeaseToken {
    pub fn new(name: impl Into<String>) -> Self {
        LeaseToken {
            name: name.into(),
            token: Uuid::new_v4(),
        }
    }
}

pub trait SharedMap: Send + Sync {
    /// Set `field` only if it does not exist. Returns true if it was written.
    fn set_if_absent(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError>;

    fn get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    /// All fields of `key` in a stable order.
    fn get_all(&self, key: &str) -> Result<Vec<(String, String)>, StoreError>;

    /// Remove `key` and all its fields.
    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Non-blocking lease acquisition. `None` means someone else holds an unexpired lease.
    fn try_acquire_lease(&self, name: &str, timeout: Duration) -> Result<Option<LeaseToken>, StoreError>;

    /// Release a lease. Returns false if it had already expired or been taken over.
    fn release_lease(&self, lease: &LeaseToken) -> Result<bool, StoreError>;

    /// Drop every outstanding lease. Returns how many were removed.
    fn clear_leases(&self) -> Result<usize, StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    hashes: HashMap<String, BTreeMap<String, String>>,
    leases: HashMap<String, (Uuid, Instant)>,
}

/// In-process `SharedMap`. Safe across threads and tasks, not across processes.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        // Every operation leaves the maps consistent, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SharedMap for MemoryStore {
    fn set_if_absent(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let hash = inner.hashes.entry(key.to_string()).or_default();
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    fn get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .lock()
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .cloned())
    }

    fn set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    fn get_all(&self, key: &str) -> Result<Vec<(String, String)>, StoreError> {
        Ok(self
            .lock()
            .hashes
            .get(key)
            .map(|h| h.iter().map(|(f, v)| (f.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock().hashes.remove(key);
        Ok(())
    }

    fn try_acquire_lease(&self, name: &str, timeout: Duration) -> Result<Option<LeaseToken>, StoreError> {
        let mut inner = self.lock();
        let now = Instant::now();
        if let Some((_, expires_at)) = inner.leases.get(name) {
            if *expires_at > now {
                return Ok(None);
            }
        }
        let lease = LeaseToken::new(name);
        inner.leases.insert(name.to_string(), (lease.token, now + timeout));
        Ok(Some(lease))
    }

    fn release_lease(&self, lease: &LeaseToken) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        match inner.leases.get(&lease.name) {
            Some((token, _)) if *token == lease.token => {
                inner.leases.remove(&lease.name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn clear_leases(&self) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        let count = inner.leases.len();
        inner.leases.clear();
        Ok(count)
    }
}
