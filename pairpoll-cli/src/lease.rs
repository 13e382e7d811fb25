/// Per-(responder, question) leases on top of a `SharedMap`.
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::store::{LeaseToken, SharedMap, StoreError};

/// How often a waiting acquirer polls a busy lease.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub struct LockManager {
    store: Arc<dyn SharedMap>,
    timeout: Duration,
}

/// A held lease. Released explicitly with `release()`, or on drop.
pub struct LeaseGuard<'a> {
    store: &'a dyn SharedMap,
    lease: Option<LeaseToken>,
}

impl LeaseGuard<'_> {
    /// Release now. Returns false if the lease had already expired.
    pub fn release(mut self) -> Result<bool, StoreError> {
        match self.lease.take() {
            Some(lease) => self.store.release_lease(&lease),
            None => Ok(false),
        }
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            if let Err(e) = self.store.release_lease(&lease) {
                warn!(lease = %lease.name, error = %e, "failed to release lease; it will expire on its own");
            }
        }
    }
}

pub fn lease_name(responder: &str, question: &str) -> String {
    format!("lock:{responder}:{question}")
}

impl LockManager {
    pub fn new(store: Arc<dyn SharedMap>, timeout: Duration) -> Self {
        LockManager { store, timeout }
    }

    /// Non-blocking acquire. `None` means the question is leased by someone else.
    pub fn try_acquire(&self, responder: &str, question: &str) -> Result<Option<LeaseGuard<'_>>, StoreError> {
        let lease = self
            .store
            .try_acquire_lease(&lease_name(responder, question), self.timeout)?;
        Ok(lease.map(|lease| LeaseGuard {
            store: self.store.as_ref(),
            lease: Some(lease),
        }))
    }

    /// Acquire, polling for up to `wait`. Blocks the calling thread.
    pub fn acquire(&self, responder: &str, question: &str, wait: Duration) -> Result<Option<LeaseGuard<'_>>, StoreError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(guard) = self.try_acquire(responder, question)? {
                return Ok(Some(guard));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Remove every outstanding lease, including other processes'.
    pub fn clear(&self) -> Result<usize, StoreError> {
        self.store.clear_leases()
    }
}
