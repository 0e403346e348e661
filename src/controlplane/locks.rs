//! Resource Lock Manager
//!
//! Non-blocking, per-key mutual exclusion. A second workflow for a key that
//! is already held fails fast with [`Error::OperationInProgress`] instead of
//! queueing. The lock is released when the returned guard drops.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Set of resource keys currently held by a workflow
#[derive(Debug, Default)]
pub struct ResourceLocks {
    held: Mutex<HashSet<String>>,
}

impl ResourceLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take `key`, or fail with Aborted if another workflow holds it
    pub fn try_acquire(self: &Arc<Self>, key: &str) -> Result<ResourceGuard> {
        if !self.held.lock().insert(key.to_string()) {
            debug!(key, "Resource busy");
            return Err(Error::OperationInProgress {
                key: key.to_string(),
            });
        }
        Ok(ResourceGuard {
            locks: Arc::clone(self),
            key: key.to_string(),
        })
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held.lock().contains(key)
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }
}

/// Releases its key on drop
#[derive(Debug)]
pub struct ResourceGuard {
    locks: Arc<ResourceLocks>,
    key: String,
}

impl ResourceGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.locks.held.lock().remove(&self.key);
    }
}
