use std::sync::Arc;

use dashmap::DashMap;
use keelson_model::ClusterId;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{ClusterError, Result};

/// Per-cluster mutual exclusion for mutating operations.
#[derive(Debug, Default, Clone)]
pub struct ClusterLocks {
    inner: Arc<DashMap<ClusterId, Arc<Mutex<()>>>>,
}

impl ClusterLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails fast with [`ClusterError::Busy`] when another mutation holds the
    /// cluster.
    pub fn try_acquire(&self, id: ClusterId) -> Result<OwnedMutexGuard<()>> {
        let lock = self
            .inner
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.try_lock_owned().map_err(|_| ClusterError::Busy(id))
    }

    /// Drops the entry for a cluster that no longer exists.
    pub fn forget(&self, id: ClusterId) {
        self.inner.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
