//! Persisted-cache path.
//!
//! A key-value cache on [`Storage`] whose writes notify every *other*
//! instance opened on the same [`CacheHub`]. The well-known
//! [`LAST_BROADCAST_KEY`] holds the most recent outgoing message, which also
//! serves freshly started instances as a durable record of the last
//! broadcast.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::warn;
use ulid::Ulid;

use crate::error::SyncResult;
use crate::storage::Storage;

/// Cache key holding the last broadcast message.
pub const LAST_BROADCAST_KEY: &str = "storesync:last-broadcast";

const CHANGE_CAPACITY: usize = 256;

/// A write to the cache, as seen by other instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheChange {
    pub key: String,
    pub value: String,
    writer: Ulid,
}

/// Shared storage origin for cache instances.
pub struct CacheHub {
    storage: Storage,
    tx: broadcast::Sender<CacheChange>,
}

impl CacheHub {
    pub fn new(storage: Storage) -> Arc<Self> {
        let (tx, _) = broadcast::channel(CHANGE_CAPACITY);
        Arc::new(Self { storage, tx })
    }

    /// Open a cache instance on this origin.
    pub fn open(self: &Arc<Self>) -> PersistedCache {
        PersistedCache {
            hub: self.clone(),
            instance: Ulid::new(),
        }
    }
}

/// One instance's view of the persisted cache.
#[derive(Clone)]
pub struct PersistedCache {
    hub: Arc<CacheHub>,
    instance: Ulid,
}

impl PersistedCache {
    /// Persist `value` under `key` and notify the other instances.
    pub fn write(&self, key: &str, value: &str) -> SyncResult<()> {
        self.hub.storage.cache_put(key, value)?;
        let _ = self.hub.tx.send(CacheChange {
            key: key.to_string(),
            value: value.to_string(),
            writer: self.instance,
        });
        Ok(())
    }

    pub fn read(&self, key: &str) -> SyncResult<Option<String>> {
        self.hub.storage.cache_get(key)
    }

    /// Listen for writes made by other instances.
    pub fn subscribe(&self) -> CacheSubscription {
        CacheSubscription {
            rx: self.hub.tx.subscribe(),
            instance: self.instance,
        }
    }
}

/// Change notifications from other instances.
pub struct CacheSubscription {
    rx: broadcast::Receiver<CacheChange>,
    instance: Ulid,
}

impl CacheSubscription {
    /// Next change written by another instance, or `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<CacheChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) if change.writer == self.instance => continue,
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Cache change listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
