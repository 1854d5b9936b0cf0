//! Single-flight gate serializing pulls, pushes and remote applies.
//!
//! At most one [`SyncPermit`] exists at a time. Pulls and pushes use
//! [`SyncGate::try_acquire`] and skip or defer when the gate is held; remote
//! applies wait with [`SyncGate::acquire`]. The `sync_in_flight` status flag
//! is true exactly while a permit is alive.

use std::sync::Arc;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::trace;

use super::status::StatusHandle;
use crate::error::{SyncError, SyncResult};

#[derive(Clone)]
pub struct SyncGate {
    semaphore: Arc<Semaphore>,
    released: Arc<Notify>,
    status: StatusHandle,
}

/// Proof of holding the gate; releases it on drop.
pub struct SyncPermit {
    permit: Option<OwnedSemaphorePermit>,
    released: Arc<Notify>,
    status: StatusHandle,
}

impl SyncGate {
    pub fn new(status: StatusHandle) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            released: Arc::new(Notify::new()),
            status,
        }
    }

    /// Take the gate if it is free, or fail with [`SyncError::Busy`].
    pub fn try_acquire(&self) -> SyncResult<SyncPermit> {
        let permit = self
            .semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| SyncError::Busy)?;
        Ok(self.wrap(permit))
    }

    /// Take the gate, waiting for the current holder to finish.
    pub async fn acquire(&self) -> SyncResult<SyncPermit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SyncError::InvalidOperation("sync gate closed".to_string()))?;
        Ok(self.wrap(permit))
    }

    fn wrap(&self, permit: OwnedSemaphorePermit) -> SyncPermit {
        self.status.set_in_flight(true);
        trace!("Sync gate acquired");
        SyncPermit {
            permit: Some(permit),
            released: self.released.clone(),
            status: self.status.clone(),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    /// Resolves after a permit is released.
    ///
    /// A release that happens while nobody waits is remembered, so the next
    /// call returns immediately.
    pub async fn released(&self) {
        self.released.notified().await;
    }
}

impl Drop for SyncPermit {
    fn drop(&mut self) {
        // Clear the flag before the permit reaches the next waiter.
        self.status.set_in_flight(false);
        drop(self.permit.take());
        trace!("Sync gate released");
        self.released.notify_one();
    }
}
