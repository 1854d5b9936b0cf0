//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use storesync_core::sync::PushAck;
use storesync_core::{
    CollectionName, FullSyncClient, FullSyncDocument, Storage, SyncConfig, SyncEngine,
    SyncError, SyncEvent, SyncResult,
};
use tokio::sync::{broadcast, Notify};

/// In-memory stand-in for the full-sync HTTP service.
///
/// Pushed documents are merged into the served document, so several
/// engines sharing one fake see each other's pushes on their next pull.
#[derive(Default)]
pub struct FakeSyncClient {
    document: Mutex<FullSyncDocument>,
    pushes: Mutex<Vec<FullSyncDocument>>,
    log: Mutex<Vec<&'static str>>,
    hold_next_fetch: Mutex<Option<Arc<Notify>>>,
    failing: AtomicBool,
    record_calls: Mutex<Vec<String>>,
}

impl FakeSyncClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve `document` from now on.
    pub fn serve(&self, document: FullSyncDocument) {
        *self.document.lock() = document;
    }

    /// Make every call fail like an unreachable service.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Block the next fetch until the returned handle is notified.
    pub fn hold_next_fetch(&self) -> Arc<Notify> {
        let release = Arc::new(Notify::new());
        *self.hold_next_fetch.lock() = Some(release.clone());
        release
    }

    pub fn pushes(&self) -> Vec<FullSyncDocument> {
        self.pushes.lock().clone()
    }

    pub fn push_count(&self) -> usize {
        self.pushes.lock().len()
    }

    pub fn fetch_count(&self) -> usize {
        self.log.lock().iter().filter(|e| **e == "fetch-start").count()
    }

    pub fn log(&self) -> Vec<&'static str> {
        self.log.lock().clone()
    }

    pub fn record_calls(&self) -> Vec<String> {
        self.record_calls.lock().clone()
    }

    fn check(&self) -> SyncResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(SyncError::Http("service unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl FullSyncClient for FakeSyncClient {
    async fn fetch_full(&self) -> SyncResult<FullSyncDocument> {
        self.log.lock().push("fetch-start");
        let hold = self.hold_next_fetch.lock().take();
        if let Some(release) = hold {
            release.notified().await;
        }
        self.log.lock().push("fetch-end");
        self.check()?;
        Ok(self.document.lock().clone())
    }

    async fn push_full(&self, document: &FullSyncDocument) -> SyncResult<PushAck> {
        self.check()?;
        self.log.lock().push("push");
        self.pushes.lock().push(document.clone());

        let mut served = self.document.lock();
        let mut merged = served.clone().into_snapshot();
        merged
            .collections
            .extend(document.clone().into_snapshot().collections);
        *served = FullSyncDocument::from_snapshot(&merged);

        Ok(PushAck {
            timestamp: json!(1_700_000_000_000_i64),
        })
    }

    async fn upsert_record(
        &self,
        collection: CollectionName,
        id: &str,
        _record: &Value,
    ) -> SyncResult<()> {
        self.check()?;
        self.record_calls
            .lock()
            .push(format!("PUT /api/{}/{}", collection, id));
        Ok(())
    }

    async fn delete_record(&self, collection: CollectionName, id: &str) -> SyncResult<()> {
        self.check()?;
        self.record_calls
            .lock()
            .push(format!("DELETE /api/{}/{}", collection, id));
        Ok(())
    }
}

pub fn config() -> SyncConfig {
    SyncConfig {
        reconnect_attempts: 2,
        reconnect_delay_ms: 100,
        ..Default::default()
    }
}

pub fn engine_with_client(client: &Arc<FakeSyncClient>) -> SyncEngine {
    SyncEngine::builder(config(), Storage::in_memory().unwrap())
        .client(client.clone())
        .build()
        .unwrap()
}

/// Wait for the first event matching `pred`.
pub async fn wait_for(
    rx: &mut broadcast::Receiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for sync event")
}

/// Collect every event already queued.
pub fn drain(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Let the engine loops run for `duration` of (possibly paused) time.
pub async fn settle(duration: Duration) {
    tokio::time::sleep(duration).await;
}

pub fn partner(id: &str) -> Value {
    json!({ "id": id, "name": format!("Partner {}", id) })
}

pub fn admin() -> Value {
    json!({ "id": 1, "username": "admin", "role": "admin" })
}
