//! Full-snapshot retrieval from the full-sync service.
//!
//! [`FullSyncClient`] is the seam to the HTTP persistence service;
//! [`HttpSyncClient`] talks to the real one over reqwest. The
//! [`PullCoordinator`] owns the client and the pull schedule (interval and
//! visibility); the engine runs the pull itself under the sync gate and
//! applies the result through the merge policy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde_json::Value;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::sync::protocol::{FullSyncDocument, PushAck};
use crate::types::CollectionName;

const FULL_SYNC_PATH: &str = "/api/sync/full";

/// Access to the full-sync persistence service.
#[async_trait]
pub trait FullSyncClient: Send + Sync + 'static {
    /// `GET /api/sync/full`
    async fn fetch_full(&self) -> SyncResult<FullSyncDocument>;

    /// `POST /api/sync/full`
    async fn push_full(&self, document: &FullSyncDocument) -> SyncResult<PushAck>;

    /// `PUT /api/<collection>/:id`
    async fn upsert_record(
        &self,
        collection: CollectionName,
        id: &str,
        record: &Value,
    ) -> SyncResult<()>;

    /// `DELETE /api/<collection>/:id`
    async fn delete_record(&self, collection: CollectionName, id: &str) -> SyncResult<()>;
}

/// HTTP client for the full-sync service.
pub struct HttpSyncClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSyncClient {
    /// Create a client for `base_url`. Every request is bounded by `timeout`.
    pub fn new(base_url: &str, timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn record_url(&self, collection: CollectionName, id: &str) -> String {
        self.url(&format!("/api/{}/{}", collection, id))
    }
}

async fn check(response: Response) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown".to_string());
    Err(SyncError::Http(format!("service error {}: {}", status, body)))
}

#[async_trait]
impl FullSyncClient for HttpSyncClient {
    async fn fetch_full(&self) -> SyncResult<FullSyncDocument> {
        let response = self.client.get(self.url(FULL_SYNC_PATH)).send().await?;
        let document = check(response).await?.json().await?;
        Ok(document)
    }

    async fn push_full(&self, document: &FullSyncDocument) -> SyncResult<PushAck> {
        let response = self
            .client
            .post(self.url(FULL_SYNC_PATH))
            .json(document)
            .send()
            .await?;
        let ack = check(response).await?.json().await?;
        Ok(ack)
    }

    async fn upsert_record(
        &self,
        collection: CollectionName,
        id: &str,
        record: &Value,
    ) -> SyncResult<()> {
        let response = self
            .client
            .put(self.record_url(collection, id))
            .json(record)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn delete_record(&self, collection: CollectionName, id: &str) -> SyncResult<()> {
        let response = self
            .client
            .delete(self.record_url(collection, id))
            .send()
            .await?;
        // Already gone on the service is fine.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response).await?;
        Ok(())
    }
}

/// Result of a pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    /// The snapshot was fetched; lists the collections whose value changed
    Applied(Vec<CollectionName>),
    /// Another pull or push held the gate
    Busy,
}

/// Owns the full-sync client and decides when pulls are due.
pub struct PullCoordinator {
    client: Option<Arc<dyn FullSyncClient>>,
    interval: Duration,
    visible: AtomicBool,
}

impl PullCoordinator {
    pub fn new(client: Option<Arc<dyn FullSyncClient>>, interval: Duration) -> Self {
        Self {
            client,
            interval,
            visible: AtomicBool::new(true),
        }
    }

    /// Whether a full-sync service is configured.
    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }

    pub fn client(&self) -> Option<&Arc<dyn FullSyncClient>> {
        self.client.as_ref()
    }

    /// Fetch the authoritative snapshot.
    pub async fn fetch(&self) -> SyncResult<FullSyncDocument> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| SyncError::Config("no full-sync server configured".to_string()))?;
        let document = client.fetch_full().await?;
        debug!(last_sync = ?document.last_sync, "Fetched full snapshot");
        Ok(document)
    }

    /// Periodic pull ticker. The first tick fires one interval from now.
    pub fn ticker(&self) -> Interval {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// Record a visibility change. Returns `true` when visibility was
    /// regained, which calls for a pull.
    pub fn set_visible(&self, visible: bool) -> bool {
        let was_visible = self.visible.swap(visible, Ordering::SeqCst);
        visible && !was_visible
    }
}
