//! Main SyncEngine - the primary entry point for storesync
//!
//! SyncEngine coordinates the CollectionStore, TransportChannel and the
//! full-sync service for:
//! - Debounced pushes of local changes to peers and the service
//! - Pulls of the authoritative snapshot (startup, interval, visibility,
//!   remote notification, user request)
//! - Applying remote snapshots through the merge policy without echoing them
//!
//! # Example
//!
//! ```ignore
//! use storesync_core::{CollectionName, SyncConfig, SyncEngine};
//!
//! let engine = SyncEngine::open("~/.storesync/data", SyncConfig::default())?;
//! engine.start().await?;
//!
//! // Local edits are picked up and pushed after the debounce window
//! engine.store().upsert_record(CollectionName::Partners, json!({ "id": "P1" }))?;
//!
//! // Explicit sync from a "Sync now" button
//! engine.pull_now().await?;
//! engine.push_now().await?;
//!
//! engine.shutdown().await;
//! ```

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::identity;
use crate::storage::Storage;
use crate::store::{CollectionStore, StoreChange};
use crate::sync::events::{ConnectionState, PullTrigger, SyncEvent};
use crate::sync::gate::{SyncGate, SyncPermit};
use crate::sync::merge::{
    is_covered_by, is_empty_collection, record_id, MergeOutcome, MergePolicy,
};
use crate::sync::protocol::{FullSyncDocument, MessageKind, SyncMessage, SyncSnapshot};
use crate::sync::pull::{FullSyncClient, HttpSyncClient, PullCoordinator, PullOutcome};
use crate::sync::push::{PushCoordinator, PushDue, PushOutcome};
use crate::sync::status::StatusHandle;
use crate::sync::transport::broadcast::BroadcastHub;
use crate::sync::transport::cache::CacheHub;
use crate::sync::transport::realtime::{RealtimeLink, WebSocketLink};
use crate::sync::transport::{
    SendReport, TransportChannel, TransportEvent, TransportOptions, TransportPath,
};
use crate::sync::watcher::ChangeWatcher;
use crate::types::{now_millis, CollectionName, DeviceId};

/// Database file inside the data directory.
pub const DATABASE_FILE: &str = "storesync.redb";

const EVENT_CAPACITY: usize = 256;

/// Assembles a [`SyncEngine`] from injectable parts.
pub struct SyncEngineBuilder {
    config: SyncConfig,
    storage: Storage,
    client: Option<Arc<dyn FullSyncClient>>,
    realtime: Option<Arc<dyn RealtimeLink>>,
    broadcast: Option<Arc<BroadcastHub>>,
    cache: Option<Arc<CacheHub>>,
    policy: Option<MergePolicy>,
}

impl SyncEngineBuilder {
    /// Use `client` for pulls and server pushes.
    pub fn client(mut self, client: Arc<dyn FullSyncClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Use `link` for the real-time path.
    pub fn realtime(mut self, link: Arc<dyn RealtimeLink>) -> Self {
        self.realtime = Some(link);
        self
    }

    /// Join a same-process broadcast hub.
    pub fn broadcast(mut self, hub: Arc<BroadcastHub>) -> Self {
        self.broadcast = Some(hub);
        self
    }

    /// Share a persisted cache with other instances. Defaults to a cache on
    /// this engine's own storage.
    pub fn cache_hub(mut self, hub: Arc<CacheHub>) -> Self {
        self.cache = Some(hub);
        self
    }

    /// Override the merge table built from the config.
    pub fn merge_policy(mut self, policy: MergePolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn build(self) -> SyncResult<SyncEngine> {
        let Self {
            config,
            storage,
            client,
            realtime,
            broadcast: broadcast_hub,
            cache,
            policy,
        } = self;
        config.validate()?;

        let device_id = identity::get_or_create(&storage)?;
        let store = Arc::new(CollectionStore::with_storage(storage.clone())?);

        let cache = cache.unwrap_or_else(|| CacheHub::new(storage.clone()));
        let mut transport =
            TransportChannel::new(cache.open(), TransportOptions::from_config(&config));
        if let Some(hub) = broadcast_hub {
            transport = transport.with_broadcast(hub);
        }
        if let Some(link) = realtime {
            transport = transport.with_realtime(link);
        }

        let status = StatusHandle::new();
        let (due_tx, due_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let policy =
            policy.unwrap_or_else(|| MergePolicy::new(config.protected_identity.clone()));

        let inner = EngineInner {
            device_id,
            store,
            transport,
            pulls: PullCoordinator::new(client, config.pull_interval()),
            policy,
            watcher: Mutex::new(ChangeWatcher::new()),
            push: Mutex::new(PushCoordinator::new(config.debounce_window(), due_tx)),
            gate: SyncGate::new(status.clone()),
            status,
            events,
            config,
        };

        Ok(SyncEngine {
            inner: Arc::new(inner),
            due_rx: Mutex::new(Some(due_rx)),
            task: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }
}

/// The sync engine for one device.
///
/// All background work runs on one event loop started by [`start`]; pulls
/// triggered in the background run as separate tasks and share the
/// single-flight gate with pushes and remote applies.
///
/// [`start`]: SyncEngine::start
pub struct SyncEngine {
    inner: Arc<EngineInner>,
    due_rx: Mutex<Option<mpsc::UnboundedReceiver<PushDue>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl SyncEngine {
    /// Start assembling an engine on `storage`.
    pub fn builder(config: SyncConfig, storage: Storage) -> SyncEngineBuilder {
        SyncEngineBuilder {
            config,
            storage,
            client: None,
            realtime: None,
            broadcast: None,
            cache: None,
            policy: None,
        }
    }

    /// Open an engine persisting to `data_dir`, wired to the services named
    /// in `config`.
    pub fn open(data_dir: impl AsRef<Path>, config: SyncConfig) -> SyncResult<Self> {
        let storage = Storage::new(data_dir.as_ref().join(DATABASE_FILE))?;
        let mut builder = Self::builder(config.clone(), storage);

        if let Some(url) = &config.server_url {
            let client = HttpSyncClient::new(url, config.request_timeout())?;
            builder = builder.client(Arc::new(client));
        }
        if let Some(url) = &config.realtime_url {
            let link = WebSocketLink::new(url.clone())
                .with_connect_timeout(config.request_timeout());
            builder = builder.realtime(Arc::new(link));
        }
        builder.build()
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.inner.device_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// The application state this engine keeps in sync.
    pub fn store(&self) -> &Arc<CollectionStore> {
        &self.inner.store
    }

    /// Current connection state.
    pub fn status(&self) -> ConnectionState {
        self.inner.status.snapshot()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionState> {
        self.inner.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Collections changed locally and not yet pushed.
    pub fn pending_collections(&self) -> Vec<CollectionName> {
        self.inner.push.lock().pending().collect()
    }

    /// Whether a debounced push is scheduled.
    pub fn is_push_scheduled(&self) -> bool {
        self.inner.push.lock().is_armed()
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Connect the transport and start the event loop.
    ///
    /// Seeds the change baseline from the current store, replays the last
    /// cached broadcast and runs a startup pull. An engine starts once.
    pub async fn start(&self) -> SyncResult<()> {
        let due_rx = self
            .due_rx
            .lock()
            .take()
            .ok_or_else(|| SyncError::InvalidOperation("engine already started".to_string()))?;
        let inner = &self.inner;

        {
            let mut watcher = inner.watcher.lock();
            for name in CollectionName::ALL {
                watcher.rebase(name, inner.store.get(name));
            }
        }

        let store_rx = inner.store.subscribe();
        let transport_rx = inner.transport.subscribe();
        inner.transport.connect(&inner.device_id).await;

        match inner.transport.last_broadcast() {
            Ok(Some(message)) => inner.handle_message(message, TransportPath::Cache).await,
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to replay last broadcast"),
        }

        let task = tokio::spawn(run(
            inner.clone(),
            store_rx,
            transport_rx,
            due_rx,
            self.shutdown.clone(),
        ));
        *self.task.lock() = Some(task);

        inner.spawn_pull(PullTrigger::Startup);
        info!(device_id = %inner.device_id, "Sync engine started");
        Ok(())
    }

    /// Stop the event loop, push anything still pending and disconnect.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        self.inner.flush_pending().await;
        self.inner.transport.disconnect();
        self.inner.status.set_connected(false);
        info!(device_id = %self.inner.device_id, "Sync engine stopped");
    }

    /// Pull the authoritative snapshot now, on behalf of the user.
    ///
    /// Returns [`PullOutcome::Busy`] without doing anything when another
    /// sync operation is in flight.
    pub async fn pull_now(&self) -> SyncResult<PullOutcome> {
        self.inner.pull(PullTrigger::User).await
    }

    /// Push every collection now, on behalf of the user.
    ///
    /// With a full-sync service configured the snapshot is posted there and
    /// peers are told to pull; otherwise the snapshot goes straight to peers.
    pub async fn push_now(&self) -> SyncResult<PushOutcome> {
        let permit = match self.inner.gate.try_acquire() {
            Ok(permit) => permit,
            Err(SyncError::Busy) => {
                debug!("Push skipped: sync in flight");
                return Ok(PushOutcome::Busy);
            }
            Err(e) => return Err(e),
        };
        self.inner.push_all(permit).await
    }

    /// Report whether the application is visible. Regaining visibility
    /// triggers a pull.
    pub fn set_visible(&self, visible: bool) {
        if self.inner.pulls.set_visible(visible) {
            self.inner.spawn_pull(PullTrigger::VisibilityRegained);
        }
    }

    /// Insert or replace a record locally, then mirror it to the record
    /// endpoint of the full-sync service.
    ///
    /// A failing endpoint call is logged only; the local edit stands and the
    /// next push carries it.
    pub async fn save_record(&self, collection: CollectionName, record: Value) -> SyncResult<()> {
        self.inner.store.upsert_record(collection, record.clone())?;

        if let (Some(client), Some(id)) = (self.inner.pulls.client(), record_id(&record)) {
            if let Err(e) = client
                .upsert_record(collection, &id_segment(id), &record)
                .await
            {
                warn!(%collection, error = %e, "Record upsert failed");
            }
        }
        Ok(())
    }

    /// Remove a record locally, then from the full-sync service.
    ///
    /// Returns `false` if no local record had `id`.
    pub async fn delete_record(&self, collection: CollectionName, id: &Value) -> SyncResult<bool> {
        let removed = self.inner.store.remove_record(collection, id)?;

        if removed {
            if let Some(client) = self.inner.pulls.client() {
                if let Err(e) = client.delete_record(collection, &id_segment(id)).await {
                    warn!(%collection, error = %e, "Record delete failed");
                }
            }
        }
        Ok(removed)
    }

    /// Relay an order to the other devices over the real-time channel.
    pub fn send_order(&self, order: Value) -> SyncResult<()> {
        self.inner.transport.send_order(order)
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn id_segment(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

struct EngineInner {
    device_id: DeviceId,
    config: SyncConfig,
    store: Arc<CollectionStore>,
    transport: TransportChannel,
    pulls: PullCoordinator,
    policy: MergePolicy,
    watcher: Mutex<ChangeWatcher>,
    push: Mutex<PushCoordinator>,
    gate: SyncGate,
    status: StatusHandle,
    events: broadcast::Sender<SyncEvent>,
}

impl EngineInner {
    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    fn refresh_pending(&self) {
        let pending = self.push.lock().pending_len();
        self.status.set_pending(pending);
    }

    fn report_failure(
        &self,
        collection: Option<CollectionName>,
        error: &SyncError,
        announce: bool,
        context: &str,
    ) {
        if error.is_transient() {
            warn!(?collection, error = %error, "{}", context);
        } else {
            error!(?collection, error = %error, "{}", context);
        }
        self.status.record_error(error.to_string());
        self.emit(SyncEvent::SyncError {
            collection,
            message: error.to_string(),
        });
        if announce {
            self.emit(SyncEvent::UserNotice {
                message: format!("{}: {}", context, error),
            });
        }
    }

    /// Collections that currently hold data, for posting to the service.
    fn populated_snapshot(&self) -> SyncSnapshot {
        let mut snapshot = self.store.snapshot(CollectionName::ALL);
        snapshot
            .collections
            .retain(|_, value| !is_empty_collection(value));
        snapshot
    }

    // ═══════════════════════════════════════════════════════════════════
    // Local changes and pushes
    // ═══════════════════════════════════════════════════════════════════

    fn on_store_change(&self, names: &[CollectionName]) {
        let changed: Vec<CollectionName> = {
            let watcher = self.watcher.lock();
            names
                .iter()
                .copied()
                .filter(|name| watcher.is_changed(*name, &self.store.get(*name)))
                .collect()
        };
        if changed.is_empty() {
            return;
        }
        trace!(?changed, "Local change detected");
        self.push.lock().on_local_change(changed);
        self.refresh_pending();
    }

    async fn on_push_due(&self, due: PushDue) {
        let names = self.push.lock().take_due(due);
        let Some(names) = names else {
            return;
        };
        self.refresh_pending();
        if names.is_empty() {
            return;
        }

        match self.gate.try_acquire() {
            Ok(permit) => {
                let _ = self.flush(names, permit, false).await;
            }
            Err(_) => {
                debug!(collections = ?names, "Push deferred: sync in flight");
                self.push.lock().defer(names);
                self.refresh_pending();
            }
        }
    }

    /// Push everything pending right away, waiting for the gate.
    async fn flush_pending(&self) {
        let pending = self.push.lock().take_all();
        if pending.is_empty() {
            return;
        }
        self.refresh_pending();
        match self.gate.acquire().await {
            Ok(permit) => {
                let _ = self.flush(pending, permit, false).await;
            }
            Err(e) => {
                warn!(error = %e, "Could not flush pending changes");
                self.push.lock().hold(pending);
                self.refresh_pending();
            }
        }
    }

    /// Whether a message sent with `report` reached the other devices, or
    /// could not have since no real-time link is configured.
    fn reached_peers(&self, report: SendReport) -> bool {
        report.realtime || !self.transport.has_realtime()
    }

    /// Send `names` to peers and the full-sync service while holding the gate.
    ///
    /// When the real-time link is configured but down, the collections stay
    /// pending after the send and go out again on reconnect.
    async fn flush(
        &self,
        names: Vec<CollectionName>,
        _permit: SyncPermit,
        announce: bool,
    ) -> SyncResult<()> {
        let snapshot = self.store.snapshot(names.iter().copied());
        let message = SyncMessage::state_update(&self.device_id, &snapshot);

        let result = async {
            let report = self.transport.send(&message)?;
            if let Some(client) = self.pulls.client() {
                let document = FullSyncDocument::from_snapshot(&self.populated_snapshot());
                let ack = client.push_full(&document).await?;
                debug!(timestamp = %ack.timestamp, "Full-sync service accepted push");
            }
            Ok::<bool, SyncError>(self.reached_peers(report))
        }
        .await;

        match result {
            Ok(reached_peers) => {
                {
                    let mut watcher = self.watcher.lock();
                    for (name, value) in &snapshot.collections {
                        watcher.rebase(*name, value.clone());
                    }
                }
                {
                    let mut push = self.push.lock();
                    push.succeeded();
                    if !reached_peers {
                        push.hold(names.iter().copied());
                    }
                }
                if !reached_peers {
                    self.refresh_pending();
                    debug!(
                        collections = ?names,
                        "Real-time channel down, holding changes for reconnect"
                    );
                }
                self.status.record_sync(now_millis());
                info!(collections = ?names, "Pushed local changes");
                self.emit(SyncEvent::Pushed { collections: names });
                Ok(())
            }
            Err(e) => {
                let retry_in = self.push.lock().restore(names);
                self.refresh_pending();
                debug!(?retry_in, "Push will be retried");
                self.report_failure(None, &e, announce, "Push failed");
                Err(e)
            }
        }
    }

    async fn push_all(&self, _permit: SyncPermit) -> SyncResult<PushOutcome> {
        let pending = self.push.lock().take_all();
        self.refresh_pending();
        let snapshot = self.store.snapshot(CollectionName::ALL);

        let result = async {
            let report = match self.pulls.client() {
                Some(client) => {
                    let document = FullSyncDocument::from_snapshot(&self.populated_snapshot());
                    client.push_full(&document).await?;
                    self.transport
                        .send(&SyncMessage::full_sync_completed(&self.device_id))?
                }
                None => self
                    .transport
                    .send(&SyncMessage::full_sync(&self.device_id, &snapshot))?,
            };
            Ok::<bool, SyncError>(self.reached_peers(report))
        }
        .await;

        match result {
            Ok(reached_peers) => {
                {
                    let mut watcher = self.watcher.lock();
                    for (name, value) in &snapshot.collections {
                        watcher.rebase(*name, value.clone());
                    }
                }
                {
                    let mut push = self.push.lock();
                    push.succeeded();
                    if !reached_peers {
                        push.hold(pending);
                    }
                }
                self.refresh_pending();
                self.status.record_sync(now_millis());
                let names = snapshot.names();
                info!("Pushed full snapshot");
                self.emit(SyncEvent::Pushed {
                    collections: names.clone(),
                });
                Ok(PushOutcome::Pushed(names))
            }
            Err(e) => {
                self.push.lock().restore(pending);
                self.refresh_pending();
                self.report_failure(None, &e, true, "Push failed");
                Err(e)
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Pulls and remote applies
    // ═══════════════════════════════════════════════════════════════════

    async fn pull(&self, trigger: PullTrigger) -> SyncResult<PullOutcome> {
        if !self.pulls.has_client() {
            return Err(SyncError::Config(
                "no full-sync server configured".to_string(),
            ));
        }
        let _permit = match self.gate.try_acquire() {
            Ok(permit) => permit,
            Err(SyncError::Busy) => {
                debug!(?trigger, "Pull skipped: sync in flight");
                return Ok(PullOutcome::Busy);
            }
            Err(e) => return Err(e),
        };

        match self.pulls.fetch().await {
            Ok(document) => {
                let applied = self.apply_snapshot(&document.into_snapshot());
                self.status.record_sync(now_millis());
                info!(?trigger, applied = applied.len(), "Pull complete");
                if !applied.is_empty() {
                    self.emit(SyncEvent::CollectionsApplied {
                        collections: applied.clone(),
                        source: None,
                    });
                }
                self.emit(SyncEvent::Pulled { trigger });
                Ok(PullOutcome::Applied(applied))
            }
            Err(e) => {
                self.report_failure(None, &e, trigger.announces(), "Pull failed");
                Err(e)
            }
        }
    }

    fn spawn_pull(self: &Arc<Self>, trigger: PullTrigger) {
        if !self.pulls.has_client() {
            return;
        }
        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.pull(trigger).await {
                debug!(?trigger, error = %e, "Background pull failed");
            }
        });
    }

    /// Merge every collection of `snapshot` into the store. The caller holds
    /// the gate. Returns the collections whose value changed.
    ///
    /// The change baseline is moved before the store is assigned. When the
    /// merge kept records the remote lacks, the baseline becomes the remote
    /// value and the collection stays pending so those records are pushed;
    /// otherwise it becomes the merged value and no push follows.
    fn apply_snapshot(&self, snapshot: &SyncSnapshot) -> Vec<CollectionName> {
        let mut applied = Vec::new();

        for (name, incoming) in &snapshot.collections {
            let name = *name;
            let local = self.store.get(name);
            let merged = match self.policy.merge(name, &local, incoming) {
                Ok(MergeOutcome::Applied(merged)) => merged,
                Ok(MergeOutcome::Ignored) => {
                    debug!(collection = %name, "Incoming collection empty, keeping local");
                    continue;
                }
                Err(e) => {
                    self.report_failure(Some(name), &e, false, "Rejected incoming collection");
                    continue;
                }
            };
            if merged == local {
                continue;
            }

            let local_only = !is_covered_by(&merged, incoming);
            let mut watcher = self.watcher.lock();
            if local_only {
                watcher.rebase(name, incoming.clone());
            } else {
                watcher.rebase(name, merged.clone());
            }
            match self.store.apply_remote(name, merged) {
                Ok(()) => {
                    drop(watcher);
                    let mut push = self.push.lock();
                    if local_only {
                        debug!(collection = %name, "Kept records the remote lacks");
                        push.on_local_change([name]);
                    } else {
                        push.forget(name);
                    }
                    drop(push);
                    applied.push(name);
                }
                Err(e) => {
                    watcher.rebase(name, local);
                    drop(watcher);
                    self.report_failure(Some(name), &e, false, "Failed to store collection");
                }
            }
        }

        if !applied.is_empty() {
            self.refresh_pending();
        }
        applied
    }

    async fn apply_remote(&self, snapshot: SyncSnapshot, source: Option<DeviceId>) {
        let _permit = match self.gate.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                warn!(error = %e, "Dropping remote snapshot");
                return;
            }
        };
        let applied = self.apply_snapshot(&snapshot);
        if !applied.is_empty() {
            info!(source = ?source, collections = ?applied, "Applied remote changes");
            self.emit(SyncEvent::CollectionsApplied {
                collections: applied,
                source,
            });
        }
    }

    async fn handle_message(self: &Arc<Self>, message: SyncMessage, path: TransportPath) {
        if message.source_device_id == self.device_id {
            trace!(kind = ?message.kind, ?path, "Dropping self-originated message");
            return;
        }

        match message.kind {
            MessageKind::RequestSync => {
                // The real-time path answers through provide_full_sync.
                if path.is_local() {
                    let snapshot = self.store.snapshot(CollectionName::ALL);
                    let reply = SyncMessage::full_sync(&self.device_id, &snapshot);
                    if let Err(e) = self.transport.send(&reply) {
                        warn!(error = %e, "Failed to answer sync request");
                    }
                }
            }
            MessageKind::FullSync if message.is_completion_notice() => {
                debug!(source = %message.source_device_id, "Peer completed a full push");
                self.spawn_pull(PullTrigger::RemoteNotification);
            }
            MessageKind::StateUpdate | MessageKind::FullSync => match message.snapshot() {
                Ok(snapshot) => {
                    self.apply_remote(snapshot, Some(message.source_device_id))
                        .await
                }
                Err(e) => {
                    self.report_failure(message.store, &e, false, "Rejected malformed message")
                }
            },
        }
    }

    async fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connected { peer_count } => {
                self.status.set_connected(true);
                self.status.set_peer_count(peer_count);
                // Changes made while offline go out before peers answer with
                // their older state.
                self.flush_pending().await;
                if self.config.request_full_sync_on_connect {
                    if let Err(e) = self.transport.request_full_sync() {
                        debug!(error = %e, "Full-sync request not sent");
                    }
                }
            }
            TransportEvent::Disconnected { reason } => {
                info!(%reason, "Real-time channel disconnected");
                self.status.set_connected(false);
            }
            TransportEvent::ConnectionError { message } => {
                warn!(%message, "Real-time channel gave up");
                self.status.set_connected(false);
                self.status.record_error(message.clone());
                self.emit(SyncEvent::SyncError {
                    collection: None,
                    message,
                });
            }
            TransportEvent::PeerJoined(device_id) => {
                self.status.set_peer_count(self.transport.peer_count());
                self.emit(SyncEvent::PeerJoined { device_id });
            }
            TransportEvent::PeerLeft(device_id) => {
                self.status.set_peer_count(self.transport.peer_count());
                self.emit(SyncEvent::PeerLeft { device_id });
            }
            TransportEvent::MessageReceived { message, path } => {
                self.handle_message(message, path).await
            }
            TransportEvent::FullSyncRequested { requesting } => {
                let snapshot = self.store.snapshot(CollectionName::ALL);
                if let Err(e) = self.transport.provide_full_sync(&requesting, snapshot) {
                    warn!(requesting = %requesting, error = %e, "Failed to provide full sync");
                }
            }
            TransportEvent::FullSyncReceived(snapshot) => self.apply_remote(snapshot, None).await,
            TransportEvent::OrderNotification(payload) => {
                self.emit(SyncEvent::OrderNotification { payload })
            }
        }
    }
}

/// The engine's event loop.
async fn run(
    inner: Arc<EngineInner>,
    mut store_rx: broadcast::Receiver<StoreChange>,
    mut transport_rx: broadcast::Receiver<TransportEvent>,
    mut due_rx: mpsc::UnboundedReceiver<PushDue>,
    shutdown: CancellationToken,
) {
    let mut ticker = inner.pulls.ticker();

    loop {
        let deferred = inner.push.lock().is_deferred();

        tokio::select! {
            _ = shutdown.cancelled() => break,
            change = store_rx.recv() => match change {
                Ok(change) => inner.on_store_change(&[change.collection]),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Store listener lagged, rescanning");
                    inner.on_store_change(&CollectionName::ALL);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            Some(due) = due_rx.recv() => inner.on_push_due(due).await,
            event = transport_rx.recv() => match event {
                Ok(event) => inner.on_transport_event(event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Transport listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = ticker.tick() => inner.spawn_pull(PullTrigger::Interval),
            _ = inner.gate.released(), if deferred => {
                if inner.push.lock().release_deferred() {
                    debug!("Deferred push re-armed");
                }
            }
        }
    }

    debug!("Sync loop stopped");
}
