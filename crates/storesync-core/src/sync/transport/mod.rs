//! Transport channel: one outbound API over three delivery paths
//!
//! ```text
//!                      TransportChannel::send(msg)
//!                                 │
//!         ┌───────────────────────┼────────────────────────┐
//!         ▼                       ▼                        ▼
//!   PersistedCache           BroadcastHub             RealtimeLink
//!  (always written,        (same process,           (coordinating
//!   other instances         when attached)           service, when
//!   notified)                                         connected)
//!         │                       │                        │
//!         └──────────► TransportEvent::MessageReceived ◄───┘
//! ```
//!
//! The real-time path is optional: `connect` retries a bounded number of
//! times with a fixed delay and then settles for the local paths. A session
//! that drops later is re-established by the same policy.

pub mod broadcast;
pub mod cache;
pub mod memory;
pub mod realtime;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast as tokio_broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::broadcast::BroadcastHub;
use self::cache::{CacheSubscription, PersistedCache, LAST_BROADCAST_KEY};
use self::realtime::{RealtimeLink, RealtimeSession};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::sync::protocol::{ClientEvent, FullSyncResponse, ServerEvent, SyncMessage, SyncSnapshot};
use crate::types::DeviceId;

const EVENT_CAPACITY: usize = 256;

/// Which path delivered a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportPath {
    Realtime,
    Broadcast,
    Cache,
}

impl TransportPath {
    /// Local paths never reach devices outside this machine.
    pub fn is_local(&self) -> bool {
        !matches!(self, TransportPath::Realtime)
    }
}

/// Events raised by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The coordinating service accepted our registration
    Connected { peer_count: usize },
    /// The real-time session ended
    Disconnected { reason: String },
    /// Reconnect attempts were exhausted
    ConnectionError { message: String },
    PeerJoined(DeviceId),
    PeerLeft(DeviceId),
    MessageReceived {
        message: SyncMessage,
        path: TransportPath,
    },
    /// Another device asked for our full state
    FullSyncRequested { requesting: DeviceId },
    /// A peer answered our full-state request
    FullSyncReceived(SyncSnapshot),
    OrderNotification(Value),
}

/// Which paths a message went out on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendReport {
    pub realtime: bool,
    pub broadcast: bool,
    pub cache: bool,
}

/// Reconnect policy for the real-time path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl TransportOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            reconnect_attempts: config.reconnect_attempts,
            reconnect_delay: config.reconnect_delay(),
        }
    }
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

#[derive(Default)]
struct LinkState {
    device_id: Option<DeviceId>,
    session: u64,
    outbound: Option<mpsc::UnboundedSender<ClientEvent>>,
    connected: bool,
    peer_count: usize,
}

struct Shared {
    options: TransportOptions,
    events: tokio_broadcast::Sender<TransportEvent>,
    link: Mutex<LinkState>,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn deliver(&self, text: &str, path: TransportPath) {
        match SyncMessage::decode(text) {
            Ok(message) => self.emit(TransportEvent::MessageReceived { message, path }),
            Err(e) => debug!(?path, error = %e, "Dropping undecodable message"),
        }
    }

    fn install(&self, device_id: &DeviceId, session: &RealtimeSession) -> u64 {
        let _ = session
            .outbound
            .send(ClientEvent::RegisterDevice(device_id.clone()));
        let mut link = self.link.lock();
        link.session += 1;
        link.outbound = Some(session.outbound.clone());
        link.session
    }

    /// Clear the link if `session` is still the current one.
    /// Returns whether it had reached the connected state.
    fn uninstall(&self, session: u64) -> bool {
        let mut link = self.link.lock();
        if link.session != session {
            return false;
        }
        link.outbound = None;
        link.peer_count = 0;
        std::mem::take(&mut link.connected)
    }

    fn handle_server_event(&self, device_id: &DeviceId, event: ServerEvent) {
        match event {
            ServerEvent::SyncConnected(connected) => {
                let peer_count = connected.connected_devices.saturating_sub(1);
                {
                    let mut link = self.link.lock();
                    link.connected = true;
                    link.peer_count = peer_count;
                }
                info!(peer_count, "Real-time channel connected");
                self.emit(TransportEvent::Connected { peer_count });
            }
            ServerEvent::StateUpdate(payload) => self.emit(TransportEvent::MessageReceived {
                message: payload.into(),
                path: TransportPath::Realtime,
            }),
            ServerEvent::DeviceJoined(presence) => {
                if &presence.device_id == device_id {
                    return;
                }
                self.link.lock().peer_count += 1;
                self.emit(TransportEvent::PeerJoined(presence.device_id));
            }
            ServerEvent::DeviceLeft(presence) => {
                if &presence.device_id == device_id {
                    return;
                }
                {
                    let mut link = self.link.lock();
                    link.peer_count = link.peer_count.saturating_sub(1);
                }
                self.emit(TransportEvent::PeerLeft(presence.device_id));
            }
            ServerEvent::ProvideFullSync(request) => self.emit(TransportEvent::FullSyncRequested {
                requesting: request.requesting_device_id,
            }),
            ServerEvent::ReceiveFullSync(snapshot) => {
                self.emit(TransportEvent::FullSyncReceived(snapshot))
            }
            ServerEvent::OrderNotification(order) => {
                self.emit(TransportEvent::OrderNotification(order))
            }
        }
    }
}

/// Outbound and inbound messaging for one engine instance.
pub struct TransportChannel {
    shared: Arc<Shared>,
    cache: PersistedCache,
    broadcast: Option<Arc<BroadcastHub>>,
    realtime: Option<Arc<dyn RealtimeLink>>,
    running: Mutex<Option<CancellationToken>>,
}

impl TransportChannel {
    /// Create a transport using only the persisted-cache path.
    pub fn new(cache: PersistedCache, options: TransportOptions) -> Self {
        let (events, _) = tokio_broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                options,
                events,
                link: Mutex::new(LinkState::default()),
            }),
            cache,
            broadcast: None,
            realtime: None,
            running: Mutex::new(None),
        }
    }

    /// Attach a same-process broadcast hub.
    pub fn with_broadcast(mut self, hub: Arc<BroadcastHub>) -> Self {
        self.broadcast = Some(hub);
        self
    }

    /// Attach a link to the coordinating service.
    pub fn with_realtime(mut self, link: Arc<dyn RealtimeLink>) -> Self {
        self.realtime = Some(link);
        self
    }

    /// Subscribe to transport events. Subscribe before `connect` to see
    /// everything it raises.
    pub fn subscribe(&self) -> tokio_broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }

    /// Start listening on every path and open the real-time session.
    ///
    /// Never fails: when the coordinating service stays unreachable after
    /// the configured attempts a [`TransportEvent::ConnectionError`] is
    /// raised and the local paths keep working.
    pub async fn connect(&self, device_id: &DeviceId) {
        self.disconnect();
        let token = CancellationToken::new();
        *self.running.lock() = Some(token.clone());
        self.shared.link.lock().device_id = Some(device_id.clone());

        if let Some(hub) = &self.broadcast {
            spawn_broadcast_listener(hub.subscribe(), self.shared.clone(), token.clone());
        }
        spawn_cache_listener(self.cache.subscribe(), self.shared.clone(), token.clone());

        let Some(link) = self.realtime.clone() else {
            debug!("No real-time link configured; local paths only");
            return;
        };
        match open_with_retries(link.as_ref(), device_id, &self.shared, &token).await {
            Some(session) => {
                tokio::spawn(supervise(
                    link,
                    device_id.clone(),
                    self.shared.clone(),
                    token,
                    session,
                ));
            }
            None => warn!("Real-time channel unavailable; continuing on local paths"),
        }
    }

    /// Stop listening and close the real-time session.
    pub fn disconnect(&self) {
        if let Some(token) = self.running.lock().take() {
            token.cancel();
        }
        let was_connected = {
            let mut link = self.shared.link.lock();
            link.outbound = None;
            link.peer_count = 0;
            std::mem::take(&mut link.connected)
        };
        if was_connected {
            self.shared.emit(TransportEvent::Disconnected {
                reason: "closed locally".to_string(),
            });
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.link.lock().connected
    }

    /// Whether a coordinating service link is configured, connected or not.
    pub fn has_realtime(&self) -> bool {
        self.realtime.is_some()
    }

    pub fn peer_count(&self) -> usize {
        self.shared.link.lock().peer_count
    }

    /// Send on every available path.
    ///
    /// The persisted cache is always written; the broadcast hub and the
    /// real-time session are used when present.
    pub fn send(&self, message: &SyncMessage) -> SyncResult<SendReport> {
        let text = message.encode()?;
        self.cache.write(LAST_BROADCAST_KEY, &text)?;

        let broadcast = match &self.broadcast {
            Some(hub) => {
                hub.publish(text);
                true
            }
            None => false,
        };
        let realtime = self.send_realtime(ClientEvent::SyncState(message.clone().into()));

        debug!(kind = ?message.kind, realtime, broadcast, "Message sent");
        Ok(SendReport {
            realtime,
            broadcast,
            cache: true,
        })
    }

    /// Ask the coordinating service to have peers send us their full state.
    pub fn request_full_sync(&self) -> SyncResult<()> {
        let device_id = self.device_id()?;
        self.require_realtime(ClientEvent::RequestFullSync(device_id))
    }

    /// Answer a peer's full-state request.
    pub fn provide_full_sync(&self, target: &DeviceId, snapshot: SyncSnapshot) -> SyncResult<()> {
        self.require_realtime(ClientEvent::FullSyncResponse(FullSyncResponse {
            target_device_id: target.clone(),
            state: snapshot,
        }))
    }

    /// Relay an order to the other devices.
    pub fn send_order(&self, order: Value) -> SyncResult<()> {
        self.require_realtime(ClientEvent::NewOrder(order))
    }

    /// The last message written to the persisted cache by any instance.
    pub fn last_broadcast(&self) -> SyncResult<Option<SyncMessage>> {
        self.cache
            .read(LAST_BROADCAST_KEY)?
            .map(|text| SyncMessage::decode(&text))
            .transpose()
    }

    fn device_id(&self) -> SyncResult<DeviceId> {
        self.shared
            .link
            .lock()
            .device_id
            .clone()
            .ok_or_else(|| SyncError::InvalidOperation("transport is not connected".to_string()))
    }

    fn send_realtime(&self, event: ClientEvent) -> bool {
        let link = self.shared.link.lock();
        match &link.outbound {
            Some(tx) if link.connected => tx.send(event).is_ok(),
            _ => false,
        }
    }

    fn require_realtime(&self, event: ClientEvent) -> SyncResult<()> {
        if self.send_realtime(event) {
            Ok(())
        } else {
            Err(SyncError::Connection(
                "real-time channel is not connected".to_string(),
            ))
        }
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        if let Some(token) = self.running.lock().take() {
            token.cancel();
        }
    }
}

fn spawn_broadcast_listener(
    mut rx: tokio_broadcast::Receiver<String>,
    shared: Arc<Shared>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(text) => shared.deliver(&text, TransportPath::Broadcast),
                    Err(tokio_broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Broadcast listener lagged");
                    }
                    Err(tokio_broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
}

fn spawn_cache_listener(
    mut subscription: CacheSubscription,
    shared: Arc<Shared>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                change = subscription.recv() => match change {
                    Some(change) if change.key == LAST_BROADCAST_KEY => {
                        shared.deliver(&change.value, TransportPath::Cache)
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }
    });
}

/// Open a session, retrying with a fixed delay.
///
/// Returns `None` when cancelled or when every attempt failed; the latter
/// raises [`TransportEvent::ConnectionError`].
async fn open_with_retries(
    link: &dyn RealtimeLink,
    device_id: &DeviceId,
    shared: &Shared,
    token: &CancellationToken,
) -> Option<RealtimeSession> {
    let attempts = shared.options.reconnect_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        if token.is_cancelled() {
            return None;
        }
        match link.open(device_id).await {
            Ok(session) => return Some(session),
            Err(e) => {
                warn!(attempt, attempts, error = %e, "Real-time connect failed");
                last_error = e.to_string();
            }
        }
        if attempt < attempts {
            tokio::select! {
                _ = token.cancelled() => return None,
                _ = tokio::time::sleep(shared.options.reconnect_delay) => {}
            }
        }
    }

    shared.emit(TransportEvent::ConnectionError {
        message: format!(
            "real-time channel unreachable after {} attempts: {}",
            attempts, last_error
        ),
    });
    None
}

/// Drive real-time sessions until cancelled or reconnecting gives up.
async fn supervise(
    link: Arc<dyn RealtimeLink>,
    device_id: DeviceId,
    shared: Arc<Shared>,
    token: CancellationToken,
    mut session: RealtimeSession,
) {
    loop {
        let id = shared.install(&device_id, &session);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = session.inbound.recv() => match event {
                    Some(event) => shared.handle_server_event(&device_id, event),
                    None => break,
                },
            }
        }
        let was_connected = shared.uninstall(id);
        drop(session);

        if token.is_cancelled() {
            return;
        }
        info!(was_connected, "Real-time session ended, reconnecting");
        shared.emit(TransportEvent::Disconnected {
            reason: "session closed".to_string(),
        });

        match open_with_retries(link.as_ref(), &device_id, &shared, &token).await {
            Some(next) => session = next,
            None => return,
        }
    }
}
