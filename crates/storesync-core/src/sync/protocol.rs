//! Sync protocol messages
//!
//! Messages are serialized as JSON text, the same encoding on every path
//! (real-time channel, in-process broadcast, persisted cache).
//!
//! ## Message Flow
//!
//! ```text
//! Device A                  coordinating service                 Device B
//!   |                               |                               |
//!   |-- register-device ----------->|                               |
//!   |<- sync-connected -------------|                               |
//!   |                               |-- device-joined ------------->|
//!   |-- sync-state {partners} ----->|-- state-update {partners} --->|
//!   |                               |                               |
//!   |-- request-full-sync --------->|-- provide-full-sync --------->|
//!   |<- receive-full-sync ----------|<- full-sync-response ---------|
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::error::{SyncError, SyncResult};
use crate::types::{now_millis, CollectionName, DeviceId};

/// Action of a debounced local push.
pub const ACTION_REPLACE: &str = "replace";
/// Action of a full-sync request.
pub const ACTION_REQUEST: &str = "request";
/// Action of a full snapshot sent to peers.
pub const ACTION_SNAPSHOT: &str = "snapshot";
/// Action announcing that the sender finished a full push to the service.
pub const ACTION_COMPLETED: &str = "completed";

/// Kind of a [`SyncMessage`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// One or more collections changed on the sender
    #[default]
    StateUpdate,
    /// The sender asks peers for their full state
    RequestSync,
    /// A full snapshot, or the notice that a full push completed
    FullSync,
}

/// A complete value for one or more collections at a point in time.
///
/// Never partial: every named collection carries its entire value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub collections: BTreeMap<CollectionName, Value>,
    pub timestamp: i64,
}

impl SyncSnapshot {
    pub fn names(&self) -> Vec<CollectionName> {
        self.collections.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    /// Build a snapshot from a JSON object keyed by collection name.
    ///
    /// Keys that name no known collection are skipped.
    pub fn from_payload(payload: &Value, timestamp: i64) -> SyncResult<Self> {
        let map = payload.as_object().ok_or_else(|| {
            SyncError::Serialization("snapshot payload must be an object".to_string())
        })?;

        let mut collections = BTreeMap::new();
        for (key, value) in map {
            match key.parse::<CollectionName>() {
                Ok(name) => {
                    collections.insert(name, value.clone());
                }
                Err(_) => trace!(key = %key, "Skipping unknown collection in payload"),
            }
        }
        Ok(Self {
            collections,
            timestamp,
        })
    }

    /// The collections as a JSON object keyed by collection name.
    pub fn to_payload(&self) -> Value {
        Value::Object(
            self.collections
                .iter()
                .map(|(name, value)| (name.as_str().to_string(), value.clone()))
                .collect(),
        )
    }
}

/// A message exchanged between devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    pub kind: MessageKind,
    /// The collection this message concerns; `None` when it spans several
    pub store: Option<CollectionName>,
    pub action: String,
    /// Collections keyed by name (empty object for requests and notices)
    pub payload: Value,
    pub source_device_id: DeviceId,
    pub timestamp: i64,
}

impl SyncMessage {
    /// A push of the collections in `snapshot`.
    pub fn state_update(source: &DeviceId, snapshot: &SyncSnapshot) -> Self {
        let names = snapshot.names();
        Self {
            kind: MessageKind::StateUpdate,
            store: single(&names),
            action: ACTION_REPLACE.to_string(),
            payload: snapshot.to_payload(),
            source_device_id: source.clone(),
            timestamp: snapshot.timestamp,
        }
    }

    /// Ask peers on the local paths to broadcast their full state.
    pub fn request_sync(source: &DeviceId) -> Self {
        Self {
            kind: MessageKind::RequestSync,
            store: None,
            action: ACTION_REQUEST.to_string(),
            payload: Value::Object(Default::default()),
            source_device_id: source.clone(),
            timestamp: now_millis(),
        }
    }

    /// A full snapshot for peers.
    pub fn full_sync(source: &DeviceId, snapshot: &SyncSnapshot) -> Self {
        Self {
            kind: MessageKind::FullSync,
            store: None,
            action: ACTION_SNAPSHOT.to_string(),
            payload: snapshot.to_payload(),
            source_device_id: source.clone(),
            timestamp: snapshot.timestamp,
        }
    }

    /// Tell peers a full push to the service completed, so they should pull.
    pub fn full_sync_completed(source: &DeviceId) -> Self {
        Self {
            kind: MessageKind::FullSync,
            store: None,
            action: ACTION_COMPLETED.to_string(),
            payload: Value::Object(Default::default()),
            source_device_id: source.clone(),
            timestamp: now_millis(),
        }
    }

    pub fn is_completion_notice(&self) -> bool {
        self.kind == MessageKind::FullSync && self.action == ACTION_COMPLETED
    }

    /// The collections carried by this message.
    pub fn snapshot(&self) -> SyncResult<SyncSnapshot> {
        SyncSnapshot::from_payload(&self.payload, self.timestamp)
    }

    /// Encode message to JSON text
    pub fn encode(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode message from JSON text
    pub fn decode(text: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

fn single(names: &[CollectionName]) -> Option<CollectionName> {
    match names {
        [name] => Some(*name),
        _ => None,
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Full-sync HTTP document
// ═══════════════════════════════════════════════════════════════════════

/// Body of `GET /api/sync/full` and `POST /api/sync/full`.
///
/// Collections the service omits stay `None` and are left untouched locally.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullSyncDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staff: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partners: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distributors: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub products: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<Value>,
}

impl FullSyncDocument {
    fn slot(&mut self, name: CollectionName) -> &mut Option<Value> {
        match name {
            CollectionName::Staff => &mut self.staff,
            CollectionName::Partners => &mut self.partners,
            CollectionName::Distributors => &mut self.distributors,
            CollectionName::Products => &mut self.products,
            CollectionName::Feedback => &mut self.feedback,
            CollectionName::Settings => &mut self.settings,
            CollectionName::Content => &mut self.content,
        }
    }

    pub fn from_snapshot(snapshot: &SyncSnapshot) -> Self {
        let mut doc = Self::default();
        for (name, value) in &snapshot.collections {
            *doc.slot(*name) = Some(value.clone());
        }
        doc.last_sync = Some(Value::from(snapshot.timestamp));
        doc
    }

    pub fn into_snapshot(mut self) -> SyncSnapshot {
        let mut collections = BTreeMap::new();
        for name in CollectionName::ALL {
            if let Some(value) = self.slot(name).take() {
                collections.insert(name, value);
            }
        }
        SyncSnapshot {
            collections,
            timestamp: now_millis(),
        }
    }
}

/// Response of `POST /api/sync/full`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushAck {
    pub timestamp: Value,
}

// ═══════════════════════════════════════════════════════════════════════
// Real-time channel events
// ═══════════════════════════════════════════════════════════════════════

/// Body of `sync-state` / `state-update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatePayload {
    #[serde(default)]
    pub kind: MessageKind,
    pub store: Option<CollectionName>,
    pub action: String,
    pub payload: Value,
    pub device_id: DeviceId,
    pub timestamp: i64,
}

impl From<SyncMessage> for SyncStatePayload {
    fn from(msg: SyncMessage) -> Self {
        Self {
            kind: msg.kind,
            store: msg.store,
            action: msg.action,
            payload: msg.payload,
            device_id: msg.source_device_id,
            timestamp: msg.timestamp,
        }
    }
}

impl From<SyncStatePayload> for SyncMessage {
    fn from(p: SyncStatePayload) -> Self {
        Self {
            kind: p.kind,
            store: p.store,
            action: p.action,
            payload: p.payload,
            source_device_id: p.device_id,
            timestamp: p.timestamp,
        }
    }
}

/// Body of `full-sync-response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullSyncResponse {
    pub target_device_id: DeviceId,
    pub state: SyncSnapshot,
}

/// Body of `sync-connected`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConnected {
    pub device_id: DeviceId,
    /// Devices connected to the service, this one included
    pub connected_devices: usize,
    pub timestamp: i64,
}

/// Body of `device-joined` / `device-left`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePresence {
    pub device_id: DeviceId,
}

/// Body of `provide-full-sync`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvideFullSync {
    pub requesting_device_id: DeviceId,
}

/// Events a device sends to the coordinating service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    RegisterDevice(DeviceId),
    SyncState(SyncStatePayload),
    RequestFullSync(DeviceId),
    FullSyncResponse(FullSyncResponse),
    NewOrder(Value),
}

/// Events the coordinating service sends to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    SyncConnected(SyncConnected),
    StateUpdate(SyncStatePayload),
    DeviceJoined(DevicePresence),
    DeviceLeft(DevicePresence),
    ProvideFullSync(ProvideFullSync),
    ReceiveFullSync(SyncSnapshot),
    OrderNotification(Value),
}
