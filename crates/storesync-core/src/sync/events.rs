//! Sync event types and connection state
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  ConnectionState: bookkeeping surface for UI/observability      │
//! │  ├── connected / peer_count: real-time channel presence         │
//! │  ├── last_sync_time / last_error: outcome of the last sync      │
//! │  └── sync_in_flight / pending_count: gate and push backlog      │
//! │                                                                 │
//! │  SyncEvent: notifications about sync activity                   │
//! │  ├── CollectionsApplied: remote data was merged locally         │
//! │  ├── PeerJoined / PeerLeft: device presence changed             │
//! │  ├── Pushed / Pulled: a sync operation completed                │
//! │  ├── SyncError: a background operation failed                   │
//! │  ├── UserNotice: failure of a user-triggered pull/push          │
//! │  └── OrderNotification: relayed order payload                   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::types::{CollectionName, DeviceId};

/// Bookkeeping consumed by UI and observability collaborators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    /// Whether the real-time channel is up
    pub connected: bool,
    /// Other devices connected to the coordinating service
    pub peer_count: usize,
    /// Millisecond timestamp of the last successful pull or push
    pub last_sync_time: Option<i64>,
    pub last_error: Option<String>,
    /// True for the whole duration of one pull, push or remote apply
    pub sync_in_flight: bool,
    /// Collections changed locally and not yet pushed
    pub pending_count: usize,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.connected {
            write!(f, "Connected ({} peers)", self.peer_count)?;
        } else {
            write!(f, "Offline")?;
        }
        if self.sync_in_flight {
            write!(f, ", syncing")?;
        }
        if self.pending_count > 0 {
            write!(f, ", {} pending", self.pending_count)?;
        }
        if let Some(err) = &self.last_error {
            write!(f, ", error: {}", err)?;
        }
        Ok(())
    }
}

/// What started a pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullTrigger {
    Startup,
    Interval,
    VisibilityRegained,
    /// A peer announced it completed a full push
    RemoteNotification,
    /// Explicitly requested by the user
    User,
}

impl PullTrigger {
    /// Only user-initiated pulls surface failures to the user.
    pub fn announces(&self) -> bool {
        matches!(self, PullTrigger::User)
    }
}

/// Events emitted by the sync engine
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Remote data was merged into local collections
    CollectionsApplied {
        collections: Vec<CollectionName>,
        /// Device the data came from, if known
        source: Option<DeviceId>,
    },
    /// A device joined the coordinating service
    PeerJoined { device_id: DeviceId },
    /// A device left the coordinating service
    PeerLeft { device_id: DeviceId },
    /// Local collections were pushed
    Pushed { collections: Vec<CollectionName> },
    /// A full snapshot was pulled
    Pulled { trigger: PullTrigger },
    /// A background operation failed
    SyncError {
        collection: Option<CollectionName>,
        message: String,
    },
    /// A user-triggered operation failed and should be shown to the user
    UserNotice { message: String },
    /// An order was relayed by the coordinating service
    OrderNotification { payload: Value },
}

impl SyncEvent {
    /// Get the collection associated with this event, if there is exactly one
    pub fn collection(&self) -> Option<CollectionName> {
        match self {
            SyncEvent::CollectionsApplied { collections, .. }
            | SyncEvent::Pushed { collections } => match collections.as_slice() {
                [name] => Some(*name),
                _ => None,
            },
            SyncEvent::SyncError { collection, .. } => *collection,
            _ => None,
        }
    }
}
