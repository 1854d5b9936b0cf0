//! Synchronization layer
//!
//! Keeps collections consistent across devices over three delivery paths.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Local edit ──► ChangeWatcher ──► PushCoordinator (debounce)    │
//! │                    ▲                     │                      │
//! │                    │ rebase              ▼                      │
//! │                    │              TransportChannel::send        │
//! │                    │              ├── PersistedCache (always)   │
//! │                    │              ├── BroadcastHub              │
//! │                    │              └── RealtimeLink              │
//! │                    │                     │                      │
//! │  MergePolicy ◄── self-filter ◄── TransportEvent (peers)         │
//! │       ▲                                                         │
//! │       └──────── PullCoordinator (startup, interval,             │
//! │                 visibility, remote notification)                │
//! │                                                                 │
//! │  SyncGate: one pull, push or remote apply at a time             │
//! │  StatusHandle: connected, peers, last sync, pending             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Protocol
//!
//! Devices exchange [`SyncMessage`]s of three kinds:
//!
//! - **StateUpdate**: complete values of the collections changed locally
//! - **RequestSync**: ask peers on the local paths for their full state
//! - **FullSync**: a full snapshot, or a notice that a full push completed
//!
//! The real-time path additionally carries presence, targeted full-sync
//! exchanges and order notifications ([`ClientEvent`] / [`ServerEvent`]).

pub mod events;
pub mod gate;
pub mod merge;
pub mod protocol;
pub mod pull;
pub mod push;
pub mod status;
pub mod transport;
pub mod watcher;

pub use events::{ConnectionState, PullTrigger, SyncEvent};
pub use gate::{SyncGate, SyncPermit};
pub use merge::{MergeOutcome, MergePolicy, MergeStrategy};
pub use protocol::{
    ClientEvent, FullSyncDocument, MessageKind, PushAck, ServerEvent, SyncMessage, SyncSnapshot,
};
pub use pull::{FullSyncClient, HttpSyncClient, PullCoordinator, PullOutcome};
pub use push::{PushCoordinator, PushDue, PushOutcome};
pub use status::StatusHandle;
pub use transport::broadcast::BroadcastHub;
pub use transport::cache::{CacheHub, PersistedCache, LAST_BROADCAST_KEY};
pub use transport::memory::MemoryRelay;
pub use transport::realtime::{RealtimeLink, RealtimeSession, WebSocketLink};
pub use transport::{
    SendReport, TransportChannel, TransportEvent, TransportOptions, TransportPath,
};
pub use watcher::ChangeWatcher;
