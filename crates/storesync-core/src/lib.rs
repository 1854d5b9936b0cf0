//! Storesync Core Library
//!
//! Keeps shared collections consistent across devices.
//!
//! ## Overview
//!
//! Each device holds the full value of every collection (staff, partners,
//! distributors, products, feedback, settings, content) and works offline.
//! Local edits are pushed to peers after a short debounce; the authoritative
//! snapshot from the full-sync service is pulled on startup, on an interval,
//! when the application becomes visible again and when a peer announces a
//! completed push.
//!
//! ## Core Principles
//!
//! - **Whole collections**: the unit of transfer is an entire collection,
//!   never a single record
//! - **Graceful degradation**: the real-time channel is optional; the
//!   same-process broadcast and the persisted cache keep working without it
//! - **No echoes**: messages from this device are dropped on receipt, and
//!   applying remote data never schedules a push
//! - **No lockout**: the protected identity record survives every merge
//!
//! ## Quick Start
//!
//! ```ignore
//! use storesync_core::{CollectionName, SyncConfig, SyncEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig {
//!         server_url: Some("http://localhost:3000".into()),
//!         ..Default::default()
//!     };
//!     let engine = SyncEngine::open("~/.storesync/data", config)?;
//!     engine.start().await?;
//!
//!     engine
//!         .save_record(CollectionName::Partners, serde_json::json!({ "id": "P1" }))
//!         .await?;
//!
//!     println!("{}", engine.status());
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod storage;
pub mod store;
pub mod sync;
pub mod types;

// Re-exports
pub use config::{ProtectedIdentity, SyncConfig};
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::{SyncError, SyncResult};
pub use storage::Storage;
pub use store::{ChangeOrigin, CollectionStore, StoreChange};
pub use sync::{
    BroadcastHub, CacheHub, ConnectionState, FullSyncClient, FullSyncDocument, HttpSyncClient,
    MemoryRelay, MergePolicy, MergeStrategy, PullOutcome, PullTrigger, PushOutcome, RealtimeLink,
    SyncEvent, SyncMessage, SyncSnapshot, TransportChannel, WebSocketLink,
};
pub use types::*;
