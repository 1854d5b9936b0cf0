//! Shared handle over the [`ConnectionState`].

use std::sync::Arc;

use tokio::sync::watch;

use super::events::ConnectionState;

/// Cloneable writer/reader for the connection state.
///
/// Subscribers are woken on every change through a watch channel.
#[derive(Clone)]
pub struct StatusHandle {
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl StatusHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::default());
        Self { tx: Arc::new(tx) }
    }

    /// Current state.
    pub fn snapshot(&self) -> ConnectionState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    pub fn set_connected(&self, connected: bool) {
        self.tx.send_modify(|s| {
            s.connected = connected;
            if !connected {
                s.peer_count = 0;
            }
        });
    }

    pub fn set_peer_count(&self, peer_count: usize) {
        self.tx.send_modify(|s| s.peer_count = peer_count);
    }

    /// A pull or push succeeded at `timestamp`.
    pub fn record_sync(&self, timestamp: i64) {
        self.tx.send_modify(|s| {
            s.last_sync_time = Some(timestamp);
            s.last_error = None;
        });
    }

    pub fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.tx.send_modify(|s| s.last_error = Some(message));
    }

    pub fn set_in_flight(&self, in_flight: bool) {
        self.tx.send_modify(|s| s.sync_in_flight = in_flight);
    }

    pub fn set_pending(&self, pending_count: usize) {
        self.tx.send_if_modified(|s| {
            let changed = s.pending_count != pending_count;
            s.pending_count = pending_count;
            changed
        });
    }
}

impl Default for StatusHandle {
    fn default() -> Self {
        Self::new()
    }
}
