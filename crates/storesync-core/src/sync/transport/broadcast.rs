//! Same-process broadcast path.
//!
//! Every engine instance in one process that shares a [`BroadcastHub`]
//! receives every message published on it, its own included; the engine's
//! self-filter drops the echo.

use std::sync::Arc;

use tokio::sync::broadcast;

const HUB_CAPACITY: usize = 256;

/// Fan-out of serialized messages between instances of one process.
pub struct BroadcastHub {
    tx: broadcast::Sender<String>,
}

impl BroadcastHub {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(HUB_CAPACITY);
        Arc::new(Self { tx })
    }

    /// Publish a serialized message. Returns the number of listeners reached.
    pub fn publish(&self, text: String) -> usize {
        self.tx.send(text).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
