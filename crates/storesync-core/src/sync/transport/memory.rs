//! In-process coordinating service.
//!
//! [`MemoryRelay`] implements [`RealtimeLink`] with the same routing the
//! hosted service performs: state updates and full-sync requests go to every
//! other device, full-sync responses go to their target, and presence
//! changes are announced to everyone else. It can be taken offline and can
//! drop individual devices, which makes reconnect paths testable.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::realtime::{RealtimeLink, RealtimeSession};
use crate::error::{SyncError, SyncResult};
use crate::sync::protocol::{
    ClientEvent, DevicePresence, ProvideFullSync, ServerEvent, SyncConnected,
};
use crate::types::{now_millis, DeviceId};

struct Registration {
    connection: u64,
    tx: mpsc::UnboundedSender<ServerEvent>,
    kick: CancellationToken,
}

#[derive(Default)]
struct RelayState {
    available: bool,
    next_connection: u64,
    open_attempts: usize,
    devices: HashMap<DeviceId, Registration>,
}

impl RelayState {
    fn send_to_others(&self, sender: &DeviceId, event: &ServerEvent) {
        for (id, reg) in &self.devices {
            if id != sender {
                let _ = reg.tx.send(event.clone());
            }
        }
    }
}

/// Coordinating service living in this process.
#[derive(Clone)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RelayState {
                available: true,
                ..Default::default()
            })),
        }
    }

    /// Accept or refuse new sessions. Existing sessions are unaffected.
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// Devices currently registered.
    pub fn connected_devices(&self) -> usize {
        self.state.lock().devices.len()
    }

    pub fn is_registered(&self, device_id: &DeviceId) -> bool {
        self.state.lock().devices.contains_key(device_id)
    }

    /// Number of `open` calls seen, refused ones included.
    pub fn open_attempts(&self) -> usize {
        self.state.lock().open_attempts
    }

    /// Drop a device's session as if the network failed.
    pub fn kick(&self, device_id: &DeviceId) -> bool {
        match self.state.lock().devices.get(device_id) {
            Some(reg) => {
                reg.kick.cancel();
                true
            }
            None => false,
        }
    }

    fn handle(
        &self,
        connection: u64,
        registered: &mut Option<DeviceId>,
        event: ClientEvent,
        reply: &mpsc::UnboundedSender<ServerEvent>,
        kick: &CancellationToken,
    ) {
        let mut state = self.state.lock();
        match event {
            ClientEvent::RegisterDevice(device_id) => {
                state.devices.insert(
                    device_id.clone(),
                    Registration {
                        connection,
                        tx: reply.clone(),
                        kick: kick.clone(),
                    },
                );
                let _ = reply.send(ServerEvent::SyncConnected(SyncConnected {
                    device_id: device_id.clone(),
                    connected_devices: state.devices.len(),
                    timestamp: now_millis(),
                }));
                state.send_to_others(
                    &device_id,
                    &ServerEvent::DeviceJoined(DevicePresence {
                        device_id: device_id.clone(),
                    }),
                );
                debug!(device = %device_id, devices = state.devices.len(), "Relay registered device");
                *registered = Some(device_id);
            }
            ClientEvent::SyncState(payload) => {
                let sender = payload.device_id.clone();
                state.send_to_others(&sender, &ServerEvent::StateUpdate(payload));
            }
            ClientEvent::RequestFullSync(requesting) => {
                state.send_to_others(
                    &requesting,
                    &ServerEvent::ProvideFullSync(ProvideFullSync {
                        requesting_device_id: requesting.clone(),
                    }),
                );
            }
            ClientEvent::FullSyncResponse(response) => {
                if let Some(target) = state.devices.get(&response.target_device_id) {
                    let _ = target.tx.send(ServerEvent::ReceiveFullSync(response.state));
                }
            }
            ClientEvent::NewOrder(order) => {
                if let Some(sender) = registered.as_ref() {
                    state.send_to_others(sender, &ServerEvent::OrderNotification(order));
                }
            }
        }
    }

    fn unregister(&self, connection: u64, registered: Option<DeviceId>) {
        let Some(device_id) = registered else {
            return;
        };
        let mut state = self.state.lock();
        let ours = state
            .devices
            .get(&device_id)
            .is_some_and(|reg| reg.connection == connection);
        if ours {
            state.devices.remove(&device_id);
            state.send_to_others(
                &device_id,
                &ServerEvent::DeviceLeft(DevicePresence {
                    device_id: device_id.clone(),
                }),
            );
            debug!(device = %device_id, "Relay unregistered device");
        }
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RealtimeLink for MemoryRelay {
    async fn open(&self, device_id: &DeviceId) -> SyncResult<RealtimeSession> {
        let connection = {
            let mut state = self.state.lock();
            state.open_attempts += 1;
            if !state.available {
                return Err(SyncError::Connection(format!(
                    "relay refused session for {}",
                    device_id
                )));
            }
            state.next_connection += 1;
            state.next_connection
        };

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<ServerEvent>();
        let kick = CancellationToken::new();
        let relay = self.clone();

        tokio::spawn(async move {
            let mut registered = None;
            loop {
                tokio::select! {
                    _ = kick.cancelled() => break,
                    event = out_rx.recv() => match event {
                        Some(event) => relay.handle(connection, &mut registered, event, &in_tx, &kick),
                        None => break,
                    },
                }
            }
            relay.unregister(connection, registered);
        });

        Ok(RealtimeSession {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
