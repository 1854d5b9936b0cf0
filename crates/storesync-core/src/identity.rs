//! Device identity
//!
//! Every running client instance owns exactly one [`DeviceId`]. It is created
//! on first run, persisted, and never rotated: every outgoing message is
//! tagged with it and every incoming message carrying it is dropped as an
//! echo of our own send.

use tracing::info;

use crate::error::SyncError;
use crate::storage::Storage;
use crate::types::DeviceId;

/// Load the persisted device identifier or create and persist a new one.
///
/// The identifier is written before it is returned, so a crash right after
/// creation still yields the same value on the next start. A stored value
/// that cannot be read is an error; it is never silently replaced, since a
/// new identifier would make this device treat its own earlier messages as
/// foreign.
pub fn get_or_create(storage: &Storage) -> Result<DeviceId, SyncError> {
    if let Some(existing) = storage.load_device_id()? {
        let existing = existing.trim();
        if existing.is_empty() {
            return Err(SyncError::Identity(
                "Stored device identifier is empty".to_string(),
            ));
        }
        return Ok(DeviceId::from_string(existing));
    }

    let device_id = DeviceId::generate();
    storage.save_device_id(device_id.as_str())?;
    info!(%device_id, "Generated new device identity");
    Ok(device_id)
}
