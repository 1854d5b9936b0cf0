//! Engine configuration, stored as `config.json` in the data directory.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SyncError, SyncResult};

/// File name of the configuration inside a data directory.
pub const CONFIG_FILE: &str = "config.json";

/// Matcher for the record that a protect-identity merge must never drop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProtectedIdentity {
    /// Record field compared against `value`
    pub field: String,
    /// Value identifying the sentinel record
    pub value: Value,
    /// Record inserted when neither side of a merge holds the sentinel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<Value>,
}

impl ProtectedIdentity {
    /// Whether `record` is the sentinel.
    pub fn matches(&self, record: &Value) -> bool {
        record.get(&self.field) == Some(&self.value)
    }
}

impl Default for ProtectedIdentity {
    fn default() -> Self {
        Self {
            field: "username".to_string(),
            value: Value::String("admin".to_string()),
            fallback: None,
        }
    }
}

/// Sync configuration for this device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Base URL of the full-sync HTTP service
    pub server_url: Option<String>,
    /// WebSocket URL of the coordinating service
    pub realtime_url: Option<String>,
    pub debounce_ms: u64,
    pub pull_interval_secs: u64,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub request_full_sync_on_connect: bool,
    pub protected_identity: ProtectedIdentity,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            realtime_url: None,
            debounce_ms: 1500,
            pull_interval_secs: 300,
            reconnect_attempts: 5,
            reconnect_delay_ms: 2000,
            request_timeout_secs: 30,
            request_full_sync_on_connect: true,
            protected_identity: ProtectedIdentity::default(),
        }
    }
}

impl SyncConfig {
    /// Load the config from `dir/config.json`. Returns default if the file
    /// does not exist.
    pub fn load(dir: impl AsRef<Path>) -> SyncResult<Self> {
        let path = dir.as_ref().join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path)?;
        let config: SyncConfig = serde_json::from_str(&text)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config to `dir/config.json`.
    pub fn save(&self, dir: impl AsRef<Path>) -> SyncResult<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(dir.join(CONFIG_FILE), text)?;
        Ok(())
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.debounce_ms == 0 {
            return Err(SyncError::Config("debounce_ms must be positive".into()));
        }
        if self.pull_interval_secs == 0 {
            return Err(SyncError::Config("pull_interval_secs must be positive".into()));
        }
        if self.reconnect_attempts == 0 {
            return Err(SyncError::Config("reconnect_attempts must be positive".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(SyncError::Config("request_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn pull_interval(&self) -> Duration {
        Duration::from_secs(self.pull_interval_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
