//! Persistent storage using redb.
//!
//! This module provides ACID-compliant storage for:
//! - The device identifier
//! - The persisted key-value cache (last broadcast message)
//! - The last local value of every collection

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::backends::InMemoryBackend;
use redb::{Database, ReadableTable, TableDefinition};
use serde_json::Value;

use crate::error::SyncError;
use crate::types::CollectionName;

// Table definitions
const IDENTITY_TABLE: TableDefinition<&str, &str> = TableDefinition::new("identity");
const CACHE_TABLE: TableDefinition<&str, &str> = TableDefinition::new("cache");
const COLLECTIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("collections");

const DEVICE_ID_KEY: &str = "device_id";

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// This will:
    /// - Create the database directory if it doesn't exist
    /// - Initialize the database file
    /// - Create all required tables
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Create a storage instance that lives only in memory.
    pub fn in_memory() -> Result<Self, SyncError> {
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self, SyncError> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(IDENTITY_TABLE)?;
            let _ = write_txn.open_table(CACHE_TABLE)?;
            let _ = write_txn.open_table(COLLECTIONS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Identity Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Load the persisted device identifier, if one was ever written.
    pub fn load_device_id(&self) -> Result<Option<String>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(IDENTITY_TABLE)?;
        let value = table.get(DEVICE_ID_KEY)?.map(|v| v.value().to_string());
        Ok(value)
    }

    /// Persist the device identifier.
    pub fn save_device_id(&self, device_id: &str) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(IDENTITY_TABLE)?;
            table.insert(DEVICE_ID_KEY, device_id)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Cache Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Read a key from the persisted cache.
    pub fn cache_get(&self, key: &str) -> Result<Option<String>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(CACHE_TABLE)?;
        let value = table.get(key)?.map(|v| v.value().to_string());
        Ok(value)
    }

    /// Write a key to the persisted cache, replacing any previous value.
    pub fn cache_put(&self, key: &str, value: &str) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(CACHE_TABLE)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Collection Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Save the current value of a collection.
    pub fn save_collection(&self, name: CollectionName, value: &Value) -> Result<(), SyncError> {
        let data = serde_json::to_vec(value)?;
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(COLLECTIONS_TABLE)?;
            table.insert(name.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load the saved value of a collection.
    ///
    /// Returns `None` if the collection was never saved.
    pub fn load_collection(&self, name: CollectionName) -> Result<Option<Value>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(COLLECTIONS_TABLE)?;

        match table.get(name.as_str())? {
            Some(v) => {
                let value: Value = serde_json::from_slice(v.value())?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}
