//! In-memory application state for every collection.
//!
//! Local business logic writes through [`CollectionStore::set_local`] and the
//! record helpers; the sync engine is the only caller of `apply_remote`.
//! Each write computes the new value fully and assigns it once, so observers
//! never see a half-applied collection.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::storage::Storage;
use crate::sync::merge::{record_id, validate_collection};
use crate::sync::protocol::SyncSnapshot;
use crate::types::{now_millis, CollectionName};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Who caused a store mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A local edit
    Local,
    /// A remote snapshot applied by the sync engine
    Remote,
}

/// Notification that one collection was reassigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub collection: CollectionName,
    pub origin: ChangeOrigin,
}

/// Current value of every collection, optionally persisted to [`Storage`].
pub struct CollectionStore {
    values: RwLock<HashMap<CollectionName, Value>>,
    storage: Option<Storage>,
    change_tx: broadcast::Sender<StoreChange>,
}

impl CollectionStore {
    /// Create a store that only lives in memory.
    pub fn new() -> Self {
        let (change_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            values: RwLock::new(HashMap::new()),
            storage: None,
            change_tx,
        }
    }

    /// Create a store backed by `storage`, resuming from the saved values.
    pub fn with_storage(storage: Storage) -> SyncResult<Self> {
        let mut values = HashMap::new();
        for name in CollectionName::ALL {
            if let Some(value) = storage.load_collection(name)? {
                values.insert(name, value);
            }
        }

        let (change_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            values: RwLock::new(values),
            storage: Some(storage),
            change_tx,
        })
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.change_tx.subscribe()
    }

    /// Current value of a collection (its empty value if never written).
    pub fn get(&self, name: CollectionName) -> Value {
        self.values
            .read()
            .get(&name)
            .cloned()
            .unwrap_or_else(|| name.empty_value())
    }

    /// Number of records in a list collection, or keys in an object one.
    pub fn len(&self, name: CollectionName) -> usize {
        match self.get(name) {
            Value::Array(items) => items.len(),
            Value::Object(map) => map.len(),
            _ => 0,
        }
    }

    /// A complete snapshot of the named collections.
    pub fn snapshot(&self, names: impl IntoIterator<Item = CollectionName>) -> SyncSnapshot {
        let values = self.values.read();
        let collections = names
            .into_iter()
            .map(|name| {
                let value = values
                    .get(&name)
                    .cloned()
                    .unwrap_or_else(|| name.empty_value());
                (name, value)
            })
            .collect();
        SyncSnapshot {
            collections,
            timestamp: now_millis(),
        }
    }

    /// Replace a whole collection with a local edit.
    pub fn set_local(&self, name: CollectionName, value: Value) -> SyncResult<()> {
        validate_collection(name, &value)?;
        self.assign(name, value, ChangeOrigin::Local)
    }

    /// Insert or replace one record (matched by `id`) in a list collection.
    pub fn upsert_record(&self, name: CollectionName, record: Value) -> SyncResult<()> {
        let id = record_id(&record)
            .cloned()
            .ok_or_else(|| SyncError::InvalidOperation(format!("{} record has no id", name)))?;

        let mut records = self.records(name)?;
        match records.iter_mut().find(|r| record_id(r) == Some(&id)) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        self.set_local(name, Value::Array(records))
    }

    /// Remove the record with `id` from a list collection.
    ///
    /// Returns `false` if no such record existed.
    pub fn remove_record(&self, name: CollectionName, id: &Value) -> SyncResult<bool> {
        let mut records = self.records(name)?;
        let before = records.len();
        records.retain(|r| record_id(r) != Some(id));
        if records.len() == before {
            return Ok(false);
        }
        self.set_local(name, Value::Array(records))?;
        Ok(true)
    }

    /// Assign a value produced by the merge policy.
    pub(crate) fn apply_remote(&self, name: CollectionName, value: Value) -> SyncResult<()> {
        self.assign(name, value, ChangeOrigin::Remote)
    }

    fn records(&self, name: CollectionName) -> SyncResult<Vec<Value>> {
        match self.get(name) {
            Value::Array(records) => Ok(records),
            _ => Err(SyncError::InvalidOperation(format!(
                "{} is not a record collection",
                name
            ))),
        }
    }

    fn assign(&self, name: CollectionName, value: Value, origin: ChangeOrigin) -> SyncResult<()> {
        if let Some(storage) = &self.storage {
            storage.save_collection(name, &value)?;
        }
        self.values.write().insert(name, value);
        debug!(collection = %name, ?origin, "Collection assigned");
        let _ = self.change_tx.send(StoreChange {
            collection: name,
            origin,
        });
        Ok(())
    }
}

impl Default for CollectionStore {
    fn default() -> Self {
        Self::new()
    }
}
