//! Change detection against the last synced baseline.
//!
//! The baseline of a collection is the value most recently pushed or applied
//! from a remote snapshot. Applying a remote snapshot rebases the baseline
//! *before* the store is reassigned, so the watch cycle that follows sees no
//! difference and never schedules an echo push.

use std::collections::HashMap;

use serde_json::Value;

use crate::types::CollectionName;

/// Deep-equality comparison of a collection against its previous value.
pub fn diff(previous: Option<&Value>, current: &Value) -> bool {
    previous != Some(current)
}

/// Per-collection baseline of the last synced value.
#[derive(Debug, Default)]
pub struct ChangeWatcher {
    baseline: HashMap<CollectionName, Value>,
}

impl ChangeWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `current` differs from the baseline of `name`.
    pub fn is_changed(&self, name: CollectionName, current: &Value) -> bool {
        let previous = self.baseline.get(&name);
        match previous {
            // A collection never synced counts as changed only once it holds data.
            None => !crate::sync::merge::is_empty_collection(current),
            Some(_) => diff(previous, current),
        }
    }

    /// Record `value` as the last synced value of `name`.
    pub fn rebase(&mut self, name: CollectionName, value: Value) {
        self.baseline.insert(name, value);
    }
}
