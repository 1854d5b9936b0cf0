//! Per-collection merge policy
//!
//! Decides how an incoming collection value is applied over the local one.
//! One table maps every collection to a strategy so the exception for the
//! protected administrative identity is visible in one place.
//!
//! | strategy | empty incoming | non-empty incoming |
//! |---|---|---|
//! | `ReplaceIfNonEmpty` | keep local | adopt incoming |
//! | `ProtectIdentity` | keep local | adopt incoming, re-insert the sentinel record |
//! | `AdditiveMerge` | keep local | union by `id`, local wins |

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::config::ProtectedIdentity;
use crate::error::{SyncError, SyncResult};
use crate::types::{CollectionName, CollectionShape};

/// How an incoming collection is applied over local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    ReplaceIfNonEmpty,
    ProtectIdentity,
    AdditiveMerge,
}

/// Result of merging one collection.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// The collection should be assigned this value
    Applied(Value),
    /// The incoming value was empty and local state is kept
    Ignored,
}

/// Strategy table plus the sentinel matcher used by `ProtectIdentity`.
#[derive(Debug, Clone)]
pub struct MergePolicy {
    strategies: HashMap<CollectionName, MergeStrategy>,
    protected: ProtectedIdentity,
}

impl MergePolicy {
    /// The default table: staff is identity-protected, partners may be
    /// created offline and merge additively, everything else is replaced.
    pub fn new(protected: ProtectedIdentity) -> Self {
        let strategies = CollectionName::ALL
            .into_iter()
            .map(|name| {
                let strategy = match name {
                    CollectionName::Staff => MergeStrategy::ProtectIdentity,
                    CollectionName::Partners => MergeStrategy::AdditiveMerge,
                    _ => MergeStrategy::ReplaceIfNonEmpty,
                };
                (name, strategy)
            })
            .collect();

        Self {
            strategies,
            protected,
        }
    }

    /// Override the strategy for one collection.
    pub fn with_strategy(mut self, name: CollectionName, strategy: MergeStrategy) -> Self {
        self.strategies.insert(name, strategy);
        self
    }

    pub fn strategy(&self, name: CollectionName) -> MergeStrategy {
        self.strategies
            .get(&name)
            .copied()
            .unwrap_or(MergeStrategy::ReplaceIfNonEmpty)
    }

    /// Merge `incoming` over `local` for one collection.
    ///
    /// An incoming value that fails shape validation is rejected as a whole.
    pub fn merge(
        &self,
        name: CollectionName,
        local: &Value,
        incoming: &Value,
    ) -> SyncResult<MergeOutcome> {
        validate_collection(name, incoming)?;

        if is_empty_collection(incoming) {
            return Ok(MergeOutcome::Ignored);
        }

        let merged = match self.strategy(name) {
            MergeStrategy::ReplaceIfNonEmpty => incoming.clone(),
            MergeStrategy::ProtectIdentity => self.protect(local, incoming),
            MergeStrategy::AdditiveMerge => additive(local, incoming),
        };
        Ok(MergeOutcome::Applied(merged))
    }

    fn protect(&self, local: &Value, incoming: &Value) -> Value {
        let mut records = as_records(incoming).to_vec();

        let mut seen = false;
        records.retain(|record| {
            if !self.protected.matches(record) {
                return true;
            }
            let keep = !seen;
            seen = true;
            keep
        });

        if !seen {
            let sentinel = as_records(local)
                .iter()
                .find(|record| self.protected.matches(record))
                .or(self.protected.fallback.as_ref());
            if let Some(sentinel) = sentinel {
                records.insert(0, sentinel.clone());
            }
        }

        Value::Array(records)
    }
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self::new(ProtectedIdentity::default())
    }
}

fn additive(local: &Value, incoming: &Value) -> Value {
    let mut records = as_records(local).to_vec();
    let mut known: HashSet<String> = records.iter().filter_map(id_key).collect();

    for record in as_records(incoming) {
        if let Some(key) = id_key(record) {
            if known.insert(key) {
                records.push(record.clone());
            }
        }
    }
    Value::Array(records)
}

fn as_records(value: &Value) -> &[Value] {
    value.as_array().map(Vec::as_slice).unwrap_or(&[])
}

fn id_key(record: &Value) -> Option<String> {
    record_id(record).map(Value::to_string)
}

/// The `id` of a record, if it is a string or a number.
pub fn record_id(record: &Value) -> Option<&Value> {
    record
        .get("id")
        .filter(|id| id.is_string() || id.is_number())
}

/// Whether a collection value holds no records (or no keys).
pub fn is_empty_collection(value: &Value) -> bool {
    match value {
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Null => true,
        _ => false,
    }
}

/// Whether `remote` already holds every record of `merged`, in any order.
///
/// A merge that kept records the remote lacks leaves them to be pushed.
pub fn is_covered_by(merged: &Value, remote: &Value) -> bool {
    match (merged, remote) {
        (Value::Array(merged), Value::Array(remote)) => {
            merged.iter().all(|record| remote.contains(record))
        }
        _ => merged == remote,
    }
}

/// Basic shape validation for a collection value.
pub fn validate_collection(name: CollectionName, value: &Value) -> SyncResult<()> {
    let invalid = |reason: String| SyncError::Validation {
        collection: name,
        reason,
    };

    match name.shape() {
        CollectionShape::List => {
            let records = value
                .as_array()
                .ok_or_else(|| invalid("expected an array of records".to_string()))?;
            for (index, record) in records.iter().enumerate() {
                if !record.is_object() {
                    return Err(invalid(format!("record {} is not an object", index)));
                }
                if record_id(record).is_none() {
                    return Err(invalid(format!("record {} has no id", index)));
                }
            }
            Ok(())
        }
        CollectionShape::Object => {
            if value.is_object() {
                Ok(())
            } else {
                Err(invalid("expected an object".to_string()))
            }
        }
    }
}
