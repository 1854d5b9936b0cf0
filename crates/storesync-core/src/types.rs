//! Core types for Storesync

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::error::SyncError;

/// A named, independently synchronized collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionName {
    Staff,
    Partners,
    Distributors,
    Products,
    Feedback,
    Settings,
    Content,
}

/// JSON shape a collection must have to be accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionShape {
    /// An array of records, each an object carrying an `id`
    List,
    /// A single JSON object
    Object,
}

impl CollectionName {
    /// Every collection, in wire order.
    pub const ALL: [CollectionName; 7] = [
        CollectionName::Staff,
        CollectionName::Partners,
        CollectionName::Distributors,
        CollectionName::Products,
        CollectionName::Feedback,
        CollectionName::Settings,
        CollectionName::Content,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionName::Staff => "staff",
            CollectionName::Partners => "partners",
            CollectionName::Distributors => "distributors",
            CollectionName::Products => "products",
            CollectionName::Feedback => "feedback",
            CollectionName::Settings => "settings",
            CollectionName::Content => "content",
        }
    }

    pub fn shape(&self) -> CollectionShape {
        match self {
            CollectionName::Settings | CollectionName::Content => CollectionShape::Object,
            _ => CollectionShape::List,
        }
    }

    /// The value a collection holds before anything was written to it.
    pub fn empty_value(&self) -> Value {
        match self.shape() {
            CollectionShape::List => Value::Array(Vec::new()),
            CollectionShape::Object => Value::Object(serde_json::Map::new()),
        }
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollectionName {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CollectionName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| SyncError::InvalidOperation(format!("Unknown collection: {}", s)))
    }
}

/// Stable identifier of one installed client instance.
///
/// Used only for message provenance (tagging and self-filtering), never
/// for authorization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Generate a fresh, globally unique identifier
    pub fn generate() -> Self {
        Self(format!("device_{}", Ulid::new()))
    }

    /// Wrap an identifier received from storage or the wire
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
