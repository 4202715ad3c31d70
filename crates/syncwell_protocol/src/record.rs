//! Entity snapshots exchanged with the local store and the remote backend.

use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// A versioned snapshot of one entity.
///
/// The same shape is used for rows in the local store and for records
/// returned by the remote backend. `data` is opaque to the sync engine
/// except for its top-level field names, which conflict classification
/// compares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Entity identifier within its type.
    pub id: String,
    /// Entity payload.
    pub data: Value,
    /// Last modification time.
    pub updated_at: Timestamp,
    /// Soft-delete marker.
    #[serde(default)]
    pub deleted: bool,
}

impl EntityRecord {
    /// Creates a live record.
    pub fn new(id: impl Into<String>, data: Value, updated_at: Timestamp) -> Self {
        Self {
            id: id.into(),
            data,
            updated_at,
            deleted: false,
        }
    }

    /// Returns a soft-deleted copy of this record.
    #[must_use]
    pub fn tombstone(mut self, at: Timestamp) -> Self {
        self.deleted = true;
        self.updated_at = at;
        self
    }

    /// Returns the top-level field names of the payload.
    ///
    /// Non-object payloads have no fields.
    pub fn field_names(&self) -> BTreeSet<&str> {
        field_names(&self.data)
    }
}

/// Returns the top-level field names of a JSON value.
pub(crate) fn field_names(value: &Value) -> BTreeSet<&str> {
    value
        .as_object()
        .map(|map| map.keys().map(String::as_str).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_names_of_object() {
        let record = EntityRecord::new(
            "c1",
            json!({"front": "hola", "back": "hello"}),
            Timestamp::from_millis(5),
        );
        let names: Vec<_> = record.field_names().into_iter().collect();
        assert_eq!(names, vec!["back", "front"]);
    }

    #[test]
    fn field_names_of_scalar_is_empty() {
        let record = EntityRecord::new("c1", json!(42), Timestamp::from_millis(5));
        assert!(record.field_names().is_empty());
    }

    #[test]
    fn tombstone_marks_deleted() {
        let record = EntityRecord::new("c1", json!({}), Timestamp::from_millis(5))
            .tombstone(Timestamp::from_millis(9));
        assert!(record.deleted);
        assert_eq!(record.updated_at, Timestamp::from_millis(9));
    }
}
