//! Canonical change events.
//!
//! Every adapter converts its database-native notification into a
//! [`ChangeEvent`]. Events are plain values: transformations consume one
//! event and produce another, they never mutate a shared instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The kind of row mutation an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Replace,
    Drop,
    Truncate,
    Unknown,
}

impl Operation {
    /// Maps a database-native operation keyword (`TG_OP` for PostgreSQL)
    /// onto the canonical enum. Unrecognized keywords become
    /// [`Operation::Unknown`].
    pub fn from_native(keyword: &str) -> Self {
        match keyword.to_ascii_uppercase().as_str() {
            "INSERT" => Operation::Insert,
            "UPDATE" => Operation::Update,
            "DELETE" => Operation::Delete,
            "REPLACE" => Operation::Replace,
            "DROP" => Operation::Drop,
            "TRUNCATE" => Operation::Truncate,
            _ => Operation::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Replace => "replace",
            Operation::Drop => "drop",
            Operation::Truncate => "truncate",
            Operation::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which database produced the event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
}

/// The table the mutation happened on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSource {
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
}

/// Row images. Inserts carry only `new`, deletes only `old`, updates both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub operation: Operation,
    pub database: DatabaseInfo,
    pub source: EventSource,
    pub data: EventData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ChangeEvent {
    /// Creates an event with a fresh id and the current time.
    pub fn new(
        operation: Operation,
        database: DatabaseInfo,
        source: EventSource,
        data: EventData,
    ) -> Self {
        Self {
            id: generate_event_id(),
            timestamp: Utc::now(),
            operation,
            database,
            source,
            data,
            metadata: None,
        }
    }

    pub fn table(&self) -> &str {
        &self.source.table
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_data(mut self, data: EventData) -> Self {
        self.data = data;
        self
    }

    /// Returns the row image that identifies the affected row: the old image
    /// for deletes, otherwise the new one.
    pub fn row(&self) -> Option<&Value> {
        match self.operation {
            Operation::Delete => self.data.old.as_ref(),
            _ => self.data.new.as_ref().or(self.data.old.as_ref()),
        }
    }
}

pub(crate) fn generate_event_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> ChangeEvent {
        ChangeEvent::new(
            Operation::Update,
            DatabaseInfo {
                kind: "postgres".to_string(),
                name: "app".to_string(),
            },
            EventSource {
                table: "users".to_string(),
                schema: Some("public".to_string()),
            },
            EventData {
                new: Some(json!({"id": 1, "name": "New"})),
                old: Some(json!({"id": 1, "name": "Old"})),
            },
        )
    }

    #[test]
    fn test_operation_from_native() {
        assert_eq!(Operation::from_native("INSERT"), Operation::Insert);
        assert_eq!(Operation::from_native("update"), Operation::Update);
        assert_eq!(Operation::from_native("DELETE"), Operation::Delete);
        assert_eq!(Operation::from_native("TRUNCATE"), Operation::Truncate);
        assert_eq!(Operation::from_native("MERGE"), Operation::Unknown);
        assert_eq!(Operation::from_native(""), Operation::Unknown);
    }

    #[test]
    fn test_event_json_shape() {
        let event = sample().with_id("evt-1");
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["id"], "evt-1");
        assert_eq!(json["operation"], "update");
        assert_eq!(json["database"]["type"], "postgres");
        assert_eq!(json["source"]["table"], "users");
        assert_eq!(json["source"]["schema"], "public");
        assert_eq!(json["data"]["old"]["name"], "Old");
        assert!(json["timestamp"].as_str().unwrap().contains('T'));
        assert!(json.get("metadata").is_none());
    }

    #[test]
    fn test_builders_return_new_values() {
        let original = sample();
        let changed = original.clone().with_data(EventData::default());

        assert!(original.data.new.is_some());
        assert!(changed.data.new.is_none());
        assert_eq!(original.id, changed.id);
    }

    #[test]
    fn test_row_prefers_old_for_delete() {
        let mut event = sample();
        event.operation = Operation::Delete;
        assert_eq!(event.row().unwrap()["name"], "Old");

        event.operation = Operation::Insert;
        assert_eq!(event.row().unwrap()["name"], "New");
    }
}
