use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::{
    generate_event_id, ChangeEvent, DatabaseInfo, EventData, EventSource, Operation,
};

/// The JSON object published by the notification function on the channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub operation: String,
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub data: Option<PayloadData>,
    #[serde(default)]
    pub id: Option<String>,
    /// Epoch seconds with sub-second precision.
    #[serde(default)]
    pub timestamp: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PayloadData {
    #[serde(default)]
    pub new: Option<Value>,
    #[serde(default)]
    pub old: Option<Value>,
}

impl NotificationPayload {
    pub fn parse(raw: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Builds the canonical event for this payload.
    pub fn into_event(self, database_name: &str) -> ChangeEvent {
        let timestamp = self
            .timestamp
            .and_then(epoch_seconds_to_datetime)
            .unwrap_or_else(Utc::now);
        let data = self.data.unwrap_or_default();

        ChangeEvent {
            id: self.id.unwrap_or_else(generate_event_id),
            timestamp,
            operation: Operation::from_native(&self.operation),
            database: DatabaseInfo {
                kind: "postgres".to_string(),
                name: database_name.to_string(),
            },
            source: EventSource {
                table: self.table,
                schema: Some(self.schema),
            },
            data: EventData {
                new: data.new.filter(|v| !v.is_null()),
                old: data.old.filter(|v| !v.is_null()),
            },
            metadata: None,
        }
    }
}

fn epoch_seconds_to_datetime(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1_000_000_000.0).round() as u32;
    DateTime::from_timestamp(whole as i64, nanos.min(999_999_999))
}

/// A trigger this process installed and is responsible for dropping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRecord {
    pub name: String,
    pub table: String,
    pub schema: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_update_payload_round_trip() {
        let raw = json!({
            "operation": "UPDATE",
            "schema": "public",
            "table": "t",
            "data": {"old": {"a": 1}, "new": {"a": 2}},
            "id": "abc",
            "timestamp": 1_700_000_000.25
        })
        .to_string();

        let event = NotificationPayload::parse(&raw).unwrap().into_event("app");

        assert_eq!(event.id, "abc");
        assert_eq!(event.operation, Operation::Update);
        assert_eq!(event.source.table, "t");
        assert_eq!(event.source.schema.as_deref(), Some("public"));
        assert_eq!(event.data.old, Some(json!({"a": 1})));
        assert_eq!(event.data.new, Some(json!({"a": 2})));
        assert_eq!(event.database.name, "app");
        assert_eq!(event.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(event.timestamp.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn test_missing_id_and_timestamp_are_generated() {
        let raw = r#"{"operation":"INSERT","schema":"public","table":"t","data":{"new":{"a":1}}}"#;
        let first = NotificationPayload::parse(raw).unwrap().into_event("app");
        let second = NotificationPayload::parse(raw).unwrap().into_event("app");

        assert!(!first.id.is_empty());
        assert_ne!(first.id, second.id);
        assert!(first.data.old.is_none());
    }

    #[test]
    fn test_unknown_operation_is_not_an_error() {
        let raw = r#"{"operation":"MERGE","schema":"public","table":"t"}"#;
        let event = NotificationPayload::parse(raw).unwrap().into_event("app");
        assert_eq!(event.operation, Operation::Unknown);
        assert_eq!(event.data, EventData::default());
    }

    #[test]
    fn test_malformed_payload_fails_to_parse() {
        assert!(NotificationPayload::parse("not json").is_err());
        assert!(NotificationPayload::parse(r#"{"schema":"public"}"#).is_err());
    }
}
