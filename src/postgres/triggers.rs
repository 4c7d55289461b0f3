//! SQL generation for change-capture triggers.
//!
//! Nothing here touches the database; every function returns SQL text.
//! Identifiers are quoted with [`escape_identifier`], so names are used
//! verbatim (case-sensitive) by the generated statements.

use postgres_protocol::escape::{escape_identifier, escape_literal};
use std::fmt;

use crate::{Error, Result};

/// Channel the notification function publishes on.
pub const NOTIFICATION_CHANNEL: &str = "pg_change_notifier";

/// Name of the shared notification function.
pub const NOTIFY_FUNCTION: &str = "pg_change_notifier_notify";

/// Prefix for the per-table trigger names this crate creates.
pub const TRIGGER_PREFIX: &str = "pg_change_notifier";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOperation {
    Insert,
    Update,
    Delete,
    Truncate,
}

impl fmt::Display for TriggerOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TriggerOperation::Insert => "INSERT",
            TriggerOperation::Update => "UPDATE",
            TriggerOperation::Delete => "DELETE",
            TriggerOperation::Truncate => "TRUNCATE",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerTiming {
    Before,
    #[default]
    After,
    InsteadOf,
}

impl fmt::Display for TriggerTiming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TriggerTiming::Before => "BEFORE",
            TriggerTiming::After => "AFTER",
            TriggerTiming::InsteadOf => "INSTEAD OF",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerDefinition {
    pub trigger_name: String,
    pub schema_name: String,
    pub table_name: String,
    pub function_name: String,
    pub operations: Vec<TriggerOperation>,
    /// Optional `WHEN` guard, without the surrounding parentheses.
    pub condition: Option<String>,
    pub timing: TriggerTiming,
    pub for_each_row: bool,
}

impl TriggerDefinition {
    /// An `AFTER ... FOR EACH ROW` trigger on INSERT, UPDATE and DELETE
    /// calling the shared notification function.
    pub fn change_capture(schema: &str, table: &str) -> Self {
        Self {
            trigger_name: trigger_name_for(schema, table),
            schema_name: schema.to_string(),
            table_name: table.to_string(),
            function_name: NOTIFY_FUNCTION.to_string(),
            operations: vec![
                TriggerOperation::Insert,
                TriggerOperation::Update,
                TriggerOperation::Delete,
            ],
            condition: None,
            timing: TriggerTiming::After,
            for_each_row: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("trigger name", &self.trigger_name),
            ("schema name", &self.schema_name),
            ("table name", &self.table_name),
            ("function name", &self.function_name),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("Trigger {} is required", field)));
            }
        }
        if self.operations.is_empty() {
            return Err(Error::Config(format!(
                "Trigger '{}' must fire on at least one operation",
                self.trigger_name
            )));
        }
        if self.for_each_row && self.operations.contains(&TriggerOperation::Truncate) {
            return Err(Error::Config(format!(
                "Trigger '{}': TRUNCATE triggers must be FOR EACH STATEMENT",
                self.trigger_name
            )));
        }
        if matches!(&self.condition, Some(c) if c.trim().is_empty()) {
            return Err(Error::Config(format!(
                "Trigger '{}' has an empty WHEN condition",
                self.trigger_name
            )));
        }
        Ok(())
    }
}

/// Deterministic trigger name for a table, unique per schema.
pub fn trigger_name_for(schema: &str, table: &str) -> String {
    format!("{}_{}_{}", TRIGGER_PREFIX, schema, table)
}

fn qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", escape_identifier(schema), escape_identifier(name))
}

/// Drops any trigger of the same name, then creates it.
pub fn create_trigger_sql(def: &TriggerDefinition) -> Result<String> {
    def.validate()?;

    let events = def
        .operations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" OR ");
    let granularity = if def.for_each_row { "ROW" } else { "STATEMENT" };
    let when = def
        .condition
        .as_ref()
        .map(|c| format!("\n    WHEN ({})", c.trim()))
        .unwrap_or_default();

    Ok(format!(
        "{drop}\nCREATE TRIGGER {trigger}\n    {timing} {events} ON {table}\n    FOR EACH {granularity}{when}\n    EXECUTE FUNCTION {function}();",
        drop = drop_trigger_sql(&def.trigger_name, &def.schema_name, &def.table_name),
        trigger = escape_identifier(&def.trigger_name),
        timing = def.timing,
        events = events,
        table = qualified(&def.schema_name, &def.table_name),
        granularity = granularity,
        when = when,
        function = escape_identifier(&def.function_name),
    ))
}

/// Idempotently drops one trigger.
pub fn drop_trigger_sql(trigger_name: &str, schema: &str, table: &str) -> String {
    format!(
        "DROP TRIGGER IF EXISTS {} ON {};",
        escape_identifier(trigger_name),
        qualified(schema, table)
    )
}

/// (Re)creates the row-change notification function.
///
/// The payload carries `operation`, `schema`, `table`, a generated `id`, an
/// epoch-seconds `timestamp` from `clock_timestamp()`, and `data.new` /
/// `data.old` depending on the operation.
pub fn notify_function_sql(function_name: &str, channel: &str) -> String {
    format!(
        r#"CREATE OR REPLACE FUNCTION {function}() RETURNS trigger AS $$
DECLARE
    payload jsonb;
BEGIN
    payload := jsonb_build_object(
        'id', md5(random()::text || clock_timestamp()::text),
        'operation', TG_OP,
        'schema', TG_TABLE_SCHEMA,
        'table', TG_TABLE_NAME,
        'timestamp', extract(epoch from clock_timestamp())
    );

    IF TG_OP = 'INSERT' THEN
        payload := payload || jsonb_build_object('data', jsonb_build_object('new', to_jsonb(NEW)));
    ELSIF TG_OP = 'UPDATE' THEN
        payload := payload || jsonb_build_object('data', jsonb_build_object('new', to_jsonb(NEW), 'old', to_jsonb(OLD)));
    ELSIF TG_OP = 'DELETE' THEN
        payload := payload || jsonb_build_object('data', jsonb_build_object('old', to_jsonb(OLD)));
    END IF;

    PERFORM pg_notify({channel}, payload::text);
    RETURN NULL;
END;
$$ LANGUAGE plpgsql;"#,
        function = escape_identifier(function_name),
        channel = escape_literal(channel),
    )
}
