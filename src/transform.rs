//! Per-table event transformations.
//!
//! A [`TransformPipeline`] is an ordered list of `(table pattern, transform)`
//! entries. Every entry whose pattern matches the event's table runs in
//! declaration order, each one receiving the previous output. Returning
//! `None` drops the event.

use crate::event::ChangeEvent;
use crate::{Error, Result};
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// A transform function. `None` drops the event.
pub type TransformFn = Arc<dyn Fn(ChangeEvent) -> Option<ChangeEvent> + Send + Sync>;

/// Replacement value written by [`Transformation::redact`].
pub const REDACTED: &str = "[REDACTED]";

/// Table-name matcher. Plain strings are compiled as regular expressions,
/// so `"users"` also matches `"users_archive"`; anchor with `^users$` for an
/// exact match.
#[derive(Clone)]
pub struct TablePattern(Regex);

impl TablePattern {
    pub fn new(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(Error::Config(
                "Transformation table pattern must not be empty".to_string(),
            ));
        }
        Regex::new(pattern)
            .map(TablePattern)
            .map_err(|e| Error::Config(format!("Invalid table pattern '{}': {}", pattern, e)))
    }

    pub fn is_match(&self, table: &str) -> bool {
        self.0.is_match(table)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<Regex> for TablePattern {
    fn from(regex: Regex) -> Self {
        TablePattern(regex)
    }
}

impl fmt::Debug for TablePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TablePattern").field(&self.0.as_str()).finish()
    }
}

#[derive(Clone)]
pub struct Transformation {
    pub pattern: TablePattern,
    transform: TransformFn,
}

impl Transformation {
    pub fn new<F>(pattern: impl Into<TablePattern>, transform: F) -> Self
    where
        F: Fn(ChangeEvent) -> Option<ChangeEvent> + Send + Sync + 'static,
    {
        Self {
            pattern: pattern.into(),
            transform: Arc::new(transform),
        }
    }

    /// Like [`Transformation::new`] but compiles `pattern` first.
    pub fn for_tables<F>(pattern: &str, transform: F) -> Result<Self>
    where
        F: Fn(ChangeEvent) -> Option<ChangeEvent> + Send + Sync + 'static,
    {
        Ok(Self::new(TablePattern::new(pattern)?, transform))
    }

    /// Replaces the named top-level fields of both row images with
    /// [`REDACTED`].
    pub fn redact(pattern: &str, fields: &[&str]) -> Result<Self> {
        let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
        Self::for_tables(pattern, move |mut event| {
            for image in [event.data.new.as_mut(), event.data.old.as_mut()]
                .into_iter()
                .flatten()
            {
                if let Value::Object(map) = image {
                    for field in &fields {
                        if let Some(value) = map.get_mut(field) {
                            *value = Value::String(REDACTED.to_string());
                        }
                    }
                }
            }
            Some(event)
        })
    }

    /// Drops every event for matching tables.
    pub fn drop_all(pattern: &str) -> Result<Self> {
        Self::for_tables(pattern, |_| None)
    }

    pub fn matches(&self, table: &str) -> bool {
        self.pattern.is_match(table)
    }

    pub fn apply(&self, event: ChangeEvent) -> Option<ChangeEvent> {
        (self.transform)(event)
    }
}

impl fmt::Debug for Transformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transformation")
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransformPipeline {
    entries: Vec<Transformation>,
}

impl TransformPipeline {
    pub fn new(entries: Vec<Transformation>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs the event through every matching entry. The table used for
    /// matching is re-read after each step, so a transform that renames the
    /// table changes which later entries apply.
    pub fn apply(&self, event: ChangeEvent) -> Option<ChangeEvent> {
        let mut current = event;
        for (index, entry) in self.entries.iter().enumerate() {
            if !entry.matches(current.table()) {
                continue;
            }
            trace!(
                table = %current.table(),
                pattern = %entry.pattern.as_str(),
                index,
                "Applying transformation"
            );
            match entry.apply(current) {
                Some(next) => current = next,
                None => {
                    debug!(pattern = %entry.pattern.as_str(), "Event dropped by transformation");
                    return None;
                }
            }
        }
        Some(current)
    }
}
