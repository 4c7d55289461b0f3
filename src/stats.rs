use crate::event::{ChangeEvent, Operation};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Upper bound on distinct error messages kept in [`NotifierStats::errors`].
pub const MAX_ERROR_RECORDS: usize = 100;

/// A distinct error message and how often it was seen.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Accumulated notifier counters. Callers only ever see clones.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NotifierStats {
    pub events_processed: u64,
    pub events_by_operation: BTreeMap<Operation, u64>,
    pub events_by_table: BTreeMap<String, u64>,
    pub delivery_attempts: u64,
    pub delivery_successes: u64,
    pub delivery_failures: u64,
    pub errors: Vec<ErrorRecord>,
    pub started_at: Option<DateTime<Utc>>,
}

impl NotifierStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&mut self, event: &ChangeEvent) {
        self.events_processed += 1;
        *self.events_by_operation.entry(event.operation).or_insert(0) += 1;
        *self
            .events_by_table
            .entry(event.source.table.clone())
            .or_insert(0) += 1;
    }

    /// Counts one fan-out delivery call, however many sinks it targeted.
    pub fn record_delivery(&mut self, success: bool) {
        self.delivery_attempts += 1;
        if success {
            self.delivery_successes += 1;
        } else {
            self.delivery_failures += 1;
        }
    }

    /// Records an error message, deduplicating by exact text.
    pub fn record_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        let now = Utc::now();

        if let Some(existing) = self.errors.iter_mut().find(|r| r.message == message) {
            existing.count += 1;
            existing.last_seen = now;
            return;
        }

        self.errors.push(ErrorRecord {
            message,
            count: 1,
            first_seen: now,
            last_seen: now,
        });

        while self.errors.len() > MAX_ERROR_RECORDS {
            // ties go to the earliest inserted
            let oldest = self
                .errors
                .iter()
                .enumerate()
                .min_by_key(|(_, r)| r.last_seen)
                .map(|(i, _)| i)
                .unwrap_or(0);
            self.errors.remove(oldest);
        }
    }

    pub fn mark_started(&mut self) {
        self.started_at = Some(Utc::now());
    }

    pub fn uptime(&self) -> Option<chrono::Duration> {
        self.started_at.map(|started| Utc::now() - started)
    }
}
