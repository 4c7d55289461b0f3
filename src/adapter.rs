//! The seam between the notifier and a database.
//!
//! An adapter emits canonical [`ChangeEvent`]s to at most one registered
//! consumer and errors to any number of consumers.

use async_trait::async_trait;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tracing::{error, warn};

use crate::event::ChangeEvent;
use crate::filter::TableFilter;
use crate::postgres::types::TriggerRecord;
use crate::{Error, Result};

pub type ChangeEventHandler = Arc<dyn Fn(ChangeEvent) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

/// Trait for database change sources.
#[async_trait]
pub trait ChangeAdapter: Send + Sync {
    /// Short engine name, e.g. `"postgres"`.
    fn database_type(&self) -> &'static str;

    /// Round-trips a trivial query. Never fails; an unreachable database is
    /// reported as `false`.
    async fn test_connection(&self) -> bool;

    /// Installs change capture for the tables selected by `filter`.
    /// A second call without an intervening teardown does nothing.
    async fn setup_change_notifications(&mut self, filter: &TableFilter) -> Result<()>;

    /// Removes exactly what setup installed. No-op when not set up.
    async fn teardown_change_notifications(&mut self) -> Result<()>;

    /// Starts receiving notifications. Idempotent.
    async fn start(&mut self) -> Result<()>;

    /// Stops receiving notifications. Idempotent.
    async fn stop(&mut self) -> Result<()>;

    fn is_listening(&self) -> bool;

    /// Triggers installed by the last successful setup.
    fn triggers(&self) -> Vec<TriggerRecord>;

    /// Replaces the change-event consumer.
    fn on_change_event(&self, handler: ChangeEventHandler);

    /// Adds an error consumer.
    fn on_error(&self, handler: ErrorHandler);
}

#[derive(Default)]
struct HandlerSet {
    change: Option<ChangeEventHandler>,
    errors: Vec<ErrorHandler>,
}

/// Callback registry shared between an adapter and its background tasks.
#[derive(Clone, Default)]
pub struct AdapterHandlers {
    inner: Arc<RwLock<HandlerSet>>,
}

impl AdapterHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_change_handler(&self, handler: ChangeEventHandler) {
        let mut set = self.inner.write().unwrap_or_else(|p| p.into_inner());
        set.change = Some(handler);
    }

    pub fn add_error_handler(&self, handler: ErrorHandler) {
        let mut set = self.inner.write().unwrap_or_else(|p| p.into_inner());
        set.errors.push(handler);
    }

    pub fn has_change_handler(&self) -> bool {
        let set = self.inner.read().unwrap_or_else(|p| p.into_inner());
        set.change.is_some()
    }

    /// Hands the event to the registered consumer. Without one the event is
    /// dropped and `false` is returned.
    pub fn emit_change(&self, event: ChangeEvent) -> bool {
        let handler = {
            let set = self.inner.read().unwrap_or_else(|p| p.into_inner());
            set.change.clone()
        };
        match handler {
            Some(handler) => {
                handler(event);
                true
            }
            None => {
                warn!(
                    event_id = %event.id,
                    table = %event.source.table,
                    "No change event handler registered, dropping event"
                );
                false
            }
        }
    }

    /// Calls every error consumer. A panicking consumer is logged and the
    /// rest still run.
    pub fn emit_error(&self, err: &Error) {
        let handlers = {
            let set = self.inner.read().unwrap_or_else(|p| p.into_inner());
            set.errors.clone()
        };
        for (index, handler) in handlers.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| handler(err))).is_err() {
                error!(handler = index, "Error handler panicked");
            }
        }
    }
}
