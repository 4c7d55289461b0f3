use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use crate::event::ChangeEvent;
use crate::{Error, Result};

/// Initialization flag shared by every sink implementation.
#[derive(Debug, Default)]
pub struct SinkLifecycle {
    initialized: AtomicBool,
}

impl SinkLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn set(&self, value: bool) -> bool {
        self.initialized.swap(value, Ordering::AcqRel)
    }
}

/// A destination for change events.
///
/// Implementors provide [`open`](Self::open), [`send`](Self::send) and
/// [`shutdown`](Self::shutdown); callers use the provided
/// [`initialize`](Self::initialize), [`deliver`](Self::deliver) and
/// [`close`](Self::close), which enforce the lifecycle and report every
/// failure as [`Error::Delivery`].
#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// Delivery method name used in logs and errors.
    fn kind(&self) -> &'static str;

    fn lifecycle(&self) -> &SinkLifecycle;

    /// Transport-specific setup.
    async fn open(&self) -> Result<()>;

    /// Transport-specific send. Events arrive in buffering order.
    async fn send(&self, events: &[ChangeEvent]) -> Result<()>;

    /// Transport-specific teardown.
    async fn shutdown(&self) -> Result<()>;

    fn is_initialized(&self) -> bool {
        self.lifecycle().is_initialized()
    }

    async fn initialize(&self) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        self.open()
            .await
            .map_err(|e| as_delivery_error(self.kind(), "initialize", e))?;
        self.lifecycle().set(true);
        debug!(sink = self.kind(), "Delivery sink initialized");
        Ok(())
    }

    async fn deliver(&self, events: &[ChangeEvent]) -> Result<()> {
        if !self.is_initialized() {
            return Err(Error::delivery(self.kind(), "Sink is not initialized"));
        }
        if events.is_empty() {
            return Ok(());
        }
        self.send(events)
            .await
            .map_err(|e| as_delivery_error(self.kind(), "deliver", e))
    }

    async fn deliver_one(&self, event: &ChangeEvent) -> Result<()> {
        self.deliver(std::slice::from_ref(event)).await
    }

    async fn close(&self) -> Result<()> {
        if !self.lifecycle().set(false) {
            return Ok(());
        }
        self.shutdown()
            .await
            .map_err(|e| as_delivery_error(self.kind(), "close", e))?;
        debug!(sink = self.kind(), "Delivery sink closed");
        Ok(())
    }
}

fn as_delivery_error(kind: &str, action: &str, err: Error) -> Error {
    match err {
        err @ Error::Delivery { .. } => err,
        other => Error::delivery(kind, format!("Failed to {}: {}", action, other)),
    }
}
