use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use super::sink::{DeliverySink, SinkLifecycle};
use crate::event::ChangeEvent;
use crate::{Error, Result};

type CallbackFn = dyn Fn(ChangeEvent) -> BoxFuture<'static, Result<()>> + Send + Sync;

/// A user-supplied async event handler.
#[derive(Clone)]
pub struct EventCallback(Arc<CallbackFn>);

impl EventCallback {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(ChangeEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        EventCallback(Arc::new(
            move |event| -> BoxFuture<'static, Result<()>> { Box::pin(handler(event)) },
        ))
    }

    pub async fn call(&self, event: ChangeEvent) -> Result<()> {
        (self.0)(event).await
    }
}

impl fmt::Debug for EventCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventCallback")
    }
}

/// Hands every event to a single handler, one at a time, in order. The
/// first failure aborts the rest of the batch.
pub struct CallbackSink {
    handler: EventCallback,
    lifecycle: SinkLifecycle,
}

impl CallbackSink {
    pub fn new(handler: EventCallback) -> Self {
        Self {
            handler,
            lifecycle: SinkLifecycle::new(),
        }
    }
}

#[async_trait]
impl DeliverySink for CallbackSink {
    fn kind(&self) -> &'static str {
        "callback"
    }

    fn lifecycle(&self) -> &SinkLifecycle {
        &self.lifecycle
    }

    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn send(&self, events: &[ChangeEvent]) -> Result<()> {
        for event in events {
            let id = event.id.clone();
            self.handler.call(event.clone()).await.map_err(|e| {
                Error::delivery(
                    self.kind(),
                    format!("Handler failed for event {}: {}", id, e),
                )
            })?;
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
