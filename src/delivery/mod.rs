pub mod callback;
pub mod sink;
pub mod sse;


use std::sync::Arc;

pub use callback::{CallbackSink, EventCallback};
pub use sink::{DeliverySink, SinkLifecycle};
pub use sse::{ChannelStream, SseSink, StreamClient, StreamFrame, SSE_HEADERS};

use crate::config::DeliveryConfig;
use crate::{Error, Result};

/// A constructed sink, keeping the concrete type available for
/// variant-specific operations such as SSE client registration.
#[derive(Clone)]
pub enum SinkHandle {
    Sse(Arc<SseSink>),
    Callback(Arc<CallbackSink>),
}

impl SinkHandle {
    pub fn as_sink(&self) -> Arc<dyn DeliverySink> {
        match self {
            SinkHandle::Sse(sink) => sink.clone(),
            SinkHandle::Callback(sink) => sink.clone(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SinkHandle::Sse(_) => "sse",
            SinkHandle::Callback(_) => "callback",
        }
    }
}

/// Builds the sink for one delivery method. Declared but unimplemented
/// methods fail with [`Error::Unsupported`].
pub fn create_sink(config: &DeliveryConfig) -> Result<SinkHandle> {
    match config {
        DeliveryConfig::Sse(options) => Ok(SinkHandle::Sse(Arc::new(SseSink::new(options)))),
        DeliveryConfig::Callback(options) => {
            let handler = options.handler.clone().ok_or_else(|| {
                Error::Config("Callback delivery requires a handler".to_string())
            })?;
            Ok(SinkHandle::Callback(Arc::new(CallbackSink::new(handler))))
        }
        DeliveryConfig::WebSocket(_) => Err(Error::Unsupported(
            "websocket delivery is not implemented".to_string(),
        )),
        DeliveryConfig::Webhook(_) => Err(Error::Unsupported(
            "webhook delivery is not implemented".to_string(),
        )),
    }
}
