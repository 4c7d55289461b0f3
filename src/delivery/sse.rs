//! Server-Sent Events delivery.
//!
//! The sink keeps a registry of streaming clients. Each delivered event is
//! written to every client as an SSE frame; a client whose write fails is
//! dropped from the registry without affecting the others. A periodic
//! comment frame keeps idle connections open.
//!
//! The HTTP layer is not part of this crate: anything implementing
//! [`StreamClient`] can be registered. [`ChannelStream`] is an in-process
//! client whose receiving half can be wrapped into a response body.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::future::join_all;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::sink::{DeliverySink, SinkLifecycle};
use crate::config::SseOptions;
use crate::event::ChangeEvent;
use crate::{Error, Result};

/// Response headers written to every client on registration.
pub const SSE_HEADERS: [(&str, &str); 4] = [
    ("Content-Type", "text/event-stream"),
    ("Cache-Control", "no-cache"),
    ("Connection", "keep-alive"),
    ("X-Accel-Buffering", "no"),
];

/// The writable half of one streaming response.
#[async_trait]
pub trait StreamClient: Send {
    async fn send_headers(&mut self, headers: &[(&'static str, &'static str)]) -> Result<()>;

    async fn write(&mut self, chunk: &str) -> Result<()>;

    async fn close(&mut self);
}

type ClientMap = HashMap<String, Box<dyn StreamClient>>;

pub struct SseSink {
    heartbeat_interval: Option<Duration>,
    clients: Arc<Mutex<ClientMap>>,
    heartbeat: StdMutex<Option<JoinHandle<()>>>,
    lifecycle: SinkLifecycle,
}

impl SseSink {
    pub fn new(options: &SseOptions) -> Self {
        Self {
            heartbeat_interval: options.heartbeat_interval(),
            clients: Arc::new(Mutex::new(HashMap::new())),
            heartbeat: StdMutex::new(None),
            lifecycle: SinkLifecycle::new(),
        }
    }

    /// Writes the stream headers and a `connected` frame, then starts
    /// delivering events to the client. Returns the generated client id.
    pub async fn register_client(&self, mut client: Box<dyn StreamClient>) -> Result<String> {
        let client_id = uuid::Uuid::new_v4().to_string();

        client
            .send_headers(&SSE_HEADERS)
            .await
            .map_err(|e| Error::delivery("sse", format!("Failed to open stream: {}", e)))?;
        client
            .write(&connected_frame(&client_id))
            .await
            .map_err(|e| Error::delivery("sse", format!("Failed to acknowledge client: {}", e)))?;

        let count = {
            let mut clients = self.clients.lock().await;
            clients.insert(client_id.clone(), client);
            clients.len()
        };
        info!(client_id = %client_id, clients = count, "SSE client connected");
        Ok(client_id)
    }

    /// Closes and forgets a client. Returns `false` if it was not registered.
    pub async fn remove_client(&self, client_id: &str) -> bool {
        let removed = self.clients.lock().await.remove(client_id);
        match removed {
            Some(mut client) => {
                client.close().await;
                info!(client_id = %client_id, "SSE client removed");
                true
            }
            None => false,
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    fn start_heartbeat(&self, every: Duration) {
        let mut slot = self.heartbeat.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_some() {
            return;
        }

        debug!(interval_ms = every.as_millis() as u64, "Starting SSE heartbeat");
        let clients = Arc::downgrade(&self.clients);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(clients) = clients.upgrade() else {
                    break;
                };
                let frame = heartbeat_frame();
                broadcast(&clients, std::slice::from_ref(&frame)).await;
            }
        }));
    }

    fn stop_heartbeat(&self) {
        let handle = self
            .heartbeat
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

#[async_trait]
impl DeliverySink for SseSink {
    fn kind(&self) -> &'static str {
        "sse"
    }

    fn lifecycle(&self) -> &SinkLifecycle {
        &self.lifecycle
    }

    async fn open(&self) -> Result<()> {
        if let Some(every) = self.heartbeat_interval {
            self.start_heartbeat(every);
        }
        Ok(())
    }

    async fn send(&self, events: &[ChangeEvent]) -> Result<()> {
        let frames = events
            .iter()
            .map(event_frame)
            .collect::<Result<Vec<_>>>()?;
        let delivered = broadcast(&self.clients, &frames).await;
        debug!(events = events.len(), clients = delivered, "Delivered events over SSE");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.stop_heartbeat();
        let drained: Vec<_> = self.clients.lock().await.drain().collect();
        let count = drained.len();
        for (_, mut client) in drained {
            client.close().await;
        }
        info!(clients = count, "SSE sink closed");
        Ok(())
    }
}

impl Drop for SseSink {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

/// Writes `frames` to every client concurrently, in order per client, and
/// evicts clients whose write fails. Returns how many clients got them all.
async fn broadcast(clients: &Mutex<ClientMap>, frames: &[String]) -> usize {
    let mut clients = clients.lock().await;
    if clients.is_empty() {
        return 0;
    }

    let writes = clients.iter_mut().map(|(id, client)| async move {
        for frame in frames {
            if let Err(e) = client.write(frame).await {
                return Err((id.clone(), e));
            }
        }
        Ok(())
    });
    let results = join_all(writes).await;

    let mut delivered = 0;
    let mut failed = Vec::new();
    for result in results {
        match result {
            Ok(()) => delivered += 1,
            Err((id, e)) => {
                warn!(client_id = %id, error = %e, "Dropping SSE client after failed write");
                failed.push(id);
            }
        }
    }
    for id in failed {
        if let Some(mut client) = clients.remove(&id) {
            client.close().await;
        }
    }
    delivered
}

fn connected_frame(client_id: &str) -> String {
    let body = json!({
        "type": "connected",
        "clientId": client_id,
        "timestamp": Utc::now().to_rfc3339(),
    });
    format!("data: {}\n\n", body)
}

fn event_frame(event: &ChangeEvent) -> Result<String> {
    let body = serde_json::to_string(event)?;
    Ok(format!("id: {}\ndata: {}\n\n", event.id, body))
}

fn heartbeat_frame() -> String {
    format!(": heartbeat {}\n\n", Utc::now().to_rfc3339())
}

/// What a [`ChannelStream`] hands to the HTTP layer.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Headers(Vec<(String, String)>),
    Data(Bytes),
}

/// A [`StreamClient`] backed by a bounded channel. A full buffer counts as a
/// failed write, so a consumer that stops reading gets evicted.
pub struct ChannelStream {
    tx: Option<mpsc::Sender<StreamFrame>>,
}

impl ChannelStream {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<StreamFrame>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    /// Wraps the receiving half as a `Stream`.
    pub fn into_stream(rx: mpsc::Receiver<StreamFrame>) -> ReceiverStream<StreamFrame> {
        ReceiverStream::new(rx)
    }

    fn push(&self, frame: StreamFrame) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::delivery("sse", "Stream closed"))?;
        tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::delivery("sse", "Client buffer full"),
            mpsc::error::TrySendError::Closed(_) => Error::delivery("sse", "Client disconnected"),
        })
    }
}

#[async_trait]
impl StreamClient for ChannelStream {
    async fn send_headers(&mut self, headers: &[(&'static str, &'static str)]) -> Result<()> {
        let headers = headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.push(StreamFrame::Headers(headers))
    }

    async fn write(&mut self, chunk: &str) -> Result<()> {
        self.push(StreamFrame::Data(Bytes::copy_from_slice(chunk.as_bytes())))
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}
