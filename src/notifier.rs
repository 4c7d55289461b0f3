//! The change notifier: wires an adapter to the configured sinks.
//!
//! Events emitted by the adapter are queued to a single processing task,
//! so statistics, transformation, batching and delivery happen strictly in
//! arrival order. Each delivery call fans out to every sink concurrently
//! and counts as one attempt, failed if any sink failed.

use futures::future::join_all;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tracing::{debug, error, info, warn};

use crate::adapter::{AdapterHandlers, ChangeAdapter, ChangeEventHandler};
use crate::batch::EventBatcher;
use crate::delivery::{create_sink, DeliverySink, SinkHandle, StreamClient};
use crate::event::ChangeEvent;
use crate::postgres::PostgresAdapter;
use crate::stats::NotifierStats;
use crate::transform::TransformPipeline;
use crate::{Config, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifierState {
    Created,
    Initializing,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for NotifierState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NotifierState::Created => "created",
            NotifierState::Initializing => "initializing",
            NotifierState::Running => "running",
            NotifierState::Stopping => "stopping",
            NotifierState::Stopped => "stopped",
        })
    }
}

/// State shared with the processing task and adapter callbacks.
#[derive(Default)]
struct Shared {
    stats: Mutex<NotifierStats>,
    change_override: RwLock<Option<ChangeEventHandler>>,
    observers: AdapterHandlers,
}

impl Shared {
    fn stats(&self) -> MutexGuard<'_, NotifierStats> {
        self.stats.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn change_override(&self) -> Option<ChangeEventHandler> {
        self.change_override
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

struct Worker {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct ChangeNotifier {
    config: Config,
    adapter: Option<Box<dyn ChangeAdapter>>,
    error_hook_installed: bool,
    sinks: Vec<SinkHandle>,
    shared: Arc<Shared>,
    worker: Option<Worker>,
    state: NotifierState,
}

impl ChangeNotifier {
    /// Validates the configuration. The database adapter is built on
    /// [`initialize`](Self::initialize).
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            adapter: None,
            error_hook_installed: false,
            sinks: Vec::new(),
            shared: Arc::new(Shared::default()),
            worker: None,
            state: NotifierState::Created,
        })
    }

    /// Uses `adapter` instead of building one from `config.database`.
    pub fn with_adapter(config: Config, adapter: Box<dyn ChangeAdapter>) -> Result<Self> {
        let mut notifier = Self::new(config)?;
        notifier.adapter = Some(adapter);
        Ok(notifier)
    }

    pub fn state(&self) -> NotifierState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == NotifierState::Running
    }

    /// A snapshot of the counters.
    pub fn stats(&self) -> NotifierStats {
        self.shared.stats().clone()
    }

    /// Sinks built by the last successful initialization, in config order.
    pub fn sinks(&self) -> &[SinkHandle] {
        &self.sinks
    }

    /// Sends adapter events to `handler` instead of the delivery pipeline.
    /// Takes effect immediately when running.
    pub fn on_change_event<F>(&self, handler: F)
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        let handler: ChangeEventHandler = Arc::new(handler);
        *self
            .shared
            .change_override
            .write()
            .unwrap_or_else(|p| p.into_inner()) = Some(handler.clone());

        if self.is_active() {
            if let Some(adapter) = &self.adapter {
                adapter.on_change_event(handler);
            }
        }
    }

    /// Observes adapter errors. They are recorded in the stats either way.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.shared.observers.add_error_handler(Arc::new(handler));
    }

    /// Registers a streaming client with the first SSE sink.
    pub async fn register_client(&self, client: Box<dyn StreamClient>) -> Result<String> {
        match self.first_sse() {
            Some(sink) => sink.register_client(client).await,
            None => Err(Error::Config("No SSE delivery is configured".to_string())),
        }
    }

    pub async fn remove_client(&self, client_id: &str) -> Result<bool> {
        match self.first_sse() {
            Some(sink) => Ok(sink.remove_client(client_id).await),
            None => Err(Error::Config("No SSE delivery is configured".to_string())),
        }
    }

    fn first_sse(&self) -> Option<&crate::delivery::SseSink> {
        self.sinks.iter().find_map(|handle| match handle {
            SinkHandle::Sse(sink) => Some(sink.as_ref()),
            _ => None,
        })
    }

    /// Connects the adapter, opens every sink, installs change capture and
    /// starts listening. On failure everything acquired so far is released
    /// and the notifier ends up [`Stopped`](NotifierState::Stopped).
    pub async fn initialize(&mut self) -> Result<()> {
        if self.is_active() {
            warn!("Change notifier is already running");
            return Ok(());
        }

        info!(
            database = %self.config.database.database,
            host = %self.config.database.host,
            sinks = self.config.delivery.len(),
            batching = self.config.batching.enabled,
            "Initializing change notifier"
        );
        self.state = NotifierState::Initializing;

        match self.start_up().await {
            Ok(()) => {
                self.state = NotifierState::Running;
                self.shared.stats().mark_started();
                info!("Change notifier running");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Change notifier failed to initialize");
                self.shut_down().await;
                self.state = NotifierState::Stopped;
                Err(Error::wrap("Failed to initialize change notifier", e))
            }
        }
    }

    async fn start_up(&mut self) -> Result<()> {
        if self.adapter.is_none() {
            self.adapter = Some(Box::new(PostgresAdapter::new(&self.config.database)?));
        }

        {
            let adapter = self.adapter.as_ref().ok_or_else(|| {
                Error::Connection("Database adapter is not available".to_string())
            })?;
            if !adapter.test_connection().await {
                return Err(Error::Connection(format!(
                    "Unable to connect to {} database {} at {}:{}",
                    adapter.database_type(),
                    self.config.database.database,
                    self.config.database.host,
                    self.config.database.port
                )));
            }
        }

        for delivery in &self.config.delivery {
            let handle = create_sink(delivery)?;
            // tracked before initialize so a failure still gets it closed
            self.sinks.push(handle.clone());
            handle.as_sink().initialize().await?;
            debug!(sink = handle.kind(), "Delivery sink ready");
        }

        let adapter = self.adapter.as_mut().ok_or_else(|| {
            Error::Connection("Database adapter is not available".to_string())
        })?;
        adapter
            .setup_change_notifications(&self.config.tables)
            .await?;

        if !self.error_hook_installed {
            let shared = self.shared.clone();
            adapter.on_error(Arc::new(move |e: &Error| {
                error!(error = %e, "Change adapter error");
                shared.stats().record_error(e.to_string());
                shared.observers.emit_error(e);
            }));
            self.error_hook_installed = true;
        }

        match self.shared.change_override() {
            Some(handler) => adapter.on_change_event(handler),
            None => {
                let (tx, worker) = spawn_processor(&self.config, &self.sinks, self.shared.clone());
                self.worker = Some(worker);
                adapter.on_change_event(Arc::new(move |event: ChangeEvent| {
                    if tx.send(event).is_err() {
                        debug!("Event processor stopped, dropping change event");
                    }
                }));
            }
        }

        adapter.start().await?;
        Ok(())
    }

    /// Flushes buffered events and releases everything. Never fails;
    /// cleanup errors are logged.
    pub async fn stop(&mut self) {
        if !self.is_active() {
            warn!(state = %self.state, "Change notifier is not running");
            return;
        }

        info!("Stopping change notifier");
        self.state = NotifierState::Stopping;
        self.shut_down().await;
        self.state = NotifierState::Stopped;
        info!("Change notifier stopped");
    }

    async fn shut_down(&mut self) {
        if let Some(worker) = self.worker.take() {
            // the processor flushes its buffer before exiting
            let _ = worker.shutdown.send(());
            if let Err(e) = worker.handle.await {
                error!(error = %e, "Event processor task failed");
            }
        }

        if let Some(adapter) = self.adapter.as_mut() {
            if let Err(e) = adapter.stop().await {
                error!(error = %e, "Failed to stop change adapter");
            }
            if let Err(e) = adapter.teardown_change_notifications().await {
                error!(error = %e, "Failed to remove change notifications");
            }
        }

        for handle in self.sinks.drain(..) {
            if let Err(e) = handle.as_sink().close().await {
                error!(sink = handle.kind(), error = %e, "Failed to close delivery sink");
            }
        }
    }
}

fn spawn_processor(
    config: &Config,
    sinks: &[SinkHandle],
    shared: Arc<Shared>,
) -> (mpsc::UnboundedSender<ChangeEvent>, Worker) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (shutdown, shutdown_rx) = oneshot::channel();

    let processor = EventProcessor {
        pipeline: TransformPipeline::new(config.transformations.clone()),
        batcher: config
            .batching
            .enabled
            .then(|| EventBatcher::new(&config.batching)),
        sinks: sinks.iter().map(SinkHandle::as_sink).collect(),
        shared,
    };
    let handle = tokio::spawn(processor.run(rx, shutdown_rx));

    (tx, Worker { shutdown, handle })
}

struct EventProcessor {
    pipeline: TransformPipeline,
    batcher: Option<EventBatcher>,
    sinks: Vec<Arc<dyn DeliverySink>>,
    shared: Arc<Shared>,
}

impl EventProcessor {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ChangeEvent>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        debug!(
            sinks = self.sinks.len(),
            transformations = self.pipeline.len(),
            "Event processor started"
        );

        loop {
            let flush_at = self.batcher.as_ref().and_then(EventBatcher::deadline);
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                // ahead of recv so a busy queue cannot hold a batch past its window
                _ = sleep_until(flush_at.unwrap_or_else(tokio::time::Instant::now)), if flush_at.is_some() => {
                    self.flush().await;
                }
                received = events.recv() => match received {
                    Some(event) => self.process(event).await,
                    None => break,
                },
            }
        }

        // events accepted before shutdown still count and get delivered
        events.close();
        let mut drained = 0usize;
        while let Ok(event) = events.try_recv() {
            self.process(event).await;
            drained += 1;
        }
        if drained > 0 {
            debug!(events = drained, "Processed queued events on shutdown");
        }

        self.flush().await;
        debug!("Event processor stopped");
    }

    async fn process(&mut self, event: ChangeEvent) {
        self.shared.stats().record_event(&event);

        let id = event.id.clone();
        let Some(event) = self.pipeline.apply(event) else {
            debug!(event_id = %id, "Event dropped by transformation");
            return;
        };

        match self.batcher.as_mut() {
            Some(batcher) => {
                if let Some(batch) = batcher.push(event) {
                    self.deliver(batch).await;
                }
            }
            None => self.deliver(vec![event]).await,
        }
    }

    async fn flush(&mut self) {
        let Some(batcher) = self.batcher.as_mut() else {
            return;
        };
        if batcher.is_empty() {
            return;
        }
        let batch = batcher.take();
        self.deliver(batch).await;
    }

    async fn deliver(&self, events: Vec<ChangeEvent>) {
        let results = join_all(self.sinks.iter().map(|sink| sink.deliver(&events))).await;

        let mut success = true;
        for (sink, result) in self.sinks.iter().zip(results) {
            if let Err(e) = result {
                success = false;
                error!(sink = sink.kind(), events = events.len(), error = %e, "Delivery failed");
                self.shared.stats().record_error(e.to_string());
            }
        }
        self.shared.stats().record_delivery(success);
        debug!(events = events.len(), success, "Delivery complete");
    }
}
