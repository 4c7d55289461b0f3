//! LISTEN/NOTIFY subscription with automatic reconnection.
//!
//! A [`NotificationListener`] owns one dedicated connection subscribed to a
//! single channel. Payloads are forwarded to the payload handler in the order
//! the server delivers them. When the connection fails, the listener
//! schedules exactly one reconnect attempt after
//! `min(1s * 2^(attempts - 1), 30s)`; each failed attempt schedules exactly
//! one successor until [`NotificationListener::disconnect`] is called.
//!
//! Notifications published while disconnected are lost.

use futures::{stream, StreamExt};
use postgres_protocol::escape::escape_identifier;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_postgres::{AsyncMessage, Client, Config, NoTls};
use tracing::{debug, error, info, warn};

use crate::{Error, Result};

/// Receives raw notification payloads.
pub type PayloadHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Receives transport errors.
pub type ListenerErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

const INITIAL_BACKOFF_MS: u64 = 1_000;
const MAX_BACKOFF_MS: u64 = 30_000;

/// Reconnect delay after `attempt` consecutive failures (1-based).
pub fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let millis = INITIAL_BACKOFF_MS.saturating_mul(1u64 << exponent);
    Duration::from_millis(millis.min(MAX_BACKOFF_MS))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Listening,
}

struct ActiveConnection {
    client: Client,
    driver: JoinHandle<()>,
}

struct PendingRetry {
    handle: JoinHandle<()>,
    delay: Duration,
}

struct ListenerState {
    status: ConnectionState,
    attempts: u32,
    /// Bumped on every connect and disconnect so stale tasks can tell they
    /// belong to a connection that no longer exists.
    generation: u64,
    connection: Option<ActiveConnection>,
    /// Transport failure seen by the driver before `connect` finished.
    lost: Option<Error>,
    retry: Option<PendingRetry>,
    stopped: bool,
}

/// Outcome of an attempt whose subscription succeeded.
enum Settled {
    /// `disconnect` ran while the attempt was in flight.
    Stale,
    /// The connection died before it could be promoted.
    Lost(Error),
    Listening,
}

impl ListenerState {
    fn settle(&mut self, generation: u64) -> Settled {
        if self.generation != generation {
            return Settled::Stale;
        }
        if let Some(err) = self.lost.take() {
            return Settled::Lost(err);
        }
        self.status = ConnectionState::Listening;
        self.attempts = 0;
        Settled::Listening
    }
}

struct Inner {
    config: Config,
    channel: String,
    on_payload: PayloadHandler,
    on_error: ListenerErrorHandler,
    state: Mutex<ListenerState>,
}

pub struct NotificationListener {
    inner: Arc<Inner>,
}

impl NotificationListener {
    /// Creates a listener. No I/O happens until [`connect`](Self::connect).
    pub fn new(
        config: Config,
        channel: impl Into<String>,
        on_payload: PayloadHandler,
        on_error: ListenerErrorHandler,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                channel: channel.into(),
                on_payload,
                on_error,
                state: Mutex::new(ListenerState {
                    status: ConnectionState::Disconnected,
                    attempts: 0,
                    generation: 0,
                    connection: None,
                    lost: None,
                    retry: None,
                    stopped: false,
                }),
            }),
        }
    }

    /// Opens the connection and subscribes to the channel.
    ///
    /// Returns immediately if already listening. On failure a reconnect is
    /// scheduled and the error is still returned to the caller.
    pub async fn connect(&self) -> Result<()> {
        self.inner.connect(false).await
    }

    /// Cancels any scheduled reconnect, unsubscribes and closes the
    /// connection. Safe to call repeatedly.
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.disconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Listening
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().status
    }

    /// Consecutive failed connection attempts since the last success.
    pub fn attempts(&self) -> u32 {
        self.inner.lock().attempts
    }

    pub fn has_pending_retry(&self) -> bool {
        self.inner.lock().retry.is_some()
    }

    /// Delay the currently scheduled reconnect was armed with.
    pub fn pending_retry_delay(&self) -> Option<Duration> {
        self.inner.lock().retry.as_ref().map(|r| r.delay)
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, ListenerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn connect(self: &Arc<Self>, from_retry: bool) -> Result<()> {
        let generation = {
            let mut state = self.lock();
            if from_retry && state.stopped {
                return Ok(());
            }
            state.stopped = false;
            match state.status {
                ConnectionState::Listening => return Ok(()),
                ConnectionState::Connecting => {
                    debug!(channel = %self.channel, "Connection attempt already in progress");
                    return Ok(());
                }
                ConnectionState::Disconnected => {}
            }
            state.status = ConnectionState::Connecting;
            state.lost = None;
            state.generation += 1;
            state.generation
        };

        debug!(channel = %self.channel, generation, "Connecting notification listener");

        let failure = match self.open(generation).await {
            Ok(connection) => {
                let mut state = self.lock();
                match state.settle(generation) {
                    Settled::Listening => {
                        state.connection = Some(connection);
                        info!(channel = %self.channel, "Listening for change notifications");
                        return Ok(());
                    }
                    Settled::Stale => {
                        connection.driver.abort();
                        return Ok(());
                    }
                    Settled::Lost(e) => {
                        connection.driver.abort();
                        e
                    }
                }
            }
            Err(e) => e,
        };

        self.fail_attempt(generation, failure)
    }

    fn fail_attempt(self: &Arc<Self>, generation: u64, err: Error) -> Result<()> {
        let delay = {
            let mut state = self.lock();
            if state.generation != generation {
                return Err(err);
            }
            state.status = ConnectionState::Disconnected;
            state.attempts += 1;
            backoff_delay(state.attempts)
        };
        warn!(
            channel = %self.channel,
            error = %err,
            retry_in_ms = delay.as_millis() as u64,
            "Failed to start notification listener"
        );
        self.schedule_retry(delay);
        Err(err)
    }

    async fn open(self: &Arc<Self>, generation: u64) -> Result<ActiveConnection> {
        let (client, mut connection) = self.config.connect(NoTls).await?;

        let weak = Arc::downgrade(self);
        let channel = self.channel.clone();
        let driver = tokio::spawn(async move {
            let messages = stream::poll_fn(move |cx| connection.poll_message(cx));
            let mut messages = std::pin::pin!(messages);
            let failure = loop {
                match messages.next().await {
                    Some(Ok(AsyncMessage::Notification(notification))) => {
                        if notification.channel() != channel {
                            continue;
                        }
                        match weak.upgrade() {
                            Some(inner) => (inner.on_payload)(notification.payload().to_string()),
                            None => return,
                        }
                    }
                    Some(Ok(AsyncMessage::Notice(notice))) => {
                        debug!(message = %notice.message(), "Notice on notification connection");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Error::Postgres(e),
                    None => {
                        break Error::Connection("Notification connection closed".to_string())
                    }
                }
            };
            if let Some(inner) = weak.upgrade() {
                inner.handle_transport_error(generation, failure);
            }
        });

        let listen = format!("LISTEN {}", escape_identifier(&self.channel));
        if let Err(e) = client.batch_execute(&listen).await {
            driver.abort();
            return Err(e.into());
        }

        Ok(ActiveConnection { client, driver })
    }

    fn handle_transport_error(self: &Arc<Self>, generation: u64, err: Error) {
        let delay = {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            match state.status {
                ConnectionState::Listening => {}
                ConnectionState::Connecting => {
                    // connect() is still finishing and will fail the attempt
                    state.lost = Some(err);
                    return;
                }
                ConnectionState::Disconnected => return,
            }
            state.status = ConnectionState::Disconnected;
            // dropping the handle detaches the driver, which is the caller
            state.connection = None;
            state.attempts += 1;
            backoff_delay(state.attempts)
        };

        error!(
            channel = %self.channel,
            error = %err,
            retry_in_ms = delay.as_millis() as u64,
            "Notification connection lost"
        );
        self.schedule_retry(delay);
        (self.on_error)(&err);
    }

    fn schedule_retry(self: &Arc<Self>, delay: Duration) {
        let weak: Weak<Inner> = Arc::downgrade(self);
        let mut state = self.lock();
        if state.stopped {
            return;
        }
        if let Some(previous) = state.retry.take() {
            previous.handle.abort();
        }

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            // release our own handle so the next failure does not abort us
            inner.lock().retry = None;
            if let Err(e) = inner.connect(true).await {
                debug!(error = %e, "Reconnect attempt failed");
            }
        });
        state.retry = Some(PendingRetry { handle, delay });
    }

    async fn disconnect(&self) -> Result<()> {
        let connection = {
            let mut state = self.lock();
            state.stopped = true;
            state.generation += 1;
            if let Some(retry) = state.retry.take() {
                retry.handle.abort();
            }
            state.status = ConnectionState::Disconnected;
            state.connection.take()
        };

        if let Some(connection) = connection {
            let unlisten = format!("UNLISTEN {}", escape_identifier(&self.channel));
            if let Err(e) = connection.client.batch_execute(&unlisten).await {
                debug!(error = %e, "UNLISTEN failed during disconnect");
            }
            connection.driver.abort();
            info!(channel = %self.channel, "Notification listener disconnected");
        }
        Ok(())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|p| p.into_inner());
        if let Some(retry) = state.retry.take() {
            retry.handle.abort();
        }
        if let Some(connection) = state.connection.take() {
            connection.driver.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn unreachable_config() -> Config {
        let mut config = Config::new();
        config
            .host("127.0.0.1")
            .port(1)
            .user("postgres")
            .dbname("postgres")
            .connect_timeout(Duration::from_secs(1));
        config
    }

    fn listener(errors: Arc<AtomicUsize>) -> NotificationListener {
        NotificationListener::new(
            unreachable_config(),
            "test_channel",
            Arc::new(|_| {}),
            Arc::new(move |_: &Error| {
                errors.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn test_backoff_sequence() {
        let expected = [1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000];
        for (i, ms) in expected.iter().enumerate() {
            assert_eq!(backoff_delay(i as u32 + 1), Duration::from_millis(*ms));
        }
    }

    #[test]
    fn test_backoff_never_exceeds_ceiling() {
        for attempt in [0, 1, 6, 32, 64, u32::MAX] {
            assert!(backoff_delay(attempt) <= Duration::from_secs(30));
        }
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_failed_connect_schedules_single_retry() {
        let errors = Arc::new(AtomicUsize::new(0));
        let listener = listener(errors.clone());
        assert_eq!(listener.state(), ConnectionState::Disconnected);

        assert!(listener.connect().await.is_err());
        assert_eq!(listener.attempts(), 1);
        assert_eq!(listener.state(), ConnectionState::Disconnected);
        assert_eq!(listener.pending_retry_delay(), Some(Duration::from_secs(1)));

        // a second failure replaces the pending retry instead of adding one
        assert!(listener.connect().await.is_err());
        assert_eq!(listener.attempts(), 2);
        assert_eq!(listener.pending_retry_delay(), Some(Duration::from_secs(2)));

        // connect failures are returned to the caller, not the error handler
        assert_eq!(errors.load(Ordering::SeqCst), 0);

        listener.disconnect().await.unwrap();
        assert!(!listener.has_pending_retry());
        assert!(!listener.is_connected());
    }

    async fn wait_for_retry(listener: &NotificationListener, delay: Duration) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while listener.pending_retry_delay() != Some(delay) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "no retry armed with {:?}, attempts: {}",
                delay,
                listener.attempts()
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Puts the listener in `status` as if an attempt of the current
    /// generation had got that far.
    fn force_status(listener: &NotificationListener, status: ConnectionState) -> u64 {
        let mut state = listener.inner.lock();
        state.status = status;
        state.generation += 1;
        state.generation
    }

    #[tokio::test]
    async fn test_failed_retries_schedule_one_successor_each() {
        let errors = Arc::new(AtomicUsize::new(0));
        let listener = listener(errors.clone());

        assert!(listener.connect().await.is_err());
        assert_eq!(listener.attempts(), 1);
        assert_eq!(listener.pending_retry_delay(), Some(Duration::from_secs(1)));

        wait_for_retry(&listener, Duration::from_secs(2)).await;
        assert_eq!(listener.attempts(), 2);

        wait_for_retry(&listener, Duration::from_secs(4)).await;
        assert_eq!(listener.attempts(), 3);
        assert_eq!(listener.state(), ConnectionState::Disconnected);
        assert_eq!(errors.load(Ordering::SeqCst), 0);

        listener.disconnect().await.unwrap();
        assert!(!listener.has_pending_retry());
    }

    #[tokio::test]
    async fn test_transport_error_while_listening_schedules_reconnect() {
        let errors = Arc::new(AtomicUsize::new(0));
        let listener = listener(errors.clone());
        let generation = force_status(&listener, ConnectionState::Listening);

        // a driver from an older connection is ignored
        listener.inner.handle_transport_error(
            generation - 1,
            Error::Connection("stale".to_string()),
        );
        assert!(listener.is_connected());
        assert_eq!(errors.load(Ordering::SeqCst), 0);

        listener.inner.handle_transport_error(
            generation,
            Error::Connection("Notification connection closed".to_string()),
        );
        assert_eq!(listener.state(), ConnectionState::Disconnected);
        assert_eq!(listener.attempts(), 1);
        assert_eq!(listener.pending_retry_delay(), Some(Duration::from_secs(1)));
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        listener.disconnect().await.unwrap();
        assert!(!listener.has_pending_retry());
    }

    #[tokio::test]
    async fn test_connection_lost_during_connect_is_not_promoted() {
        let errors = Arc::new(AtomicUsize::new(0));
        let listener = listener(errors.clone());
        let generation = force_status(&listener, ConnectionState::Connecting);

        listener.inner.handle_transport_error(
            generation,
            Error::Connection("Notification connection closed".to_string()),
        );
        // left for connect() to report as a failed attempt
        assert_eq!(listener.state(), ConnectionState::Connecting);
        assert!(!listener.has_pending_retry());
        assert_eq!(errors.load(Ordering::SeqCst), 0);

        let settled = listener.inner.lock().settle(generation);
        let err = match settled {
            Settled::Lost(err) => err,
            Settled::Listening => panic!("dead connection promoted to listening"),
            Settled::Stale => panic!("attempt treated as stale"),
        };
        assert!(listener.inner.fail_attempt(generation, err).is_err());
        assert_eq!(listener.state(), ConnectionState::Disconnected);
        assert_eq!(listener.attempts(), 1);
        assert_eq!(listener.pending_retry_delay(), Some(Duration::from_secs(1)));

        listener.disconnect().await.unwrap();
    }

    #[test]
    fn test_settle_promotes_current_generation() {
        let listener = listener(Arc::new(AtomicUsize::new(0)));
        let generation = force_status(&listener, ConnectionState::Connecting);
        listener.inner.lock().attempts = 3;

        assert!(matches!(
            listener.inner.lock().settle(generation - 1),
            Settled::Stale
        ));
        assert!(matches!(
            listener.inner.lock().settle(generation),
            Settled::Listening
        ));
        assert!(listener.is_connected());
        assert_eq!(listener.attempts(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let listener = listener(Arc::new(AtomicUsize::new(0)));
        listener.disconnect().await.unwrap();
        listener.disconnect().await.unwrap();
        assert_eq!(listener.state(), ConnectionState::Disconnected);
        assert_eq!(listener.channel(), "test_channel");
    }
}
