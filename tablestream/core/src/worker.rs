//! Subscription Worker
//!
//! One task per subscription owns every piece of mutable state for its key:
//! the live [`StreamConnection`], the [`ReconnectPolicy`] counters, the
//! [`AuthRecovery`] phase, the [`FallbackPoller`] timer and any in-flight
//! fetches. Nothing else touches them, so teardown is a single `Shutdown`
//! command. The one shared piece is the current connection's
//! [`ConnectionCloser`], which the registry uses to stop a superseded stream
//! without waiting for the worker to get there.
//!
//! # State machine
//!
//! ```text
//!            initial fetch
//! Idle ─────────────────────► Connecting ──Opened──► Streaming
//!   │                          ▲      │                  │
//!   │ streaming off            │retry │ ended            │ ended
//!   ▼                          │      ▼                  ▼
//! Disconnected (polling) ◄── Disconnected ◄──────────────┘
//!                                 │
//!                                 │ budget exhausted / session expired
//!                                 ▼
//!                               Failed (polling if enabled)
//! ```

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::auth::{AuthRecovery, TokenStore};
use crate::callbacks::DeliveryGate;
use crate::config::StreamConfig;
use crate::connection::{
    ConnectionCloser, ConnectionEnd, ConnectionEvent, ConnectionMessage, ConnectionParams,
    SnapshotKind, StreamConnection, TokenSource,
};
use crate::error::StreamError;
use crate::models::{AvailabilitySnapshot, ConnectionState, SubscriptionKey, SubscriptionStatus};
use crate::poller::FallbackPoller;
use crate::reconnect::{PendingRetry, ReconnectPolicy};
use crate::transport::{SnapshotSource, StreamTransport};

/// Capacity of the connection event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Stop switch for the worker's current connection, shared with the registry
pub(crate) type ConnectionSlot = Arc<Mutex<Option<ConnectionCloser>>>;

/// Requests from the owning [`Subscription`](crate::Subscription)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    /// Fetch a snapshot now
    Refresh,
    /// Forget failures and open a fresh stream
    Reconnect,
    /// Tear down; `notify` sends the unsubscribe request to the server
    Shutdown { notify: bool },
}

/// Result of a background job
enum JobOutcome {
    InitialFetch(Result<AvailabilitySnapshot, StreamError>),
    Poll(Result<AvailabilitySnapshot, StreamError>),
    Refresh(Result<AvailabilitySnapshot, StreamError>),
    TokenRefresh(Option<String>),
}

/// Collaborators and channels handed to a new worker
pub(crate) struct WorkerParams {
    pub key: SubscriptionKey,
    pub config: StreamConfig,
    pub snapshots: Arc<dyn SnapshotSource>,
    pub transport: Arc<dyn StreamTransport>,
    pub tokens: Arc<dyn TokenStore>,
    pub gate: Arc<DeliveryGate>,
    pub status: watch::Sender<SubscriptionStatus>,
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub connection_slot: ConnectionSlot,
}

pub(crate) struct SubscriptionWorker {
    key: SubscriptionKey,
    config: StreamConfig,
    transport: Arc<dyn StreamTransport>,
    tokens: Arc<dyn TokenStore>,
    gate: Arc<DeliveryGate>,
    status: watch::Sender<SubscriptionStatus>,
    commands: mpsc::UnboundedReceiver<Command>,

    events_tx: mpsc::Sender<ConnectionMessage>,
    events_rx: mpsc::Receiver<ConnectionMessage>,
    connection: Option<StreamConnection>,
    connection_slot: ConnectionSlot,
    next_connection_id: u64,

    policy: ReconnectPolicy,
    auth: AuthRecovery,
    retry: Option<PendingRetry>,
    poller: FallbackPoller,
    jobs: JoinSet<JobOutcome>,
}

impl SubscriptionWorker {
    pub(crate) fn new(params: WorkerParams) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            policy: ReconnectPolicy::new(&params.config),
            poller: FallbackPoller::new(params.key.clone(), params.snapshots),
            key: params.key,
            config: params.config,
            transport: params.transport,
            tokens: params.tokens,
            gate: params.gate,
            status: params.status,
            commands: params.commands,
            events_tx,
            events_rx,
            connection: None,
            connection_slot: params.connection_slot,
            next_connection_id: 0,
            auth: AuthRecovery::new(),
            retry: None,
            jobs: JoinSet::new(),
        }
    }

    /// Drive the subscription until it is shut down
    pub(crate) async fn run(mut self) {
        let initial = self.poller.fetch();
        self.jobs
            .spawn(async move { JobOutcome::InitialFetch(initial.await) });

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { notify }) => {
                        self.shutdown(notify);
                        return;
                    }
                    // Every handle dropped without an explicit shutdown
                    None => {
                        self.shutdown(false);
                        return;
                    }
                    Some(Command::Refresh) => self.spawn_refresh(),
                    Some(Command::Reconnect) => self.force_reconnect(),
                },

                Some(message) = self.events_rx.recv() => self.handle_message(message),

                () = wait_retry(&mut self.retry), if self.retry.is_some() => {
                    self.retry = None;
                    let store = Arc::clone(&self.tokens);
                    self.open_connection(TokenSource::Store(store));
                }

                () = self.poller.tick(), if self.poller.is_running() => self.spawn_poll(),

                Some(joined) = self.jobs.join_next(), if !self.jobs.is_empty() => match joined {
                    Ok(outcome) => self.handle_job(outcome),
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => tracing::error!(key = %self.key, error = %e, "Subscription job panicked"),
                },
            }
        }
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Start streaming, or polling when streaming is off
    fn engage(&mut self) {
        if self.config.streaming_enabled {
            let store = Arc::clone(&self.tokens);
            self.open_connection(TokenSource::Store(store));
        } else if self.config.polling_enabled {
            self.set_state(ConnectionState::Disconnected);
            self.poller.start(self.config.polling_interval());
        } else {
            tracing::debug!(key = %self.key, "Streaming and polling both disabled");
        }
    }

    fn open_connection(&mut self, token: TokenSource) {
        self.close_connection();
        self.set_state(ConnectionState::Connecting);

        // The gate is checked under the slot lock: a retire that closed it
        // either stops us here or finds the new connection in the slot
        let mut slot = self.connection_slot.lock();
        if !self.gate.is_open() {
            tracing::debug!(key = %self.key, "Subscription retired, not opening stream");
            return;
        }

        self.next_connection_id += 1;
        let connection = StreamConnection::open(ConnectionParams {
            id: self.next_connection_id,
            key: self.key.clone(),
            token,
            timeout: self.config.connection_timeout(),
            transport: Arc::clone(&self.transport),
            events: self.events_tx.clone(),
        });
        *slot = connection.closer();
        drop(slot);
        self.connection = Some(connection);
    }

    fn close_connection(&mut self) {
        self.connection_slot.lock().take();
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
    }

    fn handle_message(&mut self, message: ConnectionMessage) {
        let current = self.connection.as_ref().map(StreamConnection::id);
        if current != Some(message.connection_id) {
            tracing::debug!(
                key = %self.key,
                connection_id = message.connection_id,
                "Ignoring event from replaced connection"
            );
            return;
        }

        match message.event {
            ConnectionEvent::Opened => {
                self.policy.reset_attempts();
                self.auth.connected();
                self.poller.stop();
                self.status.send_modify(|s| s.reconnect_attempts = 0);
                self.set_state(ConnectionState::Streaming);
            }
            ConnectionEvent::Snapshot { kind, snapshot } => {
                self.deliver_snapshot(kind, &snapshot);
            }
            ConnectionEvent::Ended(end) => {
                // The reader has exited; dropping the handle is all that's left
                self.connection_slot.lock().take();
                self.connection = None;
                self.handle_end(end);
            }
        }
    }

    fn handle_end(&mut self, end: ConnectionEnd) {
        if end == ConnectionEnd::Unauthorized {
            self.handle_unauthorized();
            return;
        }

        // Anything but success from the post-refresh connection ends the session
        if self.auth.awaiting_reconnect() {
            tracing::warn!(key = %self.key, end = ?end, "Reconnect with refreshed token failed");
            self.expire_session();
            return;
        }

        match end.error() {
            Some(error) => {
                tracing::warn!(key = %self.key, error = %error, "Availability stream failed");
                let surface = !error.is_transient() || !self.has_data();
                self.report(&error, surface);
            }
            None => tracing::info!(key = %self.key, end = ?end, "Availability stream ended"),
        }

        self.set_state(ConnectionState::Disconnected);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.policy.is_intentional_close() {
            return;
        }

        if let Some(retry) = self.policy.schedule_retry() {
            tracing::warn!(
                key = %self.key,
                attempt = retry.attempt() + 1,
                max_attempts = self.policy.max_attempts(),
                delay_ms = retry.delay().as_millis() as u64,
                "Scheduling stream reconnect"
            );
            let attempts = self.policy.attempts();
            self.status.send_modify(|s| s.reconnect_attempts = attempts);
            self.retry = Some(retry);
            return;
        }

        let attempts = self.policy.max_attempts();
        tracing::error!(key = %self.key, attempts, "Max reconnection attempts reached");
        self.set_state(ConnectionState::Failed);
        self.report(&StreamError::MaxReconnectAttempts { attempts }, true);

        if self.config.polling_enabled {
            self.poller.start(self.config.polling_interval());
        }
    }

    /// Caller-requested fresh start
    fn force_reconnect(&mut self) {
        if !self.config.streaming_enabled {
            tracing::debug!(key = %self.key, "Reconnect ignored, streaming disabled");
            return;
        }
        tracing::info!(key = %self.key, "Manual reconnect");
        self.policy.clear_intentional_close();
        self.policy.reset_attempts();
        self.auth.reset();
        self.retry = None;
        self.status.send_modify(|s| s.reconnect_attempts = 0);

        let store = Arc::clone(&self.tokens);
        self.open_connection(TokenSource::Store(store));
    }

    // ========================================================================
    // Auth recovery
    // ========================================================================

    fn handle_unauthorized(&mut self) {
        if !self.auth.begin() {
            tracing::warn!(key = %self.key, "Refreshed token rejected");
            self.expire_session();
            return;
        }

        tracing::info!(key = %self.key, "Stream unauthorized, refreshing access token");
        self.set_state(ConnectionState::Disconnected);
        let tokens = Arc::clone(&self.tokens);
        self.jobs.spawn(async move {
            JobOutcome::TokenRefresh(tokens.refresh_access_token().await)
        });
    }

    fn expire_session(&mut self) {
        tracing::error!(key = %self.key, "Session expired, forcing logout");

        self.policy.mark_intentional_close();
        self.retry = None;
        self.auth.reset();
        self.close_connection();
        self.poller.stop();
        self.set_state(ConnectionState::Failed);
        self.report(&StreamError::SessionExpired, true);

        let tokens = Arc::clone(&self.tokens);
        tokio::spawn(async move { tokens.force_logout().await });
    }

    // ========================================================================
    // Background jobs
    // ========================================================================

    fn spawn_poll(&mut self) {
        let fetch = self.poller.fetch();
        self.jobs.spawn(async move { JobOutcome::Poll(fetch.await) });
    }

    fn spawn_refresh(&mut self) {
        let fetch = self.poller.fetch();
        self.jobs.spawn(async move { JobOutcome::Refresh(fetch.await) });
    }

    fn handle_job(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::InitialFetch(result) => {
                match result {
                    Ok(snapshot) => self.deliver_snapshot(SnapshotKind::Initial, &snapshot),
                    Err(e) => {
                        tracing::warn!(key = %self.key, error = %e, "Initial availability fetch failed");
                        self.report(&e, true);
                    }
                }
                self.engage();
            }
            JobOutcome::Poll(Ok(snapshot)) => {
                tracing::debug!(key = %self.key, polls = self.poller.polls(), "Poll succeeded");
                self.deliver_snapshot(SnapshotKind::Update, &snapshot);
            }
            JobOutcome::Poll(Err(e)) => {
                tracing::warn!(key = %self.key, error = %e, "Availability poll failed");
                self.report(&e, false);
            }
            JobOutcome::Refresh(Ok(snapshot)) => {
                let kind = if self.has_data() {
                    SnapshotKind::Update
                } else {
                    SnapshotKind::Initial
                };
                self.deliver_snapshot(kind, &snapshot);
            }
            JobOutcome::Refresh(Err(e)) => {
                tracing::warn!(key = %self.key, error = %e, "Availability refresh failed");
                self.report(&e, true);
            }
            JobOutcome::TokenRefresh(Some(token)) => {
                tracing::info!(key = %self.key, "Access token refreshed, reconnecting");
                self.auth.refreshed();
                self.open_connection(TokenSource::Refreshed(token));
            }
            JobOutcome::TokenRefresh(None) => {
                tracing::warn!(key = %self.key, "Access token refresh failed");
                self.expire_session();
            }
        }
    }

    // ========================================================================
    // Delivery and status
    // ========================================================================

    fn has_data(&self) -> bool {
        self.status.borrow().has_data
    }

    fn deliver_snapshot(&self, kind: SnapshotKind, snapshot: &AvailabilitySnapshot) {
        self.status.send_modify(|s| {
            s.has_data = true;
            s.last_updated = Some(Utc::now());
            s.last_error = None;
        });
        self.gate.deliver(|callbacks| match kind {
            SnapshotKind::Initial => callbacks.on_initial_data(snapshot),
            SnapshotKind::Update => callbacks.on_update(snapshot),
        });
    }

    /// Record `error`; invoke `on_error` only when `surface` is set
    fn report(&self, error: &StreamError, surface: bool) {
        let message = error.to_string();
        self.status.send_modify(|s| s.last_error = Some(message));
        if surface {
            self.gate.deliver(|callbacks| callbacks.on_error(error));
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.status.send_if_modified(|s| {
            if s.state == state {
                return false;
            }
            s.state = state;
            s.is_streaming = state.is_live();
            true
        });
        if changed {
            tracing::debug!(key = %self.key, state = %state, "Connection state changed");
            self.gate
                .deliver(|callbacks| callbacks.on_connection_change(state));
        }
    }

    fn shutdown(&mut self, notify: bool) {
        self.gate.close();
        self.policy.mark_intentional_close();
        self.retry = None;
        self.poller.stop();
        self.close_connection();
        self.jobs.abort_all();
        self.status.send_modify(|s| {
            s.state = ConnectionState::Idle;
            s.is_streaming = false;
        });

        if notify {
            let transport = Arc::clone(&self.transport);
            let key = self.key.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.unsubscribe(&key).await {
                    tracing::debug!(key = %key, error = %e, "Unsubscribe notification failed");
                }
            });
        }

        tracing::info!(key = %self.key, "Subscription closed");
    }
}

async fn wait_retry(retry: &mut Option<PendingRetry>) {
    match retry {
        Some(retry) => retry.wait().await,
        None => std::future::pending().await,
    }
}
