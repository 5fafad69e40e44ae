//! Stream Orchestrator
//!
//! Public entry point. [`AvailabilityStream`] holds the collaborators and a
//! registry of active subscriptions keyed by [`SubscriptionKey`]; every
//! [`subscribe`](AvailabilityStream::subscribe) spawns one worker task that
//! owns the key's connection, retry, auth and polling state.
//!
//! # Supersede and teardown
//!
//! Each registry entry carries a generation number. Subscribing again to a
//! key that is already active replaces the entry and retires the old worker:
//! its delivery gate closes and its stream is aborted synchronously (no
//! callback can fire after `subscribe` returns) and it is told to shut down. A handle whose entry has
//! been replaced finds a different generation in the registry and leaves the
//! newer subscription alone when it is dropped.
//!
//! ```text
//! subscribe(k) ──► registry[k] = gen 1 ──► worker 1
//! subscribe(k) ──► registry[k] = gen 2 ──► worker 2
//!                  gen 1: gate closed, Shutdown sent
//! drop(handle 1) ─► registry[k] is gen 2, nothing to do
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::auth::TokenStore;
use crate::callbacks::{AvailabilityCallbacks, DeliveryGate};
use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::models::{SubscriptionKey, SubscriptionStatus};
use crate::transport::{SnapshotSource, StreamTransport};
use crate::worker::{Command, ConnectionSlot, SubscriptionWorker, WorkerParams};

/// Registry record for one active key
struct RegistryEntry {
    generation: u64,
    gate: Arc<DeliveryGate>,
    commands: mpsc::UnboundedSender<Command>,
    connection: ConnectionSlot,
}

impl RegistryEntry {
    /// Silence callbacks, stop the stream, and ask the worker to finish up
    fn retire(&self, notify: bool) {
        // Gate first: the worker will not publish a new connection after this
        self.gate.close();
        if let Some(closer) = self.connection.lock().take() {
            tracing::debug!(connection_id = closer.id(), "Aborting retired stream");
            closer.close();
        }
        let _ = self.commands.send(Command::Shutdown { notify });
    }
}

struct StreamInner {
    snapshots: Arc<dyn SnapshotSource>,
    transport: Arc<dyn StreamTransport>,
    tokens: Arc<dyn TokenStore>,
    config: StreamConfig,
    registry: DashMap<SubscriptionKey, RegistryEntry>,
    next_generation: AtomicU64,
}

/// Availability subscriptions sharing one set of collaborators
///
/// Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct AvailabilityStream {
    inner: Arc<StreamInner>,
}

impl AvailabilityStream {
    /// Create with separate snapshot and stream collaborators
    ///
    /// # Errors
    ///
    /// Returns `StreamError::InvalidConfig` if `config` fails validation.
    pub fn new(
        snapshots: Arc<dyn SnapshotSource>,
        transport: Arc<dyn StreamTransport>,
        tokens: Arc<dyn TokenStore>,
        config: StreamConfig,
    ) -> Result<Self, StreamError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(StreamInner {
                snapshots,
                transport,
                tokens,
                config,
                registry: DashMap::new(),
                next_generation: AtomicU64::new(0),
            }),
        })
    }

    /// Create from one client implementing both collaborator roles
    ///
    /// # Errors
    ///
    /// Returns `StreamError::InvalidConfig` if `config` fails validation.
    pub fn with_client<C>(
        client: Arc<C>,
        tokens: Arc<dyn TokenStore>,
        config: StreamConfig,
    ) -> Result<Self, StreamError>
    where
        C: SnapshotSource + StreamTransport + 'static,
    {
        let snapshots: Arc<dyn SnapshotSource> = client.clone();
        let transport: Arc<dyn StreamTransport> = client;
        Self::new(snapshots, transport, tokens, config)
    }

    /// Default configuration for new subscriptions
    #[must_use]
    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }

    /// Subscribe to `key` with the default configuration
    ///
    /// Returns immediately. The initial snapshot fetch, stream setup and
    /// all later deliveries happen on a spawned task.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn subscribe(
        &self,
        key: SubscriptionKey,
        callbacks: impl AvailabilityCallbacks,
    ) -> Subscription {
        // Validated when the stream was built
        let config = self.inner.config.clone();
        self.spawn_subscription(key, Arc::new(callbacks), config)
    }

    /// Subscribe to `key` with an explicit configuration
    ///
    /// # Errors
    ///
    /// Returns `StreamError::InvalidConfig` if `config` fails validation;
    /// nothing is registered and any existing subscription for `key` is
    /// left running.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn subscribe_with(
        &self,
        key: SubscriptionKey,
        callbacks: impl AvailabilityCallbacks,
        config: StreamConfig,
    ) -> Result<Subscription, StreamError> {
        config.validate()?;
        Ok(self.spawn_subscription(key, Arc::new(callbacks), config))
    }

    fn spawn_subscription(
        &self,
        key: SubscriptionKey,
        callbacks: Arc<dyn AvailabilityCallbacks>,
        config: StreamConfig,
    ) -> Subscription {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let gate = Arc::new(DeliveryGate::new(callbacks));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SubscriptionStatus::default());
        let connection_slot: ConnectionSlot = Arc::new(Mutex::new(None));

        let entry = RegistryEntry {
            generation,
            gate: Arc::clone(&gate),
            commands: commands_tx.clone(),
            connection: Arc::clone(&connection_slot),
        };
        // Old worker is retired before the new one exists
        if let Some(previous) = self.inner.registry.insert(key.clone(), entry) {
            tracing::debug!(key = %key, generation = previous.generation, "Superseding subscription");
            previous.retire(false);
        }

        let worker = SubscriptionWorker::new(WorkerParams {
            key: key.clone(),
            config: config.clone(),
            snapshots: Arc::clone(&self.inner.snapshots),
            transport: Arc::clone(&self.inner.transport),
            tokens: Arc::clone(&self.inner.tokens),
            gate: Arc::clone(&gate),
            status: status_tx,
            commands: commands_rx,
            connection_slot,
        });
        tokio::spawn(worker.run());

        tracing::info!(
            key = %key,
            generation,
            streaming = config.streaming_enabled,
            polling = config.polling_enabled,
            "Subscribed to availability"
        );

        Subscription {
            key,
            generation,
            config,
            gate,
            commands: commands_tx,
            status: status_rx,
            stream: self.clone(),
            closed: false,
        }
    }

    /// Number of active subscriptions
    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        self.inner.registry.len()
    }

    /// Whether `key` has an active subscription
    #[must_use]
    pub fn is_subscribed(&self, key: &SubscriptionKey) -> bool {
        self.inner.registry.contains_key(key)
    }

    /// Unsubscribe everything
    pub fn shutdown(&self) {
        let keys: Vec<SubscriptionKey> = self
            .inner
            .registry
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        for key in keys {
            if let Some((_, entry)) = self.inner.registry.remove(&key) {
                entry.retire(true);
            }
        }
        tracing::info!("Availability stream shut down");
    }

    /// Remove `key` if it still belongs to `generation`
    fn release(&self, key: &SubscriptionKey, generation: u64, notify: bool) {
        let removed = self
            .inner
            .registry
            .remove_if(key, |_, entry| entry.generation == generation);
        if let Some((_, entry)) = removed {
            entry.retire(notify);
        }
    }
}

/// Handle to one active subscription
///
/// Dropping the handle unsubscribes.
pub struct Subscription {
    key: SubscriptionKey,
    generation: u64,
    config: StreamConfig,
    gate: Arc<DeliveryGate>,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SubscriptionStatus>,
    stream: AvailabilityStream,
    closed: bool,
}

impl Subscription {
    /// Key this handle is subscribed to
    #[must_use]
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Whether data is currently arriving over a live stream
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status.borrow().is_streaming
    }

    /// Snapshot of the caller-visible flags
    #[must_use]
    pub fn status(&self) -> SubscriptionStatus {
        self.status.borrow().clone()
    }

    /// Receiver that is notified on every status change
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<SubscriptionStatus> {
        self.status.clone()
    }

    /// Whether this handle still owns the registry entry for its key
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.gate.is_open()
            && self
                .stream
                .inner
                .registry
                .get(&self.key)
                .is_some_and(|entry| entry.generation == self.generation)
    }

    /// Fetch a snapshot now; delivered through the update callback
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Closed` if the subscription has ended.
    pub fn refresh(&self) -> Result<(), StreamError> {
        self.send(Command::Refresh)
    }

    /// Reset the retry budget and open a fresh stream
    ///
    /// Also lifts the block left by an expired session, for use after the
    /// user signs in again.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Closed` if the subscription has ended.
    pub fn reconnect(&self) -> Result<(), StreamError> {
        self.send(Command::Reconnect)
    }

    /// Tear down and notify the server
    pub fn unsubscribe(mut self) {
        self.teardown(true);
    }

    /// Tear down this key and subscribe the same callbacks to `key`
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    #[must_use]
    pub fn switch_key(mut self, key: SubscriptionKey) -> Subscription {
        self.teardown(true);
        let callbacks = self.gate.callbacks();
        let config = self.config.clone();
        self.stream.spawn_subscription(key, callbacks, config)
    }

    fn send(&self, command: Command) -> Result<(), StreamError> {
        if !self.is_active() {
            return Err(StreamError::Closed);
        }
        self.commands.send(command).map_err(|_| StreamError::Closed)
    }

    fn teardown(&mut self, notify: bool) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.gate.close();
        self.stream.release(&self.key, self.generation, notify);
        tracing::debug!(key = %self.key, generation = self.generation, "Subscription handle released");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.teardown(true);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for AvailabilityStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvailabilityStream")
            .field("active", &self.inner.registry.len())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
