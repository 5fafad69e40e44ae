//! Stream Connection
//!
//! Owns one long-lived streaming request for a subscription key. A spawned
//! reader task decodes the body with the [`FrameDecoder`] and reports typed
//! [`ConnectionEvent`]s to the owning subscription over a channel, each tagged
//! with the connection's id so events from a replaced connection can be
//! recognised and ignored.
//!
//! # Lifecycle
//!
//! ```text
//! open() ──► request sent ──► 2xx ──► Opened ──► Snapshot* ──► Ended(Completed | TimedOut | Failed)
//!                        ├──► 401 ──► Ended(Unauthorized)
//!                        ├──► no response by the deadline ──► Ended(Failed)
//!                        └──► other ─► Ended(Failed)
//! ```
//!
//! The connection timeout is measured from `open()`, so a server that accepts
//! the request but never answers is treated like any other failed attempt.
//!
//! `close()` marks the connection intentional before aborting the reader, so
//! no `Ended` event is ever reported for a connection the owner closed.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Sleep;

use crate::auth::TokenStore;
use crate::error::StreamError;
use crate::frame::{Frame, FrameDecoder, FrameKind};
use crate::models::{AvailabilitySnapshot, SubscriptionKey};
use crate::transport::{BodyStream, StreamRequest, StreamTransport};

/// Whether a snapshot is first paint or a live change
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotKind {
    /// An `availability` event, or an untyped first frame
    Initial,
    /// An `availability-update` event, or a later untyped frame
    Update,
}

/// Why a connection stopped
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEnd {
    /// The server rejected the access token
    Unauthorized,
    /// Non-success status, transport error, or unusable body
    Failed(StreamError),
    /// The server ended the body normally
    Completed,
    /// The connection lifetime elapsed
    TimedOut,
}

impl ConnectionEnd {
    /// The error to report, if the end was a failure
    #[must_use]
    pub fn error(&self) -> Option<StreamError> {
        match self {
            Self::Unauthorized => Some(StreamError::Unauthorized),
            Self::Failed(e) => Some(e.clone()),
            Self::Completed | Self::TimedOut => None,
        }
    }
}

/// Something that happened on a connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Success status received; data is live
    Opened,
    /// A decoded snapshot
    Snapshot {
        /// First paint or change
        kind: SnapshotKind,
        /// Full replacement snapshot
        snapshot: AvailabilitySnapshot,
    },
    /// Terminal; no further events follow
    Ended(ConnectionEnd),
}

/// A [`ConnectionEvent`] tagged with its connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionMessage {
    /// Id passed to [`StreamConnection::open`]
    pub connection_id: u64,
    /// The event
    pub event: ConnectionEvent,
}

/// Where the reader gets its bearer token
pub enum TokenSource {
    /// Ask the store when the request is sent
    Store(Arc<dyn TokenStore>),
    /// Use a freshly refreshed token
    Refreshed(String),
}

impl TokenSource {
    async fn resolve(self) -> Option<String> {
        match self {
            Self::Store(store) => store.access_token().await,
            Self::Refreshed(token) => Some(token),
        }
    }
}

/// Everything needed to open one connection
pub struct ConnectionParams {
    /// Tag for every emitted event
    pub id: u64,
    /// Feed to open
    pub key: SubscriptionKey,
    /// Token lookup
    pub token: TokenSource,
    /// Maximum connection lifetime
    pub timeout: Duration,
    /// Transport collaborator
    pub transport: Arc<dyn StreamTransport>,
    /// Event sink
    pub events: mpsc::Sender<ConnectionMessage>,
}

/// Handle to a running stream
pub struct StreamConnection {
    id: u64,
    key: SubscriptionKey,
    live: Arc<AtomicBool>,
    intentional: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl StreamConnection {
    /// Spawn the reader and return immediately
    pub fn open(params: ConnectionParams) -> Self {
        let live = Arc::new(AtomicBool::new(false));
        let intentional = Arc::new(AtomicBool::new(false));

        let reader = Reader {
            emitter: Emitter {
                connection_id: params.id,
                events: params.events,
                intentional: Arc::clone(&intentional),
            },
            key: params.key.clone(),
            live: Arc::clone(&live),
        };
        let task = tokio::spawn(reader.run(params.token, params.timeout, params.transport));

        tracing::debug!(key = %params.key, connection_id = params.id, "Stream connection opening");

        Self {
            id: params.id,
            key: params.key,
            live,
            intentional,
            task: Some(task),
        }
    }

    /// Connection id
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether response headers were accepted and the body is being read
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// A handle that can stop this connection from outside its owner
    ///
    /// `None` once the connection has been closed.
    #[must_use]
    pub fn closer(&self) -> Option<ConnectionCloser> {
        self.task.as_ref().map(|task| ConnectionCloser {
            id: self.id,
            live: Arc::clone(&self.live),
            intentional: Arc::clone(&self.intentional),
            abort: task.abort_handle(),
        })
    }

    /// Stop the reader; safe to call repeatedly
    pub fn close(&mut self) {
        if let Some(task) = self.task.take() {
            stop(&self.intentional, &self.live, &task.abort_handle());
            tracing::debug!(key = %self.key, connection_id = self.id, "Stream connection closed");
        }
    }
}

/// Detached stop switch for a [`StreamConnection`]
#[derive(Clone, Debug)]
pub struct ConnectionCloser {
    id: u64,
    live: Arc<AtomicBool>,
    intentional: Arc<AtomicBool>,
    abort: AbortHandle,
}

impl ConnectionCloser {
    /// Id of the connection this closes
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop the reader without reporting an end; safe to call repeatedly
    pub fn close(&self) {
        stop(&self.intentional, &self.live, &self.abort);
    }
}

fn stop(intentional: &AtomicBool, live: &AtomicBool, abort: &AbortHandle) {
    // Must precede abort so the reader never reports the teardown
    intentional.store(true, Ordering::SeqCst);
    live.store(false, Ordering::SeqCst);
    abort.abort();
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Decide how a frame is delivered; `None` for heartbeats
#[must_use]
pub fn classify(frame: &Frame, delivered_any: bool) -> Option<SnapshotKind> {
    match frame.kind() {
        FrameKind::Heartbeat => None,
        FrameKind::Availability => Some(SnapshotKind::Initial),
        FrameKind::AvailabilityUpdate => Some(SnapshotKind::Update),
        // Untyped: first paint until this connection has delivered something
        FrameKind::Unspecified if delivered_any => Some(SnapshotKind::Update),
        FrameKind::Unspecified => Some(SnapshotKind::Initial),
    }
}

struct Emitter {
    connection_id: u64,
    events: mpsc::Sender<ConnectionMessage>,
    intentional: Arc<AtomicBool>,
}

impl Emitter {
    /// Returns `false` once the owner is gone or closed the connection
    async fn emit(&self, event: ConnectionEvent) -> bool {
        if self.intentional.load(Ordering::SeqCst) {
            return false;
        }
        self.events
            .send(ConnectionMessage {
                connection_id: self.connection_id,
                event,
            })
            .await
            .is_ok()
    }
}

struct Reader {
    emitter: Emitter,
    key: SubscriptionKey,
    live: Arc<AtomicBool>,
}

impl Reader {
    async fn run(self, token: TokenSource, timeout: Duration, transport: Arc<dyn StreamTransport>) {
        // One lifetime budget covers the request and the body
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let opened = tokio::select! {
            () = &mut deadline => None,
            result = async {
                let request = StreamRequest {
                    key: self.key.clone(),
                    access_token: token.resolve().await,
                    timeout,
                };
                transport.open(&request).await
            } => Some(result),
        };

        let end = match opened {
            None => {
                tracing::warn!(
                    key = %self.key,
                    connection_id = self.emitter.connection_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "No stream response before the connection deadline"
                );
                ConnectionEnd::Failed(StreamError::ConnectionFailed(format!(
                    "no response within {}ms",
                    timeout.as_millis()
                )))
            }
            Some(Ok(response)) if response.status == 401 => ConnectionEnd::Unauthorized,
            Some(Ok(response)) if !response.is_success() => {
                ConnectionEnd::Failed(StreamError::from_status(response.status))
            }
            Some(Ok(response)) => {
                self.live.store(true, Ordering::SeqCst);
                tracing::info!(key = %self.key, connection_id = self.emitter.connection_id, "Availability stream connected");
                let end = if self.emitter.emit(ConnectionEvent::Opened).await {
                    self.read_body(response.body, deadline.as_mut()).await
                } else {
                    ConnectionEnd::Completed
                };
                self.live.store(false, Ordering::SeqCst);
                end
            }
            Some(Err(StreamError::Unauthorized)) => ConnectionEnd::Unauthorized,
            Some(Err(e)) => ConnectionEnd::Failed(e),
        };

        tracing::debug!(key = %self.key, connection_id = self.emitter.connection_id, end = ?end, "Stream connection ended");
        self.emitter.emit(ConnectionEvent::Ended(end)).await;
    }

    async fn read_body(&self, mut body: BodyStream, mut deadline: Pin<&mut Sleep>) -> ConnectionEnd {
        let mut decoder = FrameDecoder::new();
        let mut delivered_any = false;

        loop {
            tokio::select! {
                () = &mut deadline => return ConnectionEnd::TimedOut,
                chunk = body.next() => match chunk {
                    Some(Ok(bytes)) => {
                        decoder.push_bytes(&bytes);
                        let frames = match decoder.decode() {
                            Ok(frames) => frames,
                            Err(e) => return ConnectionEnd::Failed(e),
                        };
                        for frame in frames {
                            let Some(event) = self.frame_event(&frame, &mut delivered_any) else {
                                continue;
                            };
                            if !self.emitter.emit(event).await {
                                return ConnectionEnd::Completed;
                            }
                        }
                    }
                    Some(Err(e)) => return ConnectionEnd::Failed(e),
                    None => return ConnectionEnd::Completed,
                },
            }
        }
    }

    fn frame_event(&self, frame: &Frame, delivered_any: &mut bool) -> Option<ConnectionEvent> {
        let Some(kind) = classify(frame, *delivered_any) else {
            tracing::trace!(key = %self.key, "Heartbeat");
            return None;
        };

        match AvailabilitySnapshot::from_json(&frame.data) {
            Ok(snapshot) => {
                *delivered_any = true;
                Some(ConnectionEvent::Snapshot { kind, snapshot })
            }
            Err(e) => {
                tracing::warn!(
                    key = %self.key,
                    event = %frame.event_type,
                    error = %e,
                    "Dropping malformed availability frame"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;

    use crate::auth::StaticTokenStore;
    use crate::models::TimeSlot;
    use crate::transport::StreamResponse;

    enum Reply {
        Status(u16),
        Body(Vec<&'static str>),
        Forever,
        NoResponse,
    }

    struct ScriptedTransport {
        reply: Mutex<Option<Reply>>,
        tokens: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedTransport {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply: Mutex::new(Some(reply)),
                tokens: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl StreamTransport for ScriptedTransport {
        async fn open(&self, request: &StreamRequest) -> Result<StreamResponse, StreamError> {
            self.tokens.lock().unwrap().push(request.access_token.clone());
            let reply = self.reply.lock().unwrap().take();
            match reply {
                Some(Reply::Status(status)) => Ok(StreamResponse {
                    status,
                    body: futures::stream::empty().boxed(),
                }),
                Some(Reply::Body(chunks)) => Ok(StreamResponse {
                    status: 200,
                    body: futures::stream::iter(
                        chunks.into_iter().map(|c| Ok(Bytes::from_static(c.as_bytes()))),
                    )
                    .boxed(),
                }),
                Some(Reply::Forever) => Ok(StreamResponse {
                    status: 200,
                    body: futures::stream::pending().boxed(),
                }),
                Some(Reply::NoResponse) => std::future::pending().await,
                None => Err(StreamError::ConnectionFailed("no reply".to_string())),
            }
        }

        async fn unsubscribe(&self, _key: &SubscriptionKey) -> Result<(), StreamError> {
            Ok(())
        }
    }

    fn key() -> SubscriptionKey {
        SubscriptionKey::parse(42, "2025-06-01", 4).unwrap()
    }

    fn open(
        transport: Arc<ScriptedTransport>,
        token: TokenSource,
        timeout: Duration,
    ) -> (StreamConnection, mpsc::Receiver<ConnectionMessage>) {
        let (tx, rx) = mpsc::channel(16);
        let connection = StreamConnection::open(ConnectionParams {
            id: 7,
            key: key(),
            token,
            timeout,
            transport,
            events: tx,
        });
        (connection, rx)
    }

    fn anonymous() -> TokenSource {
        TokenSource::Store(Arc::new(StaticTokenStore::anonymous()))
    }

    async fn collect(rx: &mut mpsc::Receiver<ConnectionMessage>) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();
        while let Some(message) = rx.recv().await {
            assert_eq!(message.connection_id, 7);
            let ended = matches!(message.event, ConnectionEvent::Ended(_));
            events.push(message.event);
            if ended {
                break;
            }
        }
        events
    }

    #[test]
    fn test_classify() {
        let heartbeat = Frame::new("heartbeat", "{\"slots\":[]}");
        let initial = Frame::new("availability", "{}");
        let update = Frame::new("availability-update", "{}");
        let bare = Frame::new("", "{}");

        assert_eq!(classify(&heartbeat, false), None);
        assert_eq!(classify(&initial, true), Some(SnapshotKind::Initial));
        assert_eq!(classify(&update, true), Some(SnapshotKind::Update));
        assert_eq!(classify(&update, false), Some(SnapshotKind::Update));
        assert_eq!(classify(&bare, false), Some(SnapshotKind::Initial));
        assert_eq!(classify(&bare, true), Some(SnapshotKind::Update));
    }

    #[tokio::test]
    async fn test_stream_dispatches_frames_in_order() {
        let transport = ScriptedTransport::new(Reply::Body(vec![
            "event: availability\ndata: {\"slots\":[{\"time\":\"19:00\",\"isAvailable\":true}]}\n\n",
            "event: heartbeat\ndata: {\"slots\":[]}\n\n",
            "event: availability-update\ndata: {broken\n\n",
            "event: availability-update\ndata: {\"slots\":[{\"time\":",
            "\"19:00\",\"isAvailable\":false}]}\n\n",
        ]));

        let (_connection, mut rx) = open(transport, anonymous(), Duration::from_secs(60));
        let events = collect(&mut rx).await;

        assert_eq!(
            events,
            vec![
                ConnectionEvent::Opened,
                ConnectionEvent::Snapshot {
                    kind: SnapshotKind::Initial,
                    snapshot: AvailabilitySnapshot::new(vec![TimeSlot::new("19:00", true)]),
                },
                ConnectionEvent::Snapshot {
                    kind: SnapshotKind::Update,
                    snapshot: AvailabilitySnapshot::new(vec![TimeSlot::new("19:00", false)]),
                },
                ConnectionEvent::Ended(ConnectionEnd::Completed),
            ]
        );
    }

    #[tokio::test]
    async fn test_unauthorized_status() {
        let transport = ScriptedTransport::new(Reply::Status(401));
        let (_connection, mut rx) = open(transport, anonymous(), Duration::from_secs(60));
        assert_eq!(
            collect(&mut rx).await,
            vec![ConnectionEvent::Ended(ConnectionEnd::Unauthorized)]
        );
    }

    #[tokio::test]
    async fn test_error_status() {
        let transport = ScriptedTransport::new(Reply::Status(503));
        let (connection, mut rx) = open(transport, anonymous(), Duration::from_secs(60));
        let events = collect(&mut rx).await;
        assert_eq!(
            events,
            vec![ConnectionEvent::Ended(ConnectionEnd::Failed(
                StreamError::from_status(503)
            ))]
        );
        assert!(!connection.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_normal_end() {
        let transport = ScriptedTransport::new(Reply::Forever);
        let (_connection, mut rx) = open(transport, anonymous(), Duration::from_secs(3600));
        assert_eq!(
            collect(&mut rx).await,
            vec![
                ConnectionEvent::Opened,
                ConnectionEvent::Ended(ConnectionEnd::TimedOut)
            ]
        );
    }

    #[tokio::test]
    async fn test_refreshed_token_is_sent() {
        let transport = ScriptedTransport::new(Reply::Status(204));
        let (_connection, mut rx) = open(
            Arc::clone(&transport),
            TokenSource::Refreshed("fresh".to_string()),
            Duration::from_secs(60),
        );
        collect(&mut rx).await;
        assert_eq!(
            *transport.tokens.lock().unwrap(),
            vec![Some("fresh".to_string())]
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_silent() {
        let transport = ScriptedTransport::new(Reply::Forever);
        let (mut connection, mut rx) = open(transport, anonymous(), Duration::from_secs(3600));

        // Wait until the stream is live
        let first = rx.recv().await.unwrap();
        assert_eq!(first.event, ConnectionEvent::Opened);
        assert!(connection.is_live());

        connection.close();
        connection.close();
        assert!(!connection.is_live());

        // Reader aborted without reporting an end; channel closes
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_open_fails_at_deadline() {
        let transport = ScriptedTransport::new(Reply::NoResponse);
        let (connection, mut rx) = open(transport, anonymous(), Duration::from_secs(60));

        let start = tokio::time::Instant::now();
        let events = collect(&mut rx).await;
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert!(start.elapsed() < Duration::from_secs(61));

        assert!(matches!(
            events.as_slice(),
            [ConnectionEvent::Ended(ConnectionEnd::Failed(StreamError::ConnectionFailed(_)))]
        ));
        assert!(!connection.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifetime_includes_time_to_open() {
        struct SlowOpen;

        #[async_trait]
        impl StreamTransport for SlowOpen {
            async fn open(&self, _request: &StreamRequest) -> Result<StreamResponse, StreamError> {
                tokio::time::sleep(Duration::from_secs(40)).await;
                Ok(StreamResponse {
                    status: 200,
                    body: futures::stream::pending().boxed(),
                })
            }

            async fn unsubscribe(&self, _key: &SubscriptionKey) -> Result<(), StreamError> {
                Ok(())
            }
        }

        let (tx, mut rx) = mpsc::channel(16);
        let _connection = StreamConnection::open(ConnectionParams {
            id: 7,
            key: key(),
            token: anonymous(),
            timeout: Duration::from_secs(60),
            transport: Arc::new(SlowOpen),
            events: tx,
        });

        let start = tokio::time::Instant::now();
        assert_eq!(
            collect(&mut rx).await,
            vec![
                ConnectionEvent::Opened,
                ConnectionEvent::Ended(ConnectionEnd::TimedOut)
            ]
        );
        assert!(start.elapsed() < Duration::from_secs(61));
    }

    #[tokio::test]
    async fn test_closer_stops_reader_from_outside() {
        let transport = ScriptedTransport::new(Reply::Forever);
        let (mut connection, mut rx) = open(transport, anonymous(), Duration::from_secs(3600));
        assert_eq!(rx.recv().await.unwrap().event, ConnectionEvent::Opened);

        let closer = connection.closer().unwrap();
        assert_eq!(closer.id(), 7);
        closer.close();
        assert!(!connection.is_live());
        assert_eq!(rx.recv().await, None);

        // The owner closing afterwards is a no-op, and no closer is handed out
        closer.close();
        connection.close();
        assert!(connection.closer().is_none());
    }
}
