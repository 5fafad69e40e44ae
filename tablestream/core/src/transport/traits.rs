//! Transport Traits

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::StreamError;
use crate::models::{AvailabilitySnapshot, SubscriptionKey};

/// Incrementally readable response body
pub type BodyStream = BoxStream<'static, Result<Bytes, StreamError>>;

/// Parameters for opening one stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamRequest {
    /// Which feed to open
    pub key: SubscriptionKey,
    /// Bearer token; `None` opens an anonymous (public data) stream
    pub access_token: Option<String>,
    /// Maximum connection lifetime
    pub timeout: Duration,
}

/// Response headers plus the not-yet-read body
pub struct StreamResponse {
    /// HTTP status code
    pub status: u16,
    /// Body chunks as they arrive
    pub body: BodyStream,
}

impl StreamResponse {
    /// Whether the status is 2xx
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl fmt::Debug for StreamResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Fetches the current availability snapshot
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// One request/response round trip
    async fn get_available_slots(
        &self,
        key: &SubscriptionKey,
    ) -> Result<AvailabilitySnapshot, StreamError>;
}

/// Opens streaming requests against the subscribe endpoint
///
/// Implementations must expose the body before the response completes; the
/// feed never completes on its own.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Send the request and return once response headers arrive
    async fn open(&self, request: &StreamRequest) -> Result<StreamResponse, StreamError>;

    /// Tell the server the subscription is gone
    async fn unsubscribe(&self, key: &SubscriptionKey) -> Result<(), StreamError>;
}
