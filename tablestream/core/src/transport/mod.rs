//! Transport Layer
//!
//! Collaborator seams between the streaming core and the network:
//! - [`SnapshotSource`]: plain request/response fetch of the current snapshot
//! - [`StreamTransport`]: long-lived streaming request plus the
//!   fire-and-forget unsubscribe notification
//!
//! [`HttpAvailabilityClient`] implements both against the REST API with
//! `reqwest`. Tests substitute in-memory fakes.

pub mod http;
pub mod traits;

pub use http::HttpAvailabilityClient;
pub use traits::{BodyStream, SnapshotSource, StreamRequest, StreamResponse, StreamTransport};
