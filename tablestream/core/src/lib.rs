//! Tablestream Core - Real-time Table Availability Client
//!
//! This crate turns a server-sent-event feed of restaurant table availability
//! into a continuously updated, reconnecting, authenticated data source, with
//! automatic fallback to polling when streaming is unavailable. It has no UI
//! dependencies; callers observe a subscription through callbacks or a
//! channel.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Caller (UI / CLI)                         │
//! │        subscribe / refresh / unsubscribe      ▲ callbacks        │
//! └───────────────────────┬───────────────────────┼──────────────────┘
//!                         │                       │
//! ┌───────────────────────┼───────────────────────┼──────────────────┐
//! │                  AvailabilityStream (registry by key)            │
//! │  ┌────────────────────┴───────────────────────┴───────────────┐  │
//! │  │             SubscriptionWorker (one task per key)          │  │
//! │  │  ┌────────────┐ ┌───────────┐ ┌──────────┐ ┌────────────┐  │  │
//! │  │  │ Connection │ │ Reconnect │ │   Auth   │ │  Fallback  │  │  │
//! │  │  │ (+ frames) │ │  Policy   │ │ Recovery │ │   Poller   │  │  │
//! │  │  └─────┬──────┘ └───────────┘ └────┬─────┘ └─────┬──────┘  │  │
//! │  └────────┼─────────────────────────────┼─────────────┼────────┘  │
//! └───────────┼─────────────────────────────┼─────────────┼──────────┘
//!             │ StreamTransport             │ TokenStore  │ SnapshotSource
//!             ▼                             ▼             ▼
//!      GET .../subscribe (SSE)       refresh / logout   GET .../availability
//! ```
//!
//! # Key Types
//!
//! - [`AvailabilityStream`]: Entry point; owns the subscription registry
//! - [`Subscription`]: Handle for one key; dropping it unsubscribes
//! - [`AvailabilityCallbacks`]: What the caller implements (or use a channel)
//! - [`AvailabilitySnapshot`]: Full replacement list of time slots
//! - [`HttpAvailabilityClient`]: `reqwest` implementation of the collaborators
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tablestream_core::{
//!     AvailabilityEvent, AvailabilityStream, ClientConfig, HttpAvailabilityClient,
//!     StaticTokenStore, SubscriptionKey,
//! };
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ClientConfig::default();
//!     let tokens = Arc::new(StaticTokenStore::anonymous());
//!     let client = Arc::new(HttpAvailabilityClient::new(config.api, tokens.clone())?);
//!     let stream = AvailabilityStream::with_client(client, tokens, config.stream)?;
//!
//!     let (tx, mut rx) = mpsc::unbounded_channel::<AvailabilityEvent>();
//!     let key = SubscriptionKey::parse(42, "2025-06-01", 4)?;
//!     let subscription = stream.subscribe(key, tx);
//!
//!     while let Some(event) = rx.recv().await {
//!         println!("{event:?}");
//!     }
//!     subscription.unsubscribe();
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`frame`]: Incremental event-stream frame parsing
//! - [`connection`]: One streaming request and its reader task
//! - [`reconnect`]: Exponential backoff with an attempt budget
//! - [`auth`]: Token store seam and 401 recovery state
//! - [`poller`]: Interval re-fetch while no stream is live
//! - [`orchestrator`]: Public facade and subscription registry
//! - [`transport`]: Collaborator traits and the HTTP client
//! - [`config`]: Layered TOML/env configuration

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod callbacks;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod models;
pub mod orchestrator;
pub mod poller;
pub mod reconnect;
pub mod transport;
mod worker;

// Re-exports for convenience
pub use auth::{AuthRecovery, RecoveryPhase, StaticTokenStore, TokenStore};
pub use callbacks::{AvailabilityCallbacks, AvailabilityEvent};
pub use connection::{
    ConnectionCloser, ConnectionEnd, ConnectionEvent, SnapshotKind, StreamConnection,
};
pub use error::{Result, StreamError};
pub use frame::{parse_frames, Frame, FrameDecoder, FrameKind};
pub use models::{
    AvailabilitySnapshot, ConnectionState, SubscriptionKey, SubscriptionStatus, TimeSlot,
};
pub use orchestrator::{AvailabilityStream, Subscription};
pub use poller::FallbackPoller;
pub use reconnect::{PendingRetry, ReconnectPolicy};
pub use transport::{
    HttpAvailabilityClient, SnapshotSource, StreamRequest, StreamResponse, StreamTransport,
};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ApiConfig, ClientConfig,
    ConfigError, ConfigOverrides, ConfigSource, StreamConfig,
};
