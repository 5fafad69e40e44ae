//! Availability Data Model
//!
//! Types shared between the REST snapshot endpoint, the event stream, and
//! callers. Snapshots are immutable values: every delivery is a full
//! replacement of the previous one, never a patch.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};

// ============================================================================
// Subscription Key
// ============================================================================

/// Identifies one availability feed: a restaurant, a day, and a party size
///
/// At most one live connection exists per key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    /// Restaurant identifier
    pub restaurant_id: i64,
    /// Reservation date
    pub date: NaiveDate,
    /// Number of guests (always positive)
    pub party_size: u32,
}

impl SubscriptionKey {
    /// Create a key, rejecting an empty party
    pub fn new(restaurant_id: i64, date: NaiveDate, party_size: u32) -> Result<Self> {
        if party_size == 0 {
            return Err(StreamError::InvalidKey(
                "party size must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            restaurant_id,
            date,
            party_size,
        })
    }

    /// Create a key from an ISO `YYYY-MM-DD` date string
    pub fn parse(restaurant_id: i64, date: &str, party_size: u32) -> Result<Self> {
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map_err(|e| StreamError::InvalidKey(format!("invalid date {date:?}: {e}")))?;
        Self::new(restaurant_id, date, party_size)
    }

    /// The date formatted for query strings
    #[must_use]
    pub fn date_param(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.restaurant_id,
            self.date_param(),
            self.party_size
        )
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// A single bookable time slot
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSlot {
    /// Local time of the slot, e.g. `"19:00"`
    pub time: String,
    /// Whether the slot can be booked for this party size
    pub is_available: bool,
    /// Remaining covers, when the server reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_capacity: Option<u32>,
    /// Slot is outside the standard window and needs advance notice
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_advance_notice: Option<bool>,
}

impl TimeSlot {
    /// Create a slot with only the required fields
    pub fn new(time: impl Into<String>, is_available: bool) -> Self {
        Self {
            time: time.into(),
            is_available,
            available_capacity: None,
            requires_advance_notice: None,
        }
    }

    /// Set remaining capacity
    #[must_use]
    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.available_capacity = Some(capacity);
        self
    }
}

/// Full availability picture for one subscription key
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilitySnapshot {
    /// Slots inside the primary availability window, in display order
    pub slots: Vec<TimeSlot>,
    /// Larger set including slots that need advance notice
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_slots: Option<Vec<TimeSlot>>,
}

impl AvailabilitySnapshot {
    /// Create a snapshot from primary slots only
    #[must_use]
    pub fn new(slots: Vec<TimeSlot>) -> Self {
        Self {
            slots,
            all_slots: None,
        }
    }

    /// Decode a snapshot from a JSON payload
    pub fn from_json(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Slots that can currently be booked
    pub fn available_slots(&self) -> impl Iterator<Item = &TimeSlot> {
        self.slots.iter().filter(|s| s.is_available)
    }

    /// Whether the snapshot has no slots at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty() && self.all_slots.as_ref().map_or(true, Vec::is_empty)
    }
}

// ============================================================================
// Connection State
// ============================================================================

/// Lifecycle of a subscription's live feed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Nothing engaged yet, or torn down
    #[default]
    Idle,
    /// A stream request is in flight
    Connecting,
    /// Response headers accepted; data is live
    Streaming,
    /// The stream ended; a retry or the poller may be active
    Disconnected,
    /// Terminal for streaming; only the poller (if enabled) remains
    Failed,
}

impl ConnectionState {
    /// Whether the most recent data comes from the live feed
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Streaming)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Caller-visible flags for a subscription
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscriptionStatus {
    /// Current connection state
    pub state: ConnectionState,
    /// Whether any snapshot has ever been delivered
    pub has_data: bool,
    /// Whether data is currently arriving over the live stream
    pub is_streaming: bool,
    /// When the last snapshot was delivered
    pub last_updated: Option<DateTime<Utc>>,
    /// Most recent error, cleared by the next successful delivery
    pub last_error: Option<String>,
    /// Retries consumed from the reconnection budget
    pub reconnect_attempts: u32,
}
