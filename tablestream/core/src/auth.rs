//! Authentication Recovery
//!
//! The stream may be opened anonymously or with a bearer token. When the
//! server rejects the token (HTTP 401) the subscription does not go through
//! the generic reconnection policy. Instead it:
//!
//! 1. asks the [`TokenStore`] for exactly one refresh,
//! 2. reopens the stream with the new token (not counted as a retry),
//! 3. on any failure of 1 or 2, expires the session and forces logout.
//!
//! [`AuthRecovery`] tracks where a subscription is in that sequence so a
//! second 401 can never trigger a second refresh.

use async_trait::async_trait;
use parking_lot::RwLock;

/// Credential storage owned by the host application
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Current access token, if signed in
    async fn access_token(&self) -> Option<String>;

    /// Exchange the refresh credential for a new access token
    ///
    /// On success the store keeps the new token, so later
    /// [`access_token`](Self::access_token) calls (REST fetches included)
    /// return it. Returns `None` when refresh is impossible or was rejected.
    async fn refresh_access_token(&self) -> Option<String>;

    /// Clear credentials and send the user back to sign-in
    async fn force_logout(&self);
}

/// Token store holding a fixed token with no refresh capability
///
/// Suits command-line use where the token comes from a flag or environment.
#[derive(Debug, Default)]
pub struct StaticTokenStore {
    token: RwLock<Option<String>>,
}

impl StaticTokenStore {
    /// Create with an optional token
    #[must_use]
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token),
        }
    }

    /// Anonymous store
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Whether a token is currently held
    #[must_use]
    pub fn is_signed_in(&self) -> bool {
        self.token.read().is_some()
    }
}

#[async_trait]
impl TokenStore for StaticTokenStore {
    async fn access_token(&self) -> Option<String> {
        self.token.read().clone()
    }

    async fn refresh_access_token(&self) -> Option<String> {
        None
    }

    async fn force_logout(&self) {
        self.token.write().take();
        tracing::info!("Stored access token cleared");
    }
}

/// Progress through a single 401 recovery
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RecoveryPhase {
    /// No recovery running
    #[default]
    Idle,
    /// Waiting for the token store to refresh
    Refreshing,
    /// Reopened with the new token, waiting for it to be accepted
    Reconnecting,
}

/// Per-subscription auth recovery state
#[derive(Clone, Debug, Default)]
pub struct AuthRecovery {
    phase: RecoveryPhase,
    refreshes: u32,
}

impl AuthRecovery {
    /// Create idle
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> RecoveryPhase {
        self.phase
    }

    /// Total refreshes attempted over the subscription's lifetime
    #[must_use]
    pub fn refreshes(&self) -> u32 {
        self.refreshes
    }

    /// Handle a 401; returns `true` if a refresh should be attempted
    ///
    /// Returns `false` when a recovery is already underway, meaning the
    /// refreshed token was rejected too and the session is over.
    pub fn begin(&mut self) -> bool {
        if self.phase == RecoveryPhase::Idle {
            self.phase = RecoveryPhase::Refreshing;
            self.refreshes += 1;
            true
        } else {
            false
        }
    }

    /// The token store produced a new token
    pub fn refreshed(&mut self) {
        self.phase = RecoveryPhase::Reconnecting;
    }

    /// The stream accepted the token; recovery is complete
    pub fn connected(&mut self) {
        self.phase = RecoveryPhase::Idle;
    }

    /// Whether the current connection is the post-refresh attempt
    #[must_use]
    pub fn awaiting_reconnect(&self) -> bool {
        self.phase == RecoveryPhase::Reconnecting
    }

    /// Forget any in-flight recovery
    pub fn reset(&mut self) {
        self.phase = RecoveryPhase::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_refresh_per_401() {
        let mut recovery = AuthRecovery::new();
        assert!(recovery.begin());
        assert_eq!(recovery.phase(), RecoveryPhase::Refreshing);

        // A second 401 while refreshing must not start another refresh
        assert!(!recovery.begin());

        recovery.refreshed();
        assert!(recovery.awaiting_reconnect());
        // Refreshed token rejected as well
        assert!(!recovery.begin());
        assert_eq!(recovery.refreshes(), 1);
    }

    #[test]
    fn test_recovery_completes_on_connect() {
        let mut recovery = AuthRecovery::new();
        assert!(recovery.begin());
        recovery.refreshed();
        recovery.connected();
        assert_eq!(recovery.phase(), RecoveryPhase::Idle);

        // A later, unrelated 401 gets its own refresh
        assert!(recovery.begin());
        assert_eq!(recovery.refreshes(), 2);
    }

    #[tokio::test]
    async fn test_static_token_store() {
        let store = StaticTokenStore::new(Some("token-1".to_string()));
        assert_eq!(store.access_token().await.as_deref(), Some("token-1"));
        assert_eq!(store.refresh_access_token().await, None);

        store.force_logout().await;
        assert!(!store.is_signed_in());
        assert_eq!(store.access_token().await, None);
        assert!(!StaticTokenStore::anonymous().is_signed_in());
    }
}
