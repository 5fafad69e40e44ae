//! HTTP Availability Client
//!
//! `reqwest`-backed implementation of both collaborator traits.
//!
//! Snapshot fetches and unsubscribe calls ask the shared [`TokenStore`] for
//! the bearer token on every request, so a refresh or logout performed during
//! auth recovery is seen by polling as well as by the stream.
//!
//! # Endpoints
//!
//! - `GET    /restaurants/{id}/availability?date=&partySize=` - snapshot
//! - `GET    /restaurants/{id}/availability/subscribe?date=&partySize=` - event stream
//! - `DELETE /restaurants/{id}/availability/unsubscribe?date=&partySize=` - release

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION, CACHE_CONTROL};

use super::traits::{SnapshotSource, StreamRequest, StreamResponse, StreamTransport};
use crate::auth::TokenStore;
use crate::config::ApiConfig;
use crate::error::StreamError;
use crate::models::{AvailabilitySnapshot, SubscriptionKey};

/// Header naming the client platform
pub const PLATFORM_HEADER: &str = "X-Client-Platform";
/// Header carrying the client version
pub const APP_VERSION_HEADER: &str = "X-App-Version";
/// Header carrying the API key
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Longest body excerpt kept in an error message
const MAX_ERROR_BODY: usize = 256;

/// REST/SSE client for the availability API
#[derive(Clone)]
pub struct HttpAvailabilityClient {
    /// Endpoint and identity settings
    config: ApiConfig,
    /// Shared HTTP client (no whole-request timeout; streams are unbounded)
    http_client: reqwest::Client,
    /// Source of the bearer token for REST calls
    tokens: Arc<dyn TokenStore>,
}

impl fmt::Debug for HttpAvailabilityClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpAvailabilityClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HttpAvailabilityClient {
    /// Create a client
    ///
    /// # Errors
    ///
    /// Returns `StreamError::ConnectionFailed` if the base URL is unusable or
    /// the TLS backend fails to initialize.
    pub fn new(config: ApiConfig, tokens: Arc<dyn TokenStore>) -> Result<Self, StreamError> {
        config
            .validate()
            .map_err(|e| StreamError::ConnectionFailed(e.to_string()))?;

        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .map_err(|e| StreamError::ConnectionFailed(format!("HTTP client init: {e}")))?;

        Ok(Self {
            config,
            http_client,
            tokens,
        })
    }

    fn availability_url(&self, key: &SubscriptionKey) -> String {
        format!(
            "{}/restaurants/{}/availability",
            self.config.normalized_base_url(),
            key.restaurant_id
        )
    }

    fn subscribe_url(&self, key: &SubscriptionKey) -> String {
        format!("{}/subscribe", self.availability_url(key))
    }

    fn unsubscribe_url(&self, key: &SubscriptionKey) -> String {
        format!("{}/unsubscribe", self.availability_url(key))
    }

    fn key_query(key: &SubscriptionKey) -> [(&'static str, String); 2] {
        [
            ("date", key.date_param()),
            ("partySize", key.party_size.to_string()),
        ]
    }

    /// Identity headers every request carries
    fn apply_headers(
        &self,
        request: reqwest::RequestBuilder,
        access_token: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let request = request
            .header(PLATFORM_HEADER, &self.config.platform)
            .header(APP_VERSION_HEADER, &self.config.app_version)
            .header(API_KEY_HEADER, &self.config.api_key);

        match access_token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }

    /// Identity headers plus whatever token the store holds right now
    async fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let token = self.tokens.access_token().await;
        self.apply_headers(request, token.as_deref())
    }

    fn snapshot_request(&self, key: &SubscriptionKey) -> reqwest::RequestBuilder {
        self.http_client
            .get(self.availability_url(key))
            .query(&Self::key_query(key))
            .header(ACCEPT, "application/json")
            .timeout(self.config.request_timeout())
    }

    fn unsubscribe_request(&self, key: &SubscriptionKey) -> reqwest::RequestBuilder {
        self.http_client
            .delete(self.unsubscribe_url(key))
            .query(&Self::key_query(key))
            .timeout(self.config.request_timeout())
    }

    async fn error_for_status(response: reqwest::Response) -> StreamError {
        let status = response.status().as_u16();
        if status == 401 {
            return StreamError::Unauthorized;
        }
        let body = response.text().await.unwrap_or_default();
        if body.trim().is_empty() {
            StreamError::from_status(status)
        } else {
            let message: String = body.trim().chars().take(MAX_ERROR_BODY).collect();
            StreamError::HttpStatus { status, message }
        }
    }
}

#[async_trait]
impl SnapshotSource for HttpAvailabilityClient {
    async fn get_available_slots(
        &self,
        key: &SubscriptionKey,
    ) -> Result<AvailabilitySnapshot, StreamError> {
        let response = self
            .authorized(self.snapshot_request(key))
            .await
            .send()
            .await
            .map_err(|e| StreamError::FetchFailed(e.to_string()))?;

        if !response.status().is_success() {
            let err = Self::error_for_status(response).await;
            return Err(StreamError::FetchFailed(err.to_string()));
        }

        response
            .json::<AvailabilitySnapshot>()
            .await
            .map_err(|e| StreamError::FetchFailed(format!("invalid snapshot body: {e}")))
    }
}

#[async_trait]
impl StreamTransport for HttpAvailabilityClient {
    async fn open(&self, request: &StreamRequest) -> Result<StreamResponse, StreamError> {
        let builder = self
            .http_client
            .get(self.subscribe_url(&request.key))
            .query(&Self::key_query(&request.key))
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");

        let response = self
            .apply_headers(builder, request.access_token.as_deref())
            .send()
            .await
            .map_err(|e| StreamError::ConnectionFailed(e.to_string()))?;

        let status = response.status().as_u16();
        tracing::debug!(key = %request.key, status, "Stream response headers received");

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| StreamError::ConnectionFailed(e.to_string())))
            .boxed();

        Ok(StreamResponse { status, body })
    }

    async fn unsubscribe(&self, key: &SubscriptionKey) -> Result<(), StreamError> {
        let response = self
            .authorized(self.unsubscribe_request(key))
            .await
            .send()
            .await
            .map_err(|e| StreamError::ConnectionFailed(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::error_for_status(response).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::auth::StaticTokenStore;

    /// Store whose refresh swaps in a new token
    struct RotatingTokens {
        token: parking_lot::Mutex<Option<String>>,
    }

    #[async_trait]
    impl TokenStore for RotatingTokens {
        async fn access_token(&self) -> Option<String> {
            self.token.lock().clone()
        }

        async fn refresh_access_token(&self) -> Option<String> {
            let token = "rotated".to_string();
            *self.token.lock() = Some(token.clone());
            Some(token)
        }

        async fn force_logout(&self) {
            self.token.lock().take();
        }
    }

    fn client_with(base_url: &str, tokens: Arc<dyn TokenStore>) -> HttpAvailabilityClient {
        HttpAvailabilityClient::new(
            ApiConfig {
                base_url: base_url.to_string(),
                api_key: "test-key".to_string(),
                ..Default::default()
            },
            tokens,
        )
        .unwrap()
    }

    fn client(base_url: &str) -> HttpAvailabilityClient {
        client_with(base_url, Arc::new(StaticTokenStore::anonymous()))
    }

    fn bearer(request: &reqwest::Request) -> Option<&str> {
        request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
    }

    #[test]
    fn test_endpoint_urls() {
        let client = client("https://api.example.com/v1/");
        let key = SubscriptionKey::parse(42, "2025-06-01", 4).unwrap();

        assert_eq!(
            client.availability_url(&key),
            "https://api.example.com/v1/restaurants/42/availability"
        );
        assert_eq!(
            client.subscribe_url(&key),
            "https://api.example.com/v1/restaurants/42/availability/subscribe"
        );
        assert_eq!(
            client.unsubscribe_url(&key),
            "https://api.example.com/v1/restaurants/42/availability/unsubscribe"
        );
    }

    #[test]
    fn test_key_query() {
        let key = SubscriptionKey::parse(7, "2025-12-31", 2).unwrap();
        let query = HttpAvailabilityClient::key_query(&key);
        assert_eq!(query[0], ("date", "2025-12-31".to_string()));
        assert_eq!(query[1], ("partySize", "2".to_string()));
    }

    #[test]
    fn test_headers_with_and_without_token() {
        let client = client("https://api.example.com");

        let anonymous = client
            .apply_headers(client.http_client.get("https://api.example.com/x"), None)
            .build()
            .unwrap();
        assert_eq!(anonymous.headers()[API_KEY_HEADER], "test-key");
        assert_eq!(anonymous.headers()[PLATFORM_HEADER], "cli");
        assert!(anonymous.headers().get(AUTHORIZATION).is_none());

        let authed = client
            .apply_headers(
                client.http_client.get("https://api.example.com/x"),
                Some("abc"),
            )
            .build()
            .unwrap();
        assert_eq!(authed.headers()[AUTHORIZATION], "Bearer abc");
    }

    #[test]
    fn test_rejects_non_http_base_url() {
        let result = HttpAvailabilityClient::new(
            ApiConfig {
                base_url: "localhost:8080".to_string(),
                ..Default::default()
            },
            Arc::new(StaticTokenStore::anonymous()),
        );
        assert!(matches!(result, Err(StreamError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_rest_calls_follow_the_token_store() {
        let tokens = Arc::new(RotatingTokens {
            token: parking_lot::Mutex::new(Some("expired".to_string())),
        });
        let client = client_with("https://api.example.com", tokens.clone());
        let key = SubscriptionKey::parse(42, "2025-06-01", 4).unwrap();

        let before = client
            .authorized(client.snapshot_request(&key))
            .await
            .build()
            .unwrap();
        assert_eq!(bearer(&before), Some("Bearer expired"));

        // Auth recovery refreshes through the shared store
        tokens.refresh_access_token().await;
        let after = client
            .authorized(client.snapshot_request(&key))
            .await
            .build()
            .unwrap();
        assert_eq!(bearer(&after), Some("Bearer rotated"));
        assert_eq!(after.url().query(), Some("date=2025-06-01&partySize=4"));

        // Logout stops credentials going out, including on unsubscribe
        tokens.force_logout().await;
        let release = client
            .authorized(client.unsubscribe_request(&key))
            .await
            .build()
            .unwrap();
        assert_eq!(bearer(&release), None);
        assert_eq!(release.method(), reqwest::Method::DELETE);
    }

    #[tokio::test]
    async fn test_open_unreachable_server_fails() {
        // Port 9 (discard) on localhost is closed in test environments
        let client = client("http://127.0.0.1:9");
        let key = SubscriptionKey::parse(1, "2025-06-01", 2).unwrap();
        let request = StreamRequest {
            key,
            access_token: None,
            timeout: Duration::from_secs(1),
        };
        assert!(matches!(
            client.open(&request).await,
            Err(StreamError::ConnectionFailed(_))
        ));
    }
}
