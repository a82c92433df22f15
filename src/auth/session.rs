// Login, logout and app-start session restore

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Method, Url};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use super::coordinator::RefreshCoordinator;
use super::store::SessionStore;
use super::types::{
    CredentialBundle, Envelope, GoogleLoginRequest, LoginData, LoginRequest, GOOGLE_LOGIN_PATH,
    LOGIN_PATH,
};
use crate::clock::Clock;
use crate::error::{ApiError, Result};
use crate::transport::{endpoint_url, HttpTransport, RequestBody, TransportRequest};

/// Session lifecycle operations used by the login and splash flows
pub struct SessionManager {
    /// Every bundle write goes through the coordinator
    coordinator: Arc<RefreshCoordinator>,
    store: Arc<SessionStore>,
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
    auth_base_url: Url,
    timeout: Duration,
}

impl SessionManager {
    pub fn new(
        coordinator: Arc<RefreshCoordinator>,
        store: Arc<SessionStore>,
        transport: Arc<dyn HttpTransport>,
        clock: Arc<dyn Clock>,
        auth_base_url: Url,
        timeout: Duration,
    ) -> Self {
        Self {
            coordinator,
            store,
            transport,
            clock,
            auth_base_url,
            timeout,
        }
    }

    /// Log in with email/username and password
    pub async fn login(&self, identifier: &str, password: &str) -> Result<CredentialBundle> {
        let request = LoginRequest {
            identifier: identifier.trim(),
            password,
        };
        self.login_at(LOGIN_PATH, &request).await
    }

    /// Log in with a Google ID token
    pub async fn login_with_google(&self, id_token: &str) -> Result<CredentialBundle> {
        self.login_at(GOOGLE_LOGIN_PATH, &GoogleLoginRequest { id_token })
            .await
    }

    /// Drop the session; the first-use marker is kept
    pub async fn logout(&self) {
        self.coordinator.end_session().await;
        tracing::info!("Logged out successfully");
    }

    /// Session to resume on app start; an expired session is logged out
    pub async fn restore(&self) -> Option<CredentialBundle> {
        let bundle = self.store.load().await?;
        bundle.access.as_ref()?;

        if bundle.is_expired(self.clock.now_millis()) {
            tracing::info!("Token expired on app start");
            self.logout().await;
            return None;
        }

        Some(bundle)
    }

    /// Current session without any expiry handling
    pub async fn current(&self) -> Option<CredentialBundle> {
        self.store.load().await
    }

    pub async fn is_first_time_use(&self) -> bool {
        self.store.is_first_time_use().await
    }

    pub async fn mark_first_time_used(&self) {
        self.store.mark_first_time_used().await
    }

    async fn login_at<T: Serialize>(&self, path: &str, payload: &T) -> Result<CredentialBundle> {
        let url = endpoint_url(&self.auth_base_url, path)?;
        let body = serde_json::to_value(payload).map_err(anyhow::Error::from)?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        tracing::debug!(url = %url, "Sending login request");
        let response = self
            .transport
            .send(TransportRequest {
                method: Method::POST,
                url,
                headers,
                body: Some(RequestBody::Json(body)),
                timeout: self.timeout,
            })
            .await?;

        let envelope: Envelope<LoginData> = match serde_json::from_slice(&response.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(status = %response.status, "Login response is not valid JSON: {}", e);
                return Err(ApiError::LoginFailed(format!(
                    "Unexpected response from server ({})",
                    response.status
                )));
            }
        };

        let data = match envelope.data {
            Some(data) if envelope.success && response.status.is_success() => data,
            _ => {
                let reason = envelope
                    .failure_message()
                    .unwrap_or_else(|| "Login failed".to_string());
                tracing::warn!(status = %response.status, "Login rejected: {}", reason);
                return Err(ApiError::LoginFailed(reason));
            }
        };

        let bundle = CredentialBundle::from_login(data, self.clock.now_millis());
        self.coordinator.begin_session(&bundle).await;
        if self.store.is_first_time_use().await {
            self.store.mark_first_time_used().await;
        }

        tracing::info!("Logged in as {}", bundle.username);
        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::types::{AUTH_DATA_KEY, REFRESH_PATH};
    use crate::clock::FixedClock;
    use crate::error::TransportError;
    use crate::storage::{KeyValueStorage, MemoryStorage};
    use crate::transport::{ScriptedTransport, TransportResponse};
    use serde_json::json;

    const NOW: i64 = 1_700_000_000_000;

    fn manager_at(
        base: &str,
        transport: ScriptedTransport,
        clock: Arc<FixedClock>,
    ) -> (SessionManager, Arc<MemoryStorage>, Arc<ScriptedTransport>) {
        let storage = Arc::new(MemoryStorage::new());
        let store = Arc::new(SessionStore::new(storage.clone()));
        let transport = Arc::new(transport);
        let base = Url::parse(base).unwrap();
        let coordinator = Arc::new(
            RefreshCoordinator::new(
                store.clone(),
                transport.clone(),
                clock.clone(),
                &base,
                Duration::from_secs(5),
            )
            .unwrap(),
        );
        let manager = SessionManager::new(
            coordinator,
            store,
            transport.clone(),
            clock,
            base,
            Duration::from_secs(5),
        );
        (manager, storage, transport)
    }

    fn manager_with(
        transport: ScriptedTransport,
        clock: Arc<FixedClock>,
    ) -> (SessionManager, Arc<MemoryStorage>, Arc<ScriptedTransport>) {
        manager_at("http://auth.test", transport, clock)
    }

    fn login_response() -> std::result::Result<TransportResponse, TransportError> {
        Ok(TransportResponse::json(
            200,
            &json!({
                "success": true,
                "data": {
                    "token": "access-1",
                    "refreshToken": "refresh-1",
                    "expiresIn": 3600,
                    "user": {"id": "u-1", "username": "thu", "email": "thu@example.com", "role": "admin"}
                }
            }),
        ))
    }

    fn login_ok() -> ScriptedTransport {
        ScriptedTransport::new(|_request| async { login_response() })
    }

    #[tokio::test]
    async fn test_login_persists_bundle_with_expiry() {
        let (manager, storage, transport) = manager_with(login_ok(), Arc::new(FixedClock::new(NOW)));

        let bundle = manager.login("  thu@example.com ", "secret").await.unwrap();

        assert_eq!(bundle.access_token(), Some("access-1"));
        assert_eq!(bundle.expires_at(), Some(NOW + 3600 * 1000));
        assert_eq!(bundle.refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(bundle.user_id, "u-1");
        assert_eq!(bundle.role, "admin");

        let stored: CredentialBundle =
            serde_json::from_str(&storage.peek(AUTH_DATA_KEY).unwrap()).unwrap();
        assert_eq!(stored, bundle);
        assert!(!manager.is_first_time_use().await);

        let calls = transport.calls();
        assert_eq!(calls[0].url.path(), LOGIN_PATH);
        assert_eq!(
            calls[0].body,
            Some(RequestBody::Json(
                json!({"identifier": "thu@example.com", "password": "secret"})
            ))
        );
    }

    #[tokio::test]
    async fn test_google_login_posts_id_token() {
        let (manager, _storage, transport) = manager_with(login_ok(), Arc::new(FixedClock::new(NOW)));

        manager.login_with_google("google-id-token").await.unwrap();

        let calls = transport.calls();
        assert_eq!(calls[0].url.path(), GOOGLE_LOGIN_PATH);
        assert_eq!(
            calls[0].body,
            Some(RequestBody::Json(json!({"idToken": "google-id-token"})))
        );
    }

    #[tokio::test]
    async fn test_login_failure_message_from_error_list() {
        let transport = ScriptedTransport::new(|_request| async {
            Ok(TransportResponse::json(
                400,
                &json!({"success": false, "error": ["Invalid credentials"]}),
            ))
        });
        let (manager, storage, _transport) = manager_with(transport, Arc::new(FixedClock::new(NOW)));

        let err = manager.login("a", "b").await.unwrap_err();
        assert!(matches!(err, ApiError::LoginFailed(msg) if msg == "Invalid credentials"));
        assert_eq!(storage.peek(AUTH_DATA_KEY), None);
    }

    #[tokio::test]
    async fn test_login_failure_defaults_message() {
        let transport = ScriptedTransport::new(|_request| async {
            Ok(TransportResponse::json(200, &json!({"success": false})))
        });
        let (manager, _storage, _transport) = manager_with(transport, Arc::new(FixedClock::new(NOW)));

        let err = manager.login("a", "b").await.unwrap_err();
        assert!(matches!(err, ApiError::LoginFailed(msg) if msg == "Login failed"));
    }

    #[tokio::test]
    async fn test_login_network_error_propagates() {
        let transport = ScriptedTransport::new(|_request| async {
            Err(TransportError::Connect("unreachable".to_string()))
        });
        let (manager, _storage, _transport) = manager_with(transport, Arc::new(FixedClock::new(NOW)));

        let err = manager.login("a", "b").await.unwrap_err();
        assert!(matches!(err, ApiError::Network(TransportError::Connect(_))));
    }

    #[tokio::test]
    async fn test_logout_clears_session() {
        let (manager, storage, _transport) = manager_with(login_ok(), Arc::new(FixedClock::new(NOW)));
        manager.login("thu", "secret").await.unwrap();

        manager.logout().await;

        assert_eq!(manager.current().await, None);
        assert_eq!(storage.peek(AUTH_DATA_KEY), None);
        // First-use marker survives logout
        assert!(!manager.is_first_time_use().await);
    }

    #[tokio::test]
    async fn test_restore_logs_out_expired_session() {
        let clock = Arc::new(FixedClock::new(NOW));
        let (manager, storage, _transport) = manager_with(login_ok(), clock.clone());
        manager.login("thu", "secret").await.unwrap();

        assert!(manager.restore().await.is_some());

        clock.advance(3600 * 1000 + 1);
        assert_eq!(manager.restore().await, None);
        assert_eq!(storage.peek(AUTH_DATA_KEY), None);
    }

    #[tokio::test]
    async fn test_restore_without_token_is_none() {
        let (manager, storage, _transport) = manager_with(login_ok(), Arc::new(FixedClock::new(NOW)));
        storage
            .set_item(AUTH_DATA_KEY, r#"{"username": "thu", "isFirstTimeUse": false}"#)
            .await
            .unwrap();

        assert_eq!(manager.restore().await, None);
        // Identity-only data is left alone
        assert!(storage.peek(AUTH_DATA_KEY).is_some());
    }

    #[tokio::test]
    async fn test_login_uses_base_url_prefix() {
        let (manager, _storage, transport) = manager_at(
            "http://auth.test/backend/",
            login_ok(),
            Arc::new(FixedClock::new(NOW)),
        );

        manager.login("thu", "secret").await.unwrap();
        manager.login_with_google("google-id-token").await.unwrap();

        let calls = transport.calls();
        assert_eq!(calls[0].url.as_str(), "http://auth.test/backend/api/Auth/login");
        assert_eq!(
            calls[1].url.as_str(),
            "http://auth.test/backend/api/Auth/login/google"
        );
    }

    #[tokio::test]
    async fn test_logout_wins_over_refresh_in_flight() {
        let transport = ScriptedTransport::new(|request: TransportRequest| async move {
            if request.url.path() == REFRESH_PATH {
                tokio::time::sleep(Duration::from_millis(100)).await;
                return Ok(TransportResponse::json(
                    200,
                    &json!({"success": true, "data": {"accessToken": "n", "expiresIn": 600}}),
                ));
            }
            login_response()
        });
        let (manager, storage, _transport) =
            manager_with(transport, Arc::new(FixedClock::new(NOW)));
        manager.login("thu", "secret").await.unwrap();

        let refresh = tokio::spawn({
            let coordinator = manager.coordinator.clone();
            async move { coordinator.refresh_or_wait(Some("access-1")).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        manager.logout().await;

        assert!(refresh.await.unwrap().is_err());
        assert_eq!(manager.current().await, None);
        assert_eq!(storage.peek(AUTH_DATA_KEY), None);
    }
}
