use anyhow::{Context, Result};
use std::sync::Arc;

use crate::auth::{RefreshCoordinator, SessionManager, SessionStore};
use crate::client::{ApiClient, BackendTarget};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::http_client::AuthenticatedHttpClient;
use crate::storage::{KeyValueStorage, SqliteStorage};
use crate::transport::{HttpTransport, ReqwestTransport};

/// Everything a caller needs, wired once per process
///
/// Both backend clients share the session store, the refresh coordinator and
/// the pipeline, so a 401 from either backend joins the same refresh.
#[derive(Clone)]
pub struct AppState {
    pub session: Arc<SessionManager>,
    pub coordinator: Arc<RefreshCoordinator>,
    /// Primary backend; also serves login and token refresh
    pub primary: ApiClient,
    /// Secondary backend (exam content, uploads)
    pub secondary: ApiClient,
}

impl AppState {
    /// Production wiring: SQLite session file, pooled reqwest transport, system clock
    pub fn from_config(config: &Config) -> Result<Self> {
        let storage = Arc::new(
            SqliteStorage::open(&config.session_db_file)
                .context("Failed to open session database")?,
        );
        let transport = Arc::new(ReqwestTransport::new(
            config.http_max_connections,
            config.http_connect_timeout,
        )?);

        tracing::debug!(
            "Session database: {}",
            config.session_db_file.display()
        );

        Self::new(config, storage, transport, Arc::new(SystemClock))
    }

    pub fn new(
        config: &Config,
        storage: Arc<dyn KeyValueStorage>,
        transport: Arc<dyn HttpTransport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let store = Arc::new(SessionStore::new(storage));

        let coordinator = Arc::new(RefreshCoordinator::new(
            store.clone(),
            transport.clone(),
            clock.clone(),
            &config.primary_api_url,
            config.refresh_timeout,
        )?);

        let pipeline = Arc::new(AuthenticatedHttpClient::new(
            transport.clone(),
            store.clone(),
            coordinator.clone(),
        ));

        let session = Arc::new(SessionManager::new(
            coordinator.clone(),
            store,
            transport,
            clock,
            config.primary_api_url.clone(),
            config.primary_timeout,
        ));

        let primary = ApiClient::new(
            BackendTarget {
                name: "primary".to_string(),
                base_url: config.primary_api_url.clone(),
                timeout: config.primary_timeout,
            },
            pipeline.clone(),
        );
        let secondary = ApiClient::new(
            BackendTarget {
                name: "secondary".to_string(),
                base_url: config.secondary_api_url.clone(),
                timeout: config.secondary_timeout,
            },
            pipeline,
        );

        Ok(Self {
            session,
            coordinator,
            primary,
            secondary,
        })
    }

    pub fn client(&self, secondary: bool) -> &ApiClient {
        if secondary {
            &self.secondary
        } else {
            &self.primary
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::types::REFRESH_PATH;
    use crate::client::RequestOptions;
    use crate::clock::FixedClock;
    use crate::storage::MemoryStorage;
    use crate::transport::{ScriptedTransport, TransportRequest, TransportResponse};
    use reqwest::Url;
    use serde_json::json;
    use std::path::PathBuf;
    use std::time::Duration;

    fn config() -> Config {
        Config {
            primary_api_url: Url::parse("http://auth.test").unwrap(),
            secondary_api_url: Url::parse("http://exam.test").unwrap(),
            primary_timeout: Duration::from_secs(5),
            secondary_timeout: Duration::from_secs(90),
            refresh_timeout: Duration::from_secs(10),
            http_max_connections: 4,
            http_connect_timeout: Duration::from_secs(1),
            session_db_file: PathBuf::from("unused.sqlite3"),
            log_level: "debug".to_string(),
        }
    }

    #[tokio::test]
    async fn test_both_backends_share_one_refresh() {
        let transport = Arc::new(ScriptedTransport::new(|request: TransportRequest| async move {
            if request.url.path() == REFRESH_PATH {
                tokio::time::sleep(Duration::from_millis(30)).await;
                return Ok(TransportResponse::json(
                    200,
                    &json!({"success": true, "data": {"accessToken": "fresh", "expiresIn": 60}}),
                ));
            }
            if request.url.path() == "/api/Auth/login" {
                return Ok(TransportResponse::json(
                    200,
                    &json!({"success": true, "data": {"token": "stale", "refreshToken": "r", "expiresIn": 60, "user": {"id": 1, "username": "thu"}}}),
                ));
            }
            let authorized = request
                .headers
                .get("authorization")
                .map_or(false, |v| v == "Bearer fresh");
            Ok(TransportResponse::json(if authorized { 200 } else { 401 }, &json!({"success": authorized})))
        }));

        let state = AppState::new(
            &config(),
            Arc::new(MemoryStorage::new()),
            transport.clone(),
            Arc::new(FixedClock::new(0)),
        )
        .unwrap();
        state.session.login("thu", "pw").await.unwrap();

        let (a, b) = tokio::join!(
            state.client(false).get("/api/profile", RequestOptions::new()),
            state.client(true).get("/api/exams", RequestOptions::new()),
        );

        assert!(a.unwrap().success());
        assert!(b.unwrap().success());
        assert_eq!(transport.calls_to(REFRESH_PATH), 1);

        let refresh = transport
            .calls()
            .into_iter()
            .find(|c| c.url.path() == REFRESH_PATH)
            .unwrap();
        assert_eq!(refresh.url.host_str(), Some("auth.test"));
        assert!(transport
            .calls()
            .iter()
            .any(|c| c.url.host_str() == Some("exam.test") && c.timeout == Duration::from_secs(90)));
    }
}
