use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode, Url};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{RefreshCoordinator, SessionStore};
use crate::error::ApiError;
use crate::transport::{HttpTransport, RequestBody, TransportRequest, TransportResponse};

/// Immutable description of one logical request; replayed as-is on retry
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: Url,
    pub body: Option<RequestBody>,
    /// Caller headers, applied over the computed defaults
    pub headers: HeaderMap,
    pub timeout: Duration,
}

/// Which send of a logical request this is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Initial,
    /// Re-send after session recovery; never recovered again
    Retry,
}

impl Attempt {
    pub fn number(self) -> u32 {
        match self {
            Attempt::Initial => 1,
            Attempt::Retry => 2,
        }
    }
}

/// HTTP client that attaches the session token and recovers from 401 once
pub struct AuthenticatedHttpClient {
    transport: Arc<dyn HttpTransport>,
    store: Arc<SessionStore>,
    coordinator: Arc<RefreshCoordinator>,
}

impl AuthenticatedHttpClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        store: Arc<SessionStore>,
        coordinator: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            transport,
            store,
            coordinator,
        }
    }

    /// Execute a request with session recovery
    /// - 401 on the first send: refresh (or wait for the running refresh) and re-send once
    /// - 401 on the re-send, any other status: returned to the caller unchanged
    /// - network failure or failed refresh: error
    pub async fn execute(&self, request: &ApiRequest) -> Result<TransportResponse, ApiError> {
        let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let mut token = self.store.access_token().await;
        let mut attempt = Attempt::Initial;

        tracing::debug!(
            request_id = %request_id,
            method = %request.method,
            url = %request.url,
            "Sending HTTP request"
        );

        loop {
            let response = self
                .send_attempt(request, token.as_deref(), attempt, &request_id)
                .await?;

            if response.status != StatusCode::UNAUTHORIZED || attempt == Attempt::Retry {
                if !response.status.is_success() {
                    tracing::warn!(
                        request_id = %request_id,
                        status = %response.status,
                        url = %request.url,
                        attempt = attempt.number(),
                        "Received error response"
                    );
                }
                return Ok(response);
            }

            tracing::warn!(
                request_id = %request_id,
                url = %request.url,
                "Received 401, recovering session and retrying..."
            );

            let fresh = self
                .coordinator
                .refresh_or_wait(token.as_deref())
                .await
                .map_err(|e| {
                    tracing::error!(request_id = %request_id, "Session recovery failed: {}", e);
                    ApiError::RefreshFailed(e)
                })?;

            token = Some(fresh);
            attempt = Attempt::Retry;
        }
    }

    async fn send_attempt(
        &self,
        request: &ApiRequest,
        token: Option<&str>,
        attempt: Attempt,
        request_id: &str,
    ) -> Result<TransportResponse, ApiError> {
        let headers = build_headers(request, token, attempt)?;

        tracing::debug!(
            request_id = %request_id,
            attempt = attempt.number(),
            "Executing request attempt"
        );

        let response = self
            .transport
            .send(TransportRequest {
                method: request.method.clone(),
                url: request.url.clone(),
                headers,
                body: request.body.clone(),
                timeout: request.timeout,
            })
            .await
            .map_err(|e| {
                tracing::error!(
                    request_id = %request_id,
                    error_kind = e.kind(),
                    error = %e,
                    url = %request.url,
                    attempt = attempt.number(),
                    "HTTP request failed"
                );
                ApiError::Network(e)
            })?;

        tracing::debug!(
            request_id = %request_id,
            status = %response.status,
            "Received HTTP response"
        );

        Ok(response)
    }
}

/// Computed headers, then caller overrides; a retry always carries the fresh token
fn build_headers(
    request: &ApiRequest,
    token: Option<&str>,
    attempt: Attempt,
) -> Result<HeaderMap, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    // Binary and multipart bodies get their content type from the transport
    if request.body.as_ref().map_or(true, RequestBody::is_json) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }

    let bearer = token.map(bearer_value).transpose()?;
    if let Some(value) = &bearer {
        headers.insert(AUTHORIZATION, value.clone());
    }

    for (name, value) in request.headers.iter() {
        headers.insert(name.clone(), value.clone());
    }

    if attempt == Attempt::Retry {
        if let Some(value) = bearer {
            headers.insert(AUTHORIZATION, value);
        }
    }

    Ok(headers)
}

fn bearer_value(token: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|_| ApiError::InvalidRequest("access token is not a valid header value".to_string()))
}
