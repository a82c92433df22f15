// API client facade
// One instance per backend; every call runs through the shared authenticated pipeline

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::error::ApiError;
use crate::http_client::{ApiRequest, AuthenticatedHttpClient};
use crate::transport::{endpoint_url, RequestBody, TransportResponse};

/// A backend the client talks to
#[derive(Debug, Clone)]
pub struct BackendTarget {
    pub name: String,
    pub base_url: Url,
    /// Default per-call timeout
    pub timeout: Duration,
}

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Merged over the computed headers
    pub headers: HeaderMap,
    /// Overrides the backend's default timeout
    pub timeout: Option<Duration>,
    pub query: Vec<(String, String)>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

/// Response handed to callers: status plus the parsed (or substituted) body
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    /// 0 when no response was received
    pub status: u16,
    pub ok: bool,
    pub data: Value,
}

impl ApiResponse {
    fn from_transport(response: &TransportResponse) -> Self {
        Self {
            status: response.status.as_u16(),
            ok: response.status.is_success(),
            data: parse_body(response),
        }
    }

    /// Fold a failed call into a value: `{status: 0, ok: false, data: {success: false, message}}`
    pub fn from_result(result: Result<ApiResponse, ApiError>) -> Self {
        match result {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Request failed without response: {}", e);
                Self {
                    status: 0,
                    ok: false,
                    data: json!({"success": false, "message": e.to_string()}),
                }
            }
        }
    }

    /// `data.success` as reported by the backend
    pub fn success(&self) -> bool {
        self.data
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn message(&self) -> Option<&str> {
        self.data.get("message").and_then(Value::as_str)
    }

    /// Turn a non-2xx response into `ApiError::Status`
    pub fn error_for_status(self) -> Result<Self, ApiError> {
        if self.ok {
            return Ok(self);
        }
        let message = self.message().map(str::to_string).unwrap_or_else(|| {
            StatusCode::from_u16(self.status)
                .ok()
                .and_then(|status| status.canonical_reason())
                .unwrap_or("Request failed")
                .to_string()
        });
        Err(ApiError::Status {
            status: self.status,
            message,
        })
    }
}

/// Parse a response body the way every screen expects it
///
/// JSON content type or a body that looks like JSON is parsed; anything else
/// becomes `{success: false, message, rawText}`. An empty body is `null`.
fn parse_body(response: &TransportResponse) -> Value {
    let text = response.text();
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }

    let declared_json = response
        .content_type()
        .map_or(false, |ct| ct.contains("application/json"));
    let looks_json = trimmed.starts_with('{') || trimmed.starts_with('[');

    if declared_json || looks_json {
        match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Failed to parse JSON: {}", e);
                json!({"success": false, "message": "Invalid JSON response", "rawText": text})
            }
        }
    } else {
        tracing::warn!(
            "Response is not JSON: {}",
            trimmed.chars().take(100).collect::<String>()
        );
        json!({"success": false, "message": "Server returned non-JSON response", "rawText": text})
    }
}

/// Client for one backend
#[derive(Clone)]
pub struct ApiClient {
    target: BackendTarget,
    pipeline: Arc<AuthenticatedHttpClient>,
}

impl ApiClient {
    pub fn new(target: BackendTarget, pipeline: Arc<AuthenticatedHttpClient>) -> Self {
        Self { target, pipeline }
    }

    pub fn target(&self) -> &BackendTarget {
        &self.target
    }

    pub async fn get(&self, path: &str, options: RequestOptions) -> Result<ApiResponse, ApiError> {
        self.request(Method::GET, path, None, options).await
    }

    pub async fn post(
        &self,
        path: &str,
        body: impl Into<RequestBody>,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        self.request(Method::POST, path, Some(body.into()), options)
            .await
    }

    pub async fn put(
        &self,
        path: &str,
        body: impl Into<RequestBody>,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        self.request(Method::PUT, path, Some(body.into()), options)
            .await
    }

    pub async fn delete(&self, path: &str, options: RequestOptions) -> Result<ApiResponse, ApiError> {
        self.request(Method::DELETE, path, None, options).await
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<RequestBody>,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        let request = ApiRequest {
            method,
            url: self.url_for(path, &options.query)?,
            body,
            headers: options.headers,
            timeout: options.timeout.unwrap_or(self.target.timeout),
        };

        let response = self.pipeline.execute(&request).await?;
        Ok(ApiResponse::from_transport(&response))
    }

    /// Like `request`, but failures come back as a status-0 response
    pub async fn request_envelope(
        &self,
        method: Method,
        path: &str,
        body: Option<RequestBody>,
        options: RequestOptions,
    ) -> ApiResponse {
        ApiResponse::from_result(self.request(method, path, body, options).await)
    }

    /// Base URL and path are concatenated, so a base with a path prefix keeps it
    fn url_for(&self, path: &str, query: &[(String, String)]) -> Result<Url, ApiError> {
        let mut url = endpoint_url(&self.target.base_url, path)?;

        if !query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        Ok(url)
    }
}
