// Token refresh network call

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Method, Url};
use std::time::Duration;

use super::types::{Envelope, RefreshData};
use crate::error::{RefreshError, TransportError};
use crate::transport::{HttpTransport, RequestBody, TransportRequest};

/// Exchange `refresh_token` for a new token pair
///
/// The backend takes the bare refresh token as a JSON string body and answers
/// with the usual `{success, data, message}` envelope.
pub async fn request_new_tokens(
    transport: &dyn HttpTransport,
    url: &Url,
    refresh_token: &str,
    timeout: Duration,
) -> Result<RefreshData, RefreshError> {
    tracing::info!("Refreshing access token...");

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    let request = TransportRequest {
        method: Method::POST,
        url: url.clone(),
        headers,
        body: Some(RequestBody::Json(serde_json::Value::String(
            refresh_token.to_string(),
        ))),
        timeout,
    };

    let response = transport.send(request).await.map_err(|e| match e {
        TransportError::Timeout(_) => RefreshError::Timeout,
        other => RefreshError::Transport(other.to_string()),
    })?;

    let status = response.status;
    let body_text = response.text();

    if !status.is_success() {
        tracing::error!(status = %status, body = %body_text, "Token refresh failed");
        return Err(RefreshError::Rejected(format!("{} - {}", status, body_text)));
    }

    let envelope: Envelope<RefreshData> = serde_json::from_str(&body_text).map_err(|e| {
        tracing::error!("Failed to parse refresh response: {}", e);
        RefreshError::Malformed(e.to_string())
    })?;

    if !envelope.success {
        let reason = envelope
            .failure_message()
            .unwrap_or_else(|| "refresh token rejected".to_string());
        tracing::error!("Token refresh refused: {}", reason);
        return Err(RefreshError::Rejected(reason));
    }

    let data = envelope
        .data
        .ok_or_else(|| RefreshError::Malformed("response does not contain data".to_string()))?;

    if data.access_token.is_empty() {
        return Err(RefreshError::Malformed(
            "response does not contain accessToken".to_string(),
        ));
    }

    tracing::info!("Token refreshed, expires in {}s", data.expires_in);

    Ok(data)
}
