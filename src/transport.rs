// HTTP transport seam
// Issues a fully prepared request and reports status, headers and body

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode, Url};
use std::time::Duration;

use crate::error::{ApiError, TransportError};

/// One field of a multipart form
#[derive(Debug, Clone, PartialEq)]
pub enum FormPart {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        file_name: String,
        mime: Option<String>,
        data: Bytes,
    },
}

/// Request payload; replayable so a request can be re-sent after a refresh
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// JSON document, sent as `application/json`
    Json(serde_json::Value),

    /// Opaque bytes; the content type comes from `mime` or is left to the transport
    Binary { data: Bytes, mime: Option<String> },

    /// Multipart form (file uploads); the transport picks the boundary
    Multipart(Vec<FormPart>),
}

impl RequestBody {
    /// JSON bodies get an explicit content type; binary and multipart bodies do not
    pub fn is_json(&self) -> bool {
        matches!(self, RequestBody::Json(_))
    }
}

impl From<serde_json::Value> for RequestBody {
    fn from(value: serde_json::Value) -> Self {
        RequestBody::Json(value)
    }
}

/// Fully prepared outbound request
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<RequestBody>,
    pub timeout: Duration,
}

/// Response as received from the wire
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TransportResponse {
    /// Build a response with a JSON body
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self::with_content_type(status, "application/json", value.to_string())
    }

    /// Build a response with an arbitrary body and content type
    pub fn with_content_type(status: u16, content_type: &str, body: impl Into<Bytes>) -> Self {
        let mut headers = HeaderMap::new();
        if let Ok(value) = content_type.parse() {
            headers.insert(CONTENT_TYPE, value);
        }
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            headers,
            body: body.into(),
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Append `path` to `base`; a path prefix on the base (`https://host/backend/`) is kept
pub fn endpoint_url(base: &Url, path: &str) -> std::result::Result<Url, ApiError> {
    let joined = format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Url::parse(&joined)
        .map_err(|e| ApiError::InvalidRequest(format!("Invalid path {}: {}", path, e)))
}

/// Anything able to send an HTTP request and hand back the raw response
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// Transport over a pooled reqwest client
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Create a transport with connection pooling
    pub fn new(max_connections: usize, connect_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(max_connections)
            .connect_timeout(connect_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }

    fn build_form(parts: Vec<FormPart>) -> Result<reqwest::multipart::Form, TransportError> {
        let mut form = reqwest::multipart::Form::new();
        for part in parts {
            form = match part {
                FormPart::Text { name, value } => form.text(name, value),
                FormPart::File {
                    name,
                    file_name,
                    mime,
                    data,
                } => {
                    let mut file =
                        reqwest::multipart::Part::bytes(data.to_vec()).file_name(file_name);
                    if let Some(mime) = mime {
                        file = file
                            .mime_str(&mime)
                            .map_err(|e| TransportError::Request(e.to_string()))?;
                    }
                    form.part(name, file)
                }
            };
        }
        Ok(form)
    }

    /// Categorize a reqwest error the same way for send and body reads
    fn classify(error: reqwest::Error, timeout: Duration) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout(timeout)
        } else if error.is_connect() {
            TransportError::Connect(error.to_string())
        } else {
            TransportError::Request(error.to_string())
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let TransportRequest {
            method,
            url,
            headers,
            body,
            timeout,
        } = request;

        let mut builder = self
            .client
            .request(method, url.clone())
            .headers(headers)
            .timeout(timeout);

        builder = match body {
            None => builder,
            Some(RequestBody::Json(value)) => builder.json(&value),
            Some(RequestBody::Binary { data, mime }) => {
                let builder = match mime {
                    Some(mime) => builder.header(CONTENT_TYPE, mime),
                    None => builder,
                };
                builder.body(data)
            }
            Some(RequestBody::Multipart(parts)) => builder.multipart(Self::build_form(parts)?),
        };

        let response = builder.send().await.map_err(|e| {
            let error = Self::classify(e, timeout);
            tracing::warn!(
                error_kind = error.kind(),
                error = %error,
                url = %url,
                "HTTP request error"
            );
            error
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| Self::classify(e, timeout))?;

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use scripted::ScriptedTransport;

#[cfg(any(test, feature = "test-utils"))]
mod scripted {
    use super::*;
    use futures::future::{BoxFuture, FutureExt};
    use std::future::Future;
    use std::sync::{Arc, Mutex};

    type Handler = Arc<
        dyn Fn(TransportRequest) -> BoxFuture<'static, Result<TransportResponse, TransportError>>
            + Send
            + Sync,
    >;

    /// In-process transport answering from a closure and recording every request
    pub struct ScriptedTransport {
        handler: Handler,
        calls: Mutex<Vec<TransportRequest>>,
    }

    impl ScriptedTransport {
        pub fn new<F, Fut>(handler: F) -> Self
        where
            F: Fn(TransportRequest) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Result<TransportResponse, TransportError>> + Send + 'static,
        {
            Self {
                handler: Arc::new(move |request| handler(request).boxed()),
                calls: Mutex::new(Vec::new()),
            }
        }

        /// Every request sent so far, in send order
        pub fn calls(&self) -> Vec<TransportRequest> {
            self.calls
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        }

        /// Number of requests sent to `path`
        pub fn calls_to(&self, path: &str) -> usize {
            self.calls()
                .iter()
                .filter(|request| request.url.path() == path)
                .count()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn send(
            &self,
            request: TransportRequest,
        ) -> Result<TransportResponse, TransportError> {
            self.calls
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(request.clone());
            (self.handler)(request).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_endpoint_url_keeps_base_prefix() {
        let base = Url::parse("https://host.test/backend/").unwrap();
        assert_eq!(
            endpoint_url(&base, "/api/Auth/refresh-token").unwrap().as_str(),
            "https://host.test/backend/api/Auth/refresh-token"
        );

        let bare = Url::parse("https://host.test").unwrap();
        assert_eq!(
            endpoint_url(&bare, "api/exams").unwrap().as_str(),
            "https://host.test/api/exams"
        );
    }

    #[test]
    fn test_body_content_type_policy() {
        assert!(RequestBody::Json(json!({"a": 1})).is_json());
        assert!(!RequestBody::Binary {
            data: Bytes::from_static(b"pdf"),
            mime: None
        }
        .is_json());
        assert!(!RequestBody::Multipart(vec![]).is_json());
    }

    #[test]
    fn test_response_helpers() {
        let response = TransportResponse::json(200, &json!({"success": true}));
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.content_type(), Some("application/json"));
        assert_eq!(response.text(), r#"{"success":true}"#);

        let response = TransportResponse::with_content_type(502, "text/html", "<html>bad</html>");
        assert_eq!(response.status.as_u16(), 502);
        assert_eq!(response.content_type(), Some("text/html"));
    }

    #[test]
    fn test_multipart_form_builds() {
        let form = ReqwestTransport::build_form(vec![
            FormPart::Text {
                name: "title".into(),
                value: "Midterm".into(),
            },
            FormPart::File {
                name: "file".into(),
                file_name: "exam.pdf".into(),
                mime: Some("application/pdf".into()),
                data: Bytes::from_static(b"%PDF-1.4"),
            },
        ]);
        assert!(form.is_ok());

        let bad = ReqwestTransport::build_form(vec![FormPart::File {
            name: "file".into(),
            file_name: "x".into(),
            mime: Some("not a mime".into()),
            data: Bytes::new(),
        }]);
        assert!(matches!(bad, Err(TransportError::Request(_))));
    }

    #[tokio::test]
    async fn test_reqwest_transport_connection_refused() {
        let transport = ReqwestTransport::new(4, Duration::from_secs(2)).unwrap();
        let request = TransportRequest {
            method: Method::GET,
            url: Url::parse("http://127.0.0.1:1/health").unwrap(),
            headers: HeaderMap::new(),
            body: None,
            timeout: Duration::from_secs(2),
        };

        let err = transport.send(request).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Connect(_) | TransportError::Request(_)
        ));
    }

    #[tokio::test]
    async fn test_scripted_transport_records_calls() {
        let transport = ScriptedTransport::new(|_request| async {
            Ok(TransportResponse::json(200, &json!({"success": true})))
        });

        for path in ["/a", "/b", "/a"] {
            let request = TransportRequest {
                method: Method::GET,
                url: Url::parse("http://backend.test").unwrap().join(path).unwrap(),
                headers: HeaderMap::new(),
                body: None,
                timeout: Duration::from_secs(1),
            };
            transport.send(request).await.unwrap();
        }

        assert_eq!(transport.calls().len(), 3);
        assert_eq!(transport.calls_to("/a"), 2);
        assert_eq!(transport.calls_to("/b"), 1);
    }
}
