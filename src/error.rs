// Error handling module
// Defines error types surfaced by the session and request layers

use thiserror::Error;

/// Errors from the durable key-value storage backend
#[derive(Error, Debug)]
pub enum StorageError {
    /// SQLite driver error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Backend cannot be reached or is in a broken state
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Blocking storage task panicked or was cancelled
    #[error("Storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Failures reported by the HTTP transport (no usable response received)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),
}

impl TransportError {
    /// Short error category used in log fields
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Timeout(_) => "timeout",
            TransportError::Connect(_) => "connection_failed",
            TransportError::Request(_) => "request_error",
        }
    }
}

/// Outcome of a failed token refresh, fanned out to every waiting request
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RefreshError {
    /// No refresh token is stored, so there is nothing to exchange
    #[error("no refresh token available")]
    NoRefreshToken,

    /// Refresh call did not complete within its timeout
    #[error("refresh request timed out")]
    Timeout,

    /// Refresh call never produced a response
    #[error("refresh request failed: {0}")]
    Transport(String),

    /// Backend answered but refused the refresh token
    #[error("refresh rejected by server: {0}")]
    Rejected(String),

    /// Backend answered with a body we could not understand
    #[error("malformed refresh response: {0}")]
    Malformed(String),

    /// The task driving the refresh was dropped before it settled
    #[error("refresh abandoned before completion")]
    Abandoned,

    /// The session was ended or replaced while the refresh was in flight
    #[error("session ended during refresh")]
    SessionEnded,
}

/// Errors returned to callers of the API client
#[derive(Error, Debug)]
pub enum ApiError {
    /// No response received from the backend
    #[error("Network error: {0}")]
    Network(#[from] TransportError),

    /// A 401 could not be recovered; the caller should force a logout
    #[error("Token refresh failed: {0}")]
    RefreshFailed(#[from] RefreshError),

    /// Error status from the backend (only produced on explicit request)
    #[error("API error: {status} - {message}")]
    Status { status: u16, message: String },

    /// Login endpoint refused the credentials
    #[error("Login failed: {0}")]
    LoginFailed(String),

    /// Request could not be built (bad path, header or URL)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Whether this failure means the session is gone and the user must log in again
    pub fn requires_logout(&self) -> bool {
        // A session that already ended or was replaced is not logged out again
        matches!(self, ApiError::RefreshFailed(e) if *e != RefreshError::SessionEnded)
    }

    /// Whether this failure should be shown to the user as a notification
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            ApiError::RefreshFailed(_) | ApiError::Network(_) | ApiError::LoginFailed(_)
        )
    }
}

/// Result type alias for API operations
pub type Result<T> = std::result::Result<T, ApiError>;
