// Exam Session - Library root

pub mod auth;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod http_client;
pub mod state;
pub mod storage;
pub mod transport;

pub use client::{ApiClient, ApiResponse, BackendTarget, RequestOptions};
pub use error::ApiError;
pub use state::AppState;
