use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use http::{Request, Response, StatusCode};
use thiserror::Error;

/// User-Agent sent with every health probe
pub const HEALTH_CHECK_USER_AGENT: &str = "droplet-proxy health checker";

/// Custom error type for HTTP client operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when connection to backend fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when request times out
    #[error("Timeout error after {0:?}")]
    Timeout(Duration),

    /// Error when request is invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for making HTTP requests to backends
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send an HTTP request to a backend server.
    ///
    /// The request URI must be absolute. Responses with error status codes are
    /// returned as `Ok`; only transport failures are errors.
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>>;

    /// Issue a health probe (`GET url`) bounded by `timeout` and return the status code.
    async fn probe(&self, url: &str, timeout: Duration) -> HttpClientResult<StatusCode>;
}
