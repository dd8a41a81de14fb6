use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Upstream forwarding failure. Every variant surfaces to the client as
/// HTTP 502.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Connection to the origin failed or the response read broke off.
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    /// The forward exceeded the configured timeout.
    #[error("upstream timeout after {0} seconds")]
    Timeout(u64),

    /// The outgoing request could not be constructed.
    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for upstream operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for forwarding requests to the
/// configured origin. The proxy handler depends on this trait so tests
/// can script upstream behaviour without sockets.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send an HTTP request to the origin and return its response with
    /// the body left streaming.
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>>;
}
