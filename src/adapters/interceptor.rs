//! Request body interception.
//!
//! The body is read once into an owned buffer so that the engine's
//! matchers and the upstream forwarder see identical bytes. On read
//! failure the engine evaluates body-phase rules against an empty string
//! and the fault is carried into the event metadata.

use std::time::Duration;

use axum::body::{Body as AxumBody, Bytes};
use http_body_util::{BodyExt, Limited};
use tokio::time::timeout;

/// Result of buffering one request body.
#[derive(Debug, Clone)]
pub struct InterceptedBody {
    /// The buffered bytes; empty when the body was absent or unreadable.
    pub bytes: Bytes,
    /// Set when the body could not be buffered.
    pub fault: Option<String>,
}

impl InterceptedBody {
    fn ok(bytes: Bytes) -> Self {
        Self { bytes, fault: None }
    }

    fn unavailable(reason: String) -> Self {
        Self {
            bytes: Bytes::new(),
            fault: Some(reason),
        }
    }
}

/// Buffers request bodies with a size cap and the configured read timeout.
#[derive(Debug, Clone)]
pub struct RequestInterceptor {
    max_body_bytes: usize,
    read_timeout: Duration,
}

impl RequestInterceptor {
    pub fn new(max_body_bytes: usize, read_timeout: Duration) -> Self {
        Self {
            max_body_bytes,
            read_timeout,
        }
    }

    /// Read the whole body into one owned buffer. An over-cap or broken
    /// body reports a fault instead of failing the request.
    pub async fn intercept(&self, body: AxumBody) -> InterceptedBody {
        let limited = Limited::new(body, self.max_body_bytes);

        match timeout(self.read_timeout, limited.collect()).await {
            Ok(Ok(collected)) => InterceptedBody::ok(collected.to_bytes()),
            Ok(Err(e)) => InterceptedBody::unavailable(format!("body unavailable: {e}")),
            Err(_) => InterceptedBody::unavailable(format!(
                "body unavailable: read timed out after {}s",
                self.read_timeout.as_secs()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interceptor() -> RequestInterceptor {
        RequestInterceptor::new(1024, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn buffers_the_whole_body() {
        let body = AxumBody::from("hello world");
        let intercepted = interceptor().intercept(body).await;
        assert_eq!(&intercepted.bytes[..], b"hello world");
        assert!(intercepted.fault.is_none());
    }

    #[tokio::test]
    async fn empty_body_yields_empty_buffer() {
        let intercepted = interceptor().intercept(AxumBody::empty()).await;
        assert!(intercepted.bytes.is_empty());
        assert!(intercepted.fault.is_none());
    }

    #[tokio::test]
    async fn oversized_body_reports_a_fault() {
        let body = AxumBody::from(vec![b'x'; 4096]);
        let intercepted = interceptor().intercept(body).await;
        assert!(intercepted.bytes.is_empty());
        assert!(
            intercepted
                .fault
                .as_deref()
                .is_some_and(|f| f.starts_with("body unavailable"))
        );
    }
}
