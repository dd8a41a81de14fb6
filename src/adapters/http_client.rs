use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;

use crate::ports::http_client::{HttpClient, HttpClientError, HttpClientResult};

/// Upstream HTTP client using Hyper with Rustls (HTTP/1.1 + HTTP/2).
///
/// Responsibilities:
/// * Forces request version to HTTP/1.1 while allowing ALPN to negotiate h2
/// * Sets the Host header from the rewritten origin URI
/// * Bounds the whole forward with the configured timeout
/// * Converts between Hyper body and Axum body types
///
/// This adapter is intentionally minimal; retries and circuit breaking are
/// out of scope for an inline firewall.
pub struct UpstreamClient {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
    timeout: Duration,
}

impl UpstreamClient {
    /// Create a new upstream client with the given forward timeout.
    pub fn new(timeout: Duration) -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false); // Allow HTTPS origins

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();
        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("Failed to add native certificate to rustls RootCertStore");
            }
        }
        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, AxumBody>(https_connector);

        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl HttpClient for UpstreamClient {
    async fn send_request(
        &self,
        mut req: Request<AxumBody>,
    ) -> HttpClientResult<Response<AxumBody>> {
        // Set Host header from the rewritten URI
        let host_header = match req.uri().host() {
            Some(host) => {
                let value = if let Some(port) = req.uri().port() {
                    HeaderValue::from_str(&format!("{host}:{}", port.as_u16()))
                } else {
                    HeaderValue::from_str(host)
                };
                value.map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?
            }
            None => {
                return Err(HttpClientError::InvalidRequest(
                    "outgoing URI has no host".to_string(),
                ));
            }
        };
        req.headers_mut().insert(header::HOST, host_header);

        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;
        let outgoing = Request::from_parts(parts, body);

        let method = outgoing.method().clone();
        let uri = outgoing.uri().clone();
        tracing::debug!(http.method = %method, backend.url = %uri, "forwarding to origin");

        match timeout(self.timeout, self.client.request(outgoing)).await {
            Ok(Ok(response)) => {
                let (mut parts, hyper_body) = response.into_parts();

                // The body is re-framed on the way back to the client.
                parts.headers.remove(header::TRANSFER_ENCODING);

                Ok(Response::from_parts(parts, AxumBody::new(hyper_body)))
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, http.method = %method, backend.url = %uri, "origin request failed");
                Err(HttpClientError::Unavailable(format!(
                    "request to {method} {uri} failed: {e}"
                )))
            }
            Err(_) => {
                tracing::error!(http.method = %method, backend.url = %uri, "origin request timed out");
                Err(HttpClientError::Timeout(self.timeout.as_secs()))
            }
        }
    }
}
