use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use http_body_util::BodyExt;
use hyper::{Request, Response, StatusCode, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;

use crate::ports::http_client::{
    HEALTH_CHECK_USER_AGENT, HttpClient, HttpClientError, HttpClientResult,
};

/// HTTP client adapter using Hyper with Rustls.
///
/// Forwarded requests always leave as HTTP/1.1. Health probes use a separate
/// instance built with [`HttpClientAdapter::for_health_checks`], which never keeps
/// connections alive so every probe measures a fresh connect.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
}

impl HttpClientAdapter {
    /// Create a forwarding client whose connects are bounded by `dial_timeout`.
    pub fn new(dial_timeout: Duration) -> Result<Self> {
        Self::build(dial_timeout, true)
    }

    /// Create a client for health probes; connections are not pooled.
    pub fn for_health_checks(probe_timeout: Duration) -> Result<Self> {
        Self::build(probe_timeout, false)
    }

    fn build(connect_timeout: Duration, keep_alive: bool) -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false); // Allow HTTPS URLs
        http_connector.set_connect_timeout(Some(connect_timeout));
        http_connector.set_nodelay(true);

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

        let mut builder = Client::builder(TokioExecutor::new());
        if !keep_alive {
            builder.pool_max_idle_per_host(0);
        }
        let client = builder.build::<_, AxumBody>(https_connector);

        tracing::debug!(
            "Created HTTP client (connect timeout {:?}, keep-alive {})",
            connect_timeout,
            keep_alive
        );
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(
        &self,
        mut req: Request<AxumBody>,
    ) -> HttpClientResult<Response<AxumBody>> {
        // Set Host header if not present
        if !req.headers().contains_key(header::HOST) {
            let authority = req
                .uri()
                .authority()
                .ok_or_else(|| {
                    HttpClientError::InvalidRequest(format!(
                        "Outgoing URI has no host: {}",
                        req.uri()
                    ))
                })?
                .as_str()
                .to_string();
            let value = HeaderValue::from_str(&authority)
                .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;
            req.headers_mut().insert(header::HOST, value);
        }

        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;
        let method = parts.method.clone();
        let uri = parts.uri.clone();

        tracing::debug!("Sending request: {} {}", method, uri);

        match self.client.request(Request::from_parts(parts, body)).await {
            Ok(response) => {
                let (mut parts, hyper_body) = response.into_parts();
                // The body is re-framed by the server side
                parts.headers.remove(header::TRANSFER_ENCODING);
                Ok(Response::from_parts(parts, AxumBody::new(hyper_body)))
            }
            Err(e) => Err(HttpClientError::ConnectionError(format!(
                "Request to {method} {uri} failed: {e}"
            ))),
        }
    }

    async fn probe(&self, url: &str, probe_timeout: Duration) -> HttpClientResult<StatusCode> {
        let request = Request::builder()
            .method("GET")
            .uri(url)
            .version(Version::HTTP_11)
            .header(header::USER_AGENT, HEALTH_CHECK_USER_AGENT)
            .body(AxumBody::empty())
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;

        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| HttpClientError::ConnectionError(e.to_string()))?;
            let status = response.status();
            // Drain the body so the connection is released
            let _ = response.into_body().collect().await;
            Ok(status)
        };

        match timeout(probe_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(HttpClientError::Timeout(probe_timeout)),
        }
    }
}
