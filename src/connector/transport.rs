//! # Upstream Transport
//!
//! The socket-level half of the connector. [`HttpConnector`](super::HttpConnector)
//! owns auth checks, URL and header composition and the streaming state
//! machine; a transport only has to carry one request and hand back the
//! response head plus a body stream.

use crate::core::error::{GatewayError, GatewayResult};
use async_trait::async_trait;
use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;
use url::Url;

/// TLS settings for upstream connections
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    /// Extra CA certificate (PEM) trusted for upstream servers
    pub trusted_ca_file: Option<PathBuf>,

    /// Client certificate (PEM) presented for mutual TLS
    pub client_certificate_file: Option<PathBuf>,

    /// Private key (PKCS#8 PEM) matching the client certificate
    pub client_key_file: Option<PathBuf>,

    /// Skip hostname verification
    pub allow_any_host: bool,

    /// Accept any server certificate
    pub trust_all: bool,
}

/// One outbound request
pub struct UpstreamRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub tls: TlsOptions,

    /// Request body chunks; the body ends when every sender is dropped
    pub body: mpsc::Receiver<Bytes>,
}

/// Response head and body as produced by the transport
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BoxStream<'static, GatewayResult<Bytes>>,
}

/// Carries requests to backend services
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Send the request and resolve once the response head has arrived
    async fn send(&self, request: UpstreamRequest) -> GatewayResult<UpstreamResponse>;
}

/// Transport backed by reqwest, one pooled client per distinct TLS configuration
pub struct ReqwestTransport {
    clients: DashMap<TlsOptions, reqwest::Client>,
    connect_timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            connect_timeout,
        }
    }

    fn client_for(&self, tls: &TlsOptions) -> GatewayResult<reqwest::Client> {
        if let Some(client) = self.clients.get(tls) {
            return Ok(client.value().clone());
        }

        let client = build_client(tls, self.connect_timeout)?;
        self.clients.insert(tls.clone(), client.clone());
        Ok(client)
    }
}

fn read_pem(path: &Path) -> GatewayResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| GatewayError::config(format!("Failed to read {}: {}", path.display(), e)))
}

fn build_client(tls: &TlsOptions, connect_timeout: Duration) -> GatewayResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .redirect(reqwest::redirect::Policy::none())
        .danger_accept_invalid_certs(tls.trust_all)
        .danger_accept_invalid_hostnames(tls.allow_any_host);

    if let Some(ca) = &tls.trusted_ca_file {
        let certificate = reqwest::Certificate::from_pem(&read_pem(ca)?)
            .map_err(|e| GatewayError::config(format!("Invalid trusted CA {}: {}", ca.display(), e)))?;
        builder = builder.add_root_certificate(certificate);
    }

    if let (Some(cert), Some(key)) = (&tls.client_certificate_file, &tls.client_key_file) {
        let identity = reqwest::Identity::from_pkcs8_pem(&read_pem(cert)?, &read_pem(key)?)
            .map_err(|e| GatewayError::config(format!("Invalid client identity {}: {}", cert.display(), e)))?;
        builder = builder.identity(identity);
    }

    debug!(?tls, "Building upstream HTTP client");
    builder
        .build()
        .map_err(|e| GatewayError::config(format!("Failed to build upstream HTTP client: {}", e)))
}

#[async_trait]
impl UpstreamTransport for ReqwestTransport {
    async fn send(&self, request: UpstreamRequest) -> GatewayResult<UpstreamResponse> {
        let client = self.client_for(&request.tls)?;
        let body = reqwest::Body::wrap_stream(ReceiverStream::new(request.body).map(Ok::<Bytes, std::io::Error>));

        let response = client
            .request(request.method, request.url)
            .headers(request.headers)
            .body(body)
            .send()
            .await
            .map_err(|e| GatewayError::connector(format!("Upstream request failed: {}", e)))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| GatewayError::connector(format!("Upstream response body failed: {}", e))))
            .boxed();

        Ok(UpstreamResponse { status, headers, body })
    }
}
