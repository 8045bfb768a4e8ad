//! # HTTP Connector
//!
//! Bridges one gateway request to one backend connection.
//!
//! ## Lifecycle
//! 1. [`HttpConnector::connect`] verifies auth requirements, composes the
//!    upstream URL and headers, and starts the request on a spawned task. It
//!    returns a [`ServiceConnection`] right away.
//! 2. The caller streams the request body through [`ServiceConnection::write`]
//!    and finishes with [`ServiceConnection::end`].
//! 3. When the response head arrives the result handler receives a paused
//!    [`ConnectionResponse`]. No body bytes flow until
//!    [`ConnectionResponse::transmit`] is called.
//! 4. Either side may [`abort`](ServiceConnection::abort) at any point.
//!
//! Failures before the head reach the result handler exactly once. Body
//! failures after the head go to the response's error handler.

use crate::connector::auth::{verify_connection, BasicAuthOptions, RequiredAuthType};
use crate::connector::transport::{TlsOptions, UpstreamRequest, UpstreamResponse, UpstreamTransport};
use crate::core::async_result::AsyncResultHandler;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{Service, ServiceRequest, ServiceResponse};
use axum::http::header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

/// Header carrying the caller's API key
pub const API_KEY_HEADER: &str = "x-api-key";

/// Headers never copied between the gateway and the backend
fn is_suppressed(name: &HeaderName) -> bool {
    *name == TRANSFER_ENCODING || *name == CONTENT_LENGTH || *name == HOST || name.as_str() == API_KEY_HEADER
}

type BodyHandler = Box<dyn FnMut(Bytes) -> BoxFuture<'static, ()> + Send>;
type EndHandler = Box<dyn FnOnce() + Send>;
type ErrorHandler = Box<dyn FnOnce(GatewayError) + Send>;

/// State shared by the request side, the response side and the spawned tasks
struct Shared {
    inbound_finished: AtomicBool,
    outbound_finished: AtomicBool,
    aborted: AtomicBool,
    cancel: CancellationToken,

    /// Outbound body channel; dropping it ends the request body
    outbound: Mutex<Option<mpsc::Sender<Bytes>>>,

    /// Paused response body, taken by `transmit` or `abort`
    inbound: Mutex<Option<BoxStream<'static, GatewayResult<Bytes>>>>,

    handler: AsyncResultHandler<ConnectionResponse>,
}

impl Shared {
    fn abort(&self) {
        if self.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Aborting upstream connection");
        self.cancel.cancel();
        self.outbound.lock().take();
        self.inbound.lock().take();
        self.inbound_finished.store(true, Ordering::SeqCst);
        self.outbound_finished.store(true, Ordering::SeqCst);
        self.handler.fail(GatewayError::connector("Connection aborted"));
    }

    fn is_finished(&self) -> bool {
        self.inbound_finished.load(Ordering::SeqCst) && self.outbound_finished.load(Ordering::SeqCst)
    }
}

/// Factory for upstream connections
#[derive(Clone)]
pub struct HttpConnector {
    transport: Arc<dyn UpstreamTransport>,
    tls: TlsOptions,
    write_buffer_chunks: usize,
}

impl HttpConnector {
    pub fn new(transport: Arc<dyn UpstreamTransport>, tls: TlsOptions, write_buffer_chunks: usize) -> Self {
        Self {
            transport,
            tls,
            write_buffer_chunks: write_buffer_chunks.max(1),
        }
    }

    /// Open a connection to the service's backend for one request
    ///
    /// Verification failures are returned here and also delivered to
    /// `handler`, before any connection attempt. Everything later arrives
    /// through `handler` only.
    pub fn connect(
        &self,
        service: &Service,
        request: &ServiceRequest,
        required_auth: RequiredAuthType,
        handler: AsyncResultHandler<ConnectionResponse>,
    ) -> GatewayResult<ServiceConnection> {
        let (url, headers) = match prepare(service, request, required_auth) {
            Ok(prepared) => prepared,
            Err(e) => {
                debug!(service = %service.coordinates(), error = %e, "Upstream connection rejected before connect");
                handler.fail(e.clone());
                return Err(e);
            }
        };

        let (sender, receiver) = mpsc::channel(self.write_buffer_chunks);
        let shared = Arc::new(Shared {
            inbound_finished: AtomicBool::new(false),
            outbound_finished: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            outbound: Mutex::new(Some(sender)),
            inbound: Mutex::new(None),
            handler,
        });

        debug!(method = %request.method, url = %url, "Connecting to upstream");
        let upstream_request = UpstreamRequest {
            method: request.method.clone(),
            url,
            headers,
            tls: self.tls.clone(),
            body: receiver,
        };

        let transport = self.transport.clone();
        let task_shared = shared.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = task_shared.cancel.cancelled() => return,
                outcome = transport.send(upstream_request) => outcome,
            };

            match outcome {
                Ok(response) => deliver_head(task_shared, response),
                Err(e) => {
                    warn!(error = %e, "Upstream connection failed");
                    task_shared.outbound_finished.store(true, Ordering::SeqCst);
                    task_shared.handler.fail(e);
                }
            }
        });

        Ok(ServiceConnection { shared })
    }
}

fn deliver_head(shared: Arc<Shared>, response: UpstreamResponse) {
    if shared.aborted.load(Ordering::SeqCst) {
        return;
    }

    let mut head = ServiceResponse {
        code: response.status.as_u16(),
        message: response.status.canonical_reason().unwrap_or_default().to_string(),
        ..Default::default()
    };
    for (name, value) in response.headers.iter() {
        if !is_suppressed(name) {
            head.headers.append(name.clone(), value.clone());
        }
    }
    debug!(status = head.code, "Upstream response head received");

    {
        // Checked again under the lock so a concurrent abort cannot miss the body
        let mut inbound = shared.inbound.lock();
        if shared.aborted.load(Ordering::SeqCst) {
            return;
        }
        *inbound = Some(response.body);
    }
    let connection_response = ConnectionResponse {
        head,
        shared: shared.clone(),
        body_handler: None,
        end_handler: None,
        error_handler: None,
        transmitted: false,
    };
    shared.handler.succeed(connection_response);
}

/// Validate the endpoint and build the upstream URL and headers
fn prepare(
    service: &Service,
    request: &ServiceRequest,
    required_auth: RequiredAuthType,
) -> GatewayResult<(Url, HeaderMap)> {
    let endpoint = Url::parse(&service.endpoint)
        .map_err(|e| GatewayError::connector(format!("Invalid endpoint URL '{}': {}", service.endpoint, e)))?;
    let secure = match endpoint.scheme() {
        "https" => true,
        "http" => false,
        other => {
            return Err(GatewayError::connector(format!(
                "Unsupported endpoint scheme '{}' for {}",
                other, service.endpoint
            )))
        }
    };

    let basic = match required_auth {
        RequiredAuthType::Basic => Some(BasicAuthOptions::from_properties(&service.endpoint_properties)?),
        _ => None,
    };
    verify_connection(required_auth, secure, basic.as_ref())?;

    let url = upstream_url(&endpoint, request)?;
    let mut headers = upstream_headers(&endpoint, request)?;
    if let Some(basic) = &basic {
        let value = HeaderValue::from_str(&basic.authorization_header())
            .map_err(|e| GatewayError::connector(format!("Invalid basic auth credentials: {}", e)))?;
        headers.insert(axum::http::header::AUTHORIZATION, value);
    }

    Ok((url, headers))
}

/// Endpoint base path + request destination + encoded query parameters
pub(crate) fn upstream_url(endpoint: &Url, request: &ServiceRequest) -> GatewayResult<Url> {
    let host = endpoint
        .host_str()
        .ok_or_else(|| GatewayError::connector(format!("Endpoint URL '{}' has no host", endpoint)))?;
    let port = endpoint
        .port_or_known_default()
        .unwrap_or(if endpoint.scheme() == "https" { 443 } else { 80 });

    let base_path = endpoint.path().trim_end_matches('/');
    let destination = match request.destination.as_deref() {
        Some(destination) if !destination.is_empty() => destination,
        _ => "/",
    };
    let separator = if destination.starts_with('/') { "" } else { "/" };

    let mut composed = format!(
        "{}://{}:{}{}{}{}",
        endpoint.scheme(),
        host,
        port,
        base_path,
        separator,
        destination
    );

    if !request.query_params.is_empty() {
        let query = request
            .query_params
            .iter()
            .map(|(key, value)| match value {
                Some(value) => format!("{}={}", urlencoding::encode(key), urlencoding::encode(value)),
                None => urlencoding::encode(key).into_owned(),
            })
            .collect::<Vec<_>>()
            .join("&");
        composed.push('?');
        composed.push_str(&query);
    }

    Url::parse(&composed).map_err(|e| GatewayError::connector(format!("Invalid upstream URL '{}': {}", composed, e)))
}

/// Inbound headers minus the suppressed set, plus a `Host` for the backend
pub(crate) fn upstream_headers(endpoint: &Url, request: &ServiceRequest) -> GatewayResult<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(request.headers.len() + 1);
    for (name, value) in request.headers.iter() {
        if !is_suppressed(name) {
            headers.append(name.clone(), value.clone());
        }
    }

    let host = endpoint.host_str().unwrap_or_default();
    let host = match endpoint.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    let value = HeaderValue::from_str(&host)
        .map_err(|e| GatewayError::connector(format!("Invalid upstream host '{}': {}", host, e)))?;
    headers.insert(HOST, value);
    Ok(headers)
}

/// Request side of an upstream connection
pub struct ServiceConnection {
    shared: Arc<Shared>,
}

impl ServiceConnection {
    /// Send one request body chunk, waiting while the upstream is behind
    pub async fn write(&self, chunk: Bytes) -> GatewayResult<()> {
        if self.shared.inbound_finished.load(Ordering::SeqCst) {
            if self.shared.aborted.load(Ordering::SeqCst) {
                return Err(GatewayError::connector("Connection aborted"));
            }
            return Err(GatewayError::invalid_state("Attempted to write to connection after end()"));
        }

        let sender = self.shared.outbound.lock().clone();
        let sender = sender.ok_or_else(|| GatewayError::connector("Connection aborted"))?;
        sender
            .send(chunk)
            .await
            .map_err(|_| GatewayError::connector("Upstream stopped reading the request body"))
    }

    /// Finish the request body
    pub fn end(&self) {
        if !self.shared.inbound_finished.swap(true, Ordering::SeqCst) {
            self.shared.outbound.lock().take();
        }
    }

    /// Cancel the call and close the upstream connection
    pub fn abort(&self) {
        self.shared.abort();
    }

    /// Request fully written and response fully delivered
    pub fn is_finished(&self) -> bool {
        self.shared.is_finished()
    }

    pub fn is_connected(&self) -> bool {
        !self.shared.is_finished()
    }
}

impl Drop for ServiceConnection {
    /// A request body that was never ended can only be closed by aborting
    fn drop(&mut self) {
        if !self.shared.inbound_finished.load(Ordering::SeqCst) {
            debug!("Connection dropped before the request body ended");
            self.shared.abort();
        }
    }
}

/// Response side of an upstream connection, delivered paused
pub struct ConnectionResponse {
    head: ServiceResponse,
    shared: Arc<Shared>,
    body_handler: Option<BodyHandler>,
    end_handler: Option<EndHandler>,
    error_handler: Option<ErrorHandler>,
    transmitted: bool,
}

impl std::fmt::Debug for ConnectionResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionResponse")
            .field("head", &self.head)
            .field("transmitted", &self.transmitted)
            .finish()
    }
}

impl ConnectionResponse {
    /// Status, message and filtered headers from the backend
    pub fn head(&self) -> &ServiceResponse {
        &self.head
    }

    pub fn head_mut(&mut self) -> &mut ServiceResponse {
        &mut self.head
    }

    /// Receive body chunks in order. The next chunk is not pulled until the
    /// returned future completes.
    pub fn body_handler<F, Fut>(&mut self, mut handler: F)
    where
        F: FnMut(Bytes) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.body_handler = Some(Box::new(move |chunk| handler(chunk).boxed()));
    }

    /// Called once after the last body chunk
    pub fn end_handler<F>(&mut self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.end_handler = Some(Box::new(handler));
    }

    /// Called if the body stream fails after the head was delivered
    pub fn error_handler<F>(&mut self, handler: F)
    where
        F: FnOnce(GatewayError) + Send + 'static,
    {
        self.error_handler = Some(Box::new(handler));
    }

    /// Resume the paused body and start delivering it to the handlers
    pub fn transmit(&mut self) {
        if self.transmitted {
            return;
        }
        self.transmitted = true;

        let body = self.shared.inbound.lock().take();
        let Some(mut body) = body else {
            debug!("Transmit on an aborted connection ignored");
            return;
        };

        let shared = self.shared.clone();
        let mut body_handler = self.body_handler.take();
        let end_handler = self.end_handler.take();
        let error_handler = self.error_handler.take();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shared.cancel.cancelled() => {
                        debug!("Response body delivery stopped by abort");
                        return;
                    }
                    next = body.next() => match next {
                        Some(Ok(chunk)) => {
                            if let Some(handler) = body_handler.as_mut() {
                                handler(chunk).await;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "Upstream response body failed");
                            shared.outbound_finished.store(true, Ordering::SeqCst);
                            if let Some(handler) = error_handler {
                                handler(e);
                            }
                            return;
                        }
                        None => {
                            shared.outbound_finished.store(true, Ordering::SeqCst);
                            if let Some(handler) = end_handler {
                                handler();
                            }
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Detach the handlers, then cancel the call and close the upstream connection
    pub fn abort(&mut self) {
        self.body_handler = None;
        self.end_handler = None;
        self.error_handler = None;
        self.shared.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::auth::{AUTHORIZATION_TYPE, BASIC_AUTH_PASSWORD, BASIC_AUTH_REQUIRE_SSL, BASIC_AUTH_USERNAME};
    use crate::core::async_result::await_result;
    use async_trait::async_trait;
    use axum::http::{Method, StatusCode};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingTransport {
        calls: AtomicUsize,
        headers: Mutex<Option<HeaderMap>>,
        url: Mutex<Option<Url>>,
        hang: bool,
        fail: bool,
        drain: bool,
    }

    fn ok_response() -> UpstreamResponse {
        let mut headers = HeaderMap::new();
        headers.insert("content-length", HeaderValue::from_static("2"));
        headers.insert("x-upstream", HeaderValue::from_static("yes"));
        let chunks = vec![Ok(Bytes::from_static(b"a")), Ok(Bytes::from_static(b"b"))];
        UpstreamResponse {
            status: StatusCode::OK,
            headers,
            body: futures::stream::iter(chunks).boxed(),
        }
    }

    #[async_trait]
    impl UpstreamTransport for RecordingTransport {
        async fn send(&self, mut request: UpstreamRequest) -> GatewayResult<UpstreamResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.headers.lock() = Some(request.headers.clone());
            *self.url.lock() = Some(request.url.clone());
            if self.hang {
                futures::future::pending::<()>().await;
            }
            if self.fail {
                return Err(GatewayError::connector("connection refused"));
            }
            if self.drain {
                // Like a real backend: no response before the whole body arrived
                while request.body.recv().await.is_some() {}
            }
            Ok(ok_response())
        }
    }

    fn service(endpoint: &str) -> Service {
        Service {
            organization_id: "T".to_string(),
            service_id: "echo".to_string(),
            version: "1.0".to_string(),
            endpoint: endpoint.to_string(),
            ..Default::default()
        }
    }

    fn request() -> ServiceRequest {
        let mut request = ServiceRequest::new("T", "echo", "1.0").with_api_key("12345");
        request.method = Method::POST;
        request.destination = Some("/path/to/resource".to_string());
        request.headers.insert("x-api-key", HeaderValue::from_static("12345"));
        request.headers.insert("host", HeaderValue::from_static("gateway.local"));
        request.headers.insert("content-length", HeaderValue::from_static("10"));
        request.headers.insert("x-custom", HeaderValue::from_static("kept"));
        request
    }

    #[test]
    fn test_upstream_url_composition() {
        let endpoint = Url::parse("http://backend:8080/base/").unwrap();
        let mut req = request();
        req.query_params = vec![
            ("q".to_string(), Some("a b&c".to_string())),
            ("flag".to_string(), None),
        ];
        let url = upstream_url(&endpoint, &req).unwrap();
        assert_eq!(url.as_str(), "http://backend:8080/base/path/to/resource?q=a%20b%26c&flag");

        let endpoint = Url::parse("https://secure.example").unwrap();
        req.destination = None;
        req.query_params.clear();
        let url = upstream_url(&endpoint, &req).unwrap();
        assert_eq!(url.port_or_known_default(), Some(443));
        assert_eq!(url.path(), "/");
    }

    #[test]
    fn test_upstream_headers_suppress_and_set_host() {
        let endpoint = Url::parse("http://backend:8080/").unwrap();
        let headers = upstream_headers(&endpoint, &request()).unwrap();
        assert_eq!(headers.get("host").unwrap(), "backend:8080");
        assert!(headers.get("x-api-key").is_none());
        assert!(headers.get("content-length").is_none());
        assert_eq!(headers.get("x-custom").unwrap(), "kept");

        let endpoint = Url::parse("http://backend/").unwrap();
        let headers = upstream_headers(&endpoint, &request()).unwrap();
        assert_eq!(headers.get("host").unwrap(), "backend");
    }

    #[tokio::test]
    async fn test_mtls_against_plain_http_fails_before_connecting() {
        let transport = Arc::new(RecordingTransport::default());
        let connector = HttpConnector::new(transport.clone(), TlsOptions::default(), 4);
        let (handler, rx) = AsyncResultHandler::channel();

        let result = connector.connect(&service("http://backend/"), &request(), RequiredAuthType::Mtls, handler);
        assert!(matches!(result, Err(GatewayError::Connector { .. })));
        assert!(matches!(await_result(rx).await, Err(GatewayError::Connector { .. })));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_basic_auth_injects_authorization() {
        let transport = Arc::new(RecordingTransport::default());
        let connector = HttpConnector::new(transport.clone(), TlsOptions::default(), 4);

        let mut svc = service("http://backend/");
        svc.endpoint_properties.insert(AUTHORIZATION_TYPE.to_string(), "basic".to_string());
        svc.endpoint_properties.insert(BASIC_AUTH_USERNAME.to_string(), "user".to_string());
        svc.endpoint_properties.insert(BASIC_AUTH_PASSWORD.to_string(), "pass".to_string());

        // requireSSL defaults to true
        let (handler, _rx) = AsyncResultHandler::channel();
        assert!(connector.connect(&svc, &request(), RequiredAuthType::Basic, handler).is_err());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);

        svc.endpoint_properties.insert(BASIC_AUTH_REQUIRE_SSL.to_string(), "false".to_string());
        let (handler, rx) = AsyncResultHandler::channel();
        let connection = connector.connect(&svc, &request(), RequiredAuthType::Basic, handler).unwrap();
        connection.end();
        await_result(rx).await.unwrap();

        let headers = transport.headers.lock().clone().unwrap();
        assert_eq!(headers.get("authorization").unwrap(), "Basic dXNlcjpwYXNz");
    }

    #[tokio::test]
    async fn test_body_flows_only_after_transmit() {
        let transport = Arc::new(RecordingTransport::default());
        let connector = HttpConnector::new(transport.clone(), TlsOptions::default(), 4);
        let (handler, rx) = AsyncResultHandler::channel();
        let connection = connector
            .connect(&service("http://backend/"), &request(), RequiredAuthType::Default, handler)
            .unwrap();
        connection.end();

        let mut response = await_result(rx).await.unwrap();
        assert_eq!(response.head().code, 200);
        assert_eq!(response.head().message, "OK");
        assert!(response.head().header("content-length").is_none());
        assert_eq!(response.head().header("x-upstream"), Some("yes"));

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        response.body_handler(move |chunk| {
            sink.lock().push(chunk);
            std::future::ready(())
        });
        let (end_tx, end_rx) = tokio::sync::oneshot::channel();
        response.end_handler(move || {
            let _ = end_tx.send(());
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(received.lock().is_empty());
        assert!(connection.is_connected());

        response.transmit();
        end_rx.await.unwrap();
        assert_eq!(*received.lock(), vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        assert!(connection.is_finished());
    }

    #[tokio::test]
    async fn test_write_after_end_is_invalid_state() {
        let transport = Arc::new(RecordingTransport::default());
        let connector = HttpConnector::new(transport, TlsOptions::default(), 4);
        let (handler, _rx) = AsyncResultHandler::channel();
        let connection = connector
            .connect(&service("http://backend/"), &request(), RequiredAuthType::Default, handler)
            .unwrap();
        connection.end();

        let result = connection.write(Bytes::from_static(b"late")).await;
        assert!(matches!(result, Err(GatewayError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_abort_before_head_fails_handler_once() {
        let transport = Arc::new(RecordingTransport {
            hang: true,
            ..Default::default()
        });
        let connector = HttpConnector::new(transport, TlsOptions::default(), 4);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let handler = AsyncResultHandler::new(move |result: GatewayResult<ConnectionResponse>| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = done_tx.send(result.is_err());
        });

        let connection = connector
            .connect(&service("http://backend/"), &request(), RequiredAuthType::Default, handler)
            .unwrap();
        connection.abort();
        connection.abort();

        assert!(done_rx.await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!connection.is_connected());
        assert!(matches!(
            connection.write(Bytes::from_static(b"x")).await,
            Err(GatewayError::Connector { .. })
        ));
    }

    #[tokio::test]
    async fn test_dropping_unfinished_connection_fails_handler() {
        let transport = Arc::new(RecordingTransport {
            drain: true,
            ..Default::default()
        });
        let connector = HttpConnector::new(transport, TlsOptions::default(), 4);
        let (handler, rx) = AsyncResultHandler::channel();
        let connection = connector
            .connect(&service("http://backend/"), &request(), RequiredAuthType::Default, handler)
            .unwrap();
        connection.write(Bytes::from_static(b"partial")).await.unwrap();
        drop(connection);

        let result = tokio::time::timeout(Duration::from_secs(2), await_result(rx))
            .await
            .expect("result handler was never invoked");
        let err = result.unwrap_err();
        assert!(err.to_string().contains("aborted"));
    }

    #[tokio::test]
    async fn test_dropping_ended_connection_still_delivers_head() {
        let transport = Arc::new(RecordingTransport {
            drain: true,
            ..Default::default()
        });
        let connector = HttpConnector::new(transport, TlsOptions::default(), 4);
        let (handler, rx) = AsyncResultHandler::channel();
        let connection = connector
            .connect(&service("http://backend/"), &request(), RequiredAuthType::Default, handler)
            .unwrap();
        connection.write(Bytes::from_static(b"whole")).await.unwrap();
        connection.end();
        drop(connection);

        let response = tokio::time::timeout(Duration::from_secs(2), await_result(rx))
            .await
            .expect("result handler was never invoked")
            .unwrap();
        assert_eq!(response.head().code, 200);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_abort_racing_head_never_keeps_body() {
        for _ in 0..200 {
            let (handler, _rx) = AsyncResultHandler::channel();
            let (sender, _receiver) = mpsc::channel(1);
            let shared = Arc::new(Shared {
                inbound_finished: AtomicBool::new(false),
                outbound_finished: AtomicBool::new(false),
                aborted: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                outbound: Mutex::new(Some(sender)),
                inbound: Mutex::new(None),
                handler,
            });

            let head_side = shared.clone();
            let delivery = tokio::task::spawn_blocking(move || deliver_head(head_side, ok_response()));
            shared.abort();
            delivery.await.unwrap();

            assert!(shared.inbound.lock().is_none());
        }
    }

    #[tokio::test]
    async fn test_transport_failure_reaches_handler() {
        let transport = Arc::new(RecordingTransport {
            fail: true,
            ..Default::default()
        });
        let connector = HttpConnector::new(transport, TlsOptions::default(), 4);
        let (handler, rx) = AsyncResultHandler::channel();
        let _connection = connector
            .connect(&service("http://backend/"), &request(), RequiredAuthType::Default, handler)
            .unwrap();

        let err = await_result(rx).await.unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_malformed_endpoint_is_connector_error() {
        let connector = HttpConnector::new(Arc::new(RecordingTransport::default()), TlsOptions::default(), 4);
        let (handler, rx) = AsyncResultHandler::channel();
        assert!(connector
            .connect(&service("not a url"), &request(), RequiredAuthType::Default, handler)
            .is_err());
        assert!(await_result(rx).await.is_err());
    }
}
