//! # Data-Path Server
//!
//! Accepts client calls, resolves their contract, runs the contract's policy
//! chain around the upstream call and streams the backend's response back.
//!
//! ## Request Flow
//! 1. Parse `/{org}/{service}/{version}/{resource...}` (the version segment is
//!    omitted when an `X-API-Version` header carries it).
//! 2. Take the API key from `X-API-Key`, else from the `apikey` query parameter.
//! 3. Resolve the contract through the [`Registry`] and check it belongs to
//!    the addressed service.
//! 4. Run request-phase policies, connect upstream and stream the body up.
//! 5. Run response-phase policies over the head, then stream the body down.
//!
//! Every call produces exactly one [`RequestMetric`], recorded once the
//! response body has been fully delivered or the call has failed.

use crate::connector::auth::RequiredAuthType;
use crate::connector::http::{ConnectionResponse, HttpConnector, ServiceConnection, API_KEY_HEADER};
use crate::core::async_result::{await_result, AsyncResultHandler};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{PolicyFailure, ServiceRequest};
use crate::observability::logging::redact_api_key;
use crate::observability::metrics::MetricsSink;
use crate::observability::request_metric::RequestMetric;
use crate::policy::{PolicyContext, PolicyRegistry};
use crate::registry::Registry;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument, warn};

/// Header carrying the service version when it is not part of the path
pub const API_VERSION_HEADER: &str = "x-api-version";

/// Query parameter accepted in place of the API key header
pub const API_KEY_QUERY_PARAM: &str = "apikey";

/// Response body chunks buffered between the upstream and the client
const RESPONSE_BUFFER_CHUNKS: usize = 16;

/// Shared state for the data-path handlers
#[derive(Clone)]
pub struct GatewayState {
    pub registry: Arc<dyn Registry>,
    pub connector: HttpConnector,
    pub policies: Arc<PolicyRegistry>,
    pub metrics: Arc<dyn MetricsSink>,

    /// Copied onto every `ServiceRequest`
    pub transport_secure: bool,
}

/// Build the data-path router
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/*path", any(handle_request))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the data path until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, state: GatewayState, shutdown: F) -> GatewayResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, "Gateway data path listening");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|e| GatewayError::internal(format!("Gateway server error: {}", e)))?;

    info!("Gateway data path stopped");
    Ok(())
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Why a call ended without a streamed backend response
enum Rejection {
    Policy(PolicyFailure),
    Error(GatewayError),
}

impl From<GatewayError> for Rejection {
    fn from(error: GatewayError) -> Self {
        Rejection::Error(error)
    }
}

#[instrument(skip(state, request), fields(method = %request.method(), path = %request.uri().path()))]
async fn handle_request(State(state): State<GatewayState>, request: Request) -> Response {
    let mut metric = RequestMetric::new();
    metric.set_request_start(Utc::now());
    metric.method = request.method().to_string();
    metric.url = request.uri().to_string();

    let mut pending = PendingMetric::new(state.metrics.clone(), metric);
    let outcome = proxy(&state, request, pending.metric()).await;
    match outcome {
        Ok(response) => {
            pending.disarm();
            response
        }
        Err(Rejection::Policy(failure)) => {
            let mut metric = pending.take();
            debug!(code = failure.failure_code, message = %failure.message, "Call stopped by policy");
            metric.response_code = failure.response_code;
            metric.response_message = failure.message.clone();
            metric.record_failure(failure.failure_code, &failure.message);
            metric.set_request_end(Utc::now());
            state.metrics.record(metric);
            policy_failure_response(failure)
        }
        Err(Rejection::Error(error)) => {
            let mut metric = pending.take();
            debug!(error = %error, "Call failed");
            metric.response_code = error.status_code().as_u16();
            metric.response_message = error.to_string();
            metric.record_error(&error.to_string());
            metric.set_request_end(Utc::now());
            state.metrics.record(metric);
            error.into_response()
        }
    }
}

/// Run one call through registry, policies and connector
///
/// On success the metric has been moved into the response body handlers,
/// which record it when the body completes.
async fn proxy(state: &GatewayState, request: Request, metric: &mut RequestMetric) -> Result<Response, Rejection> {
    let (parts, body) = request.into_parts();
    let mut service_request = service_request_from_parts(&parts, state.transport_secure)?;

    metric.resource = service_request.destination.clone().unwrap_or_else(|| "/".to_string());
    metric.service_org_id = service_request.service_org_id.clone();
    metric.service_id = service_request.service_id.clone();
    metric.service_version = service_request.service_version.clone();

    let contract = state.registry.get_contract(&service_request).await?;
    if contract.service.coordinates() != service_request.service_coordinates() {
        return Err(GatewayError::invalid_contract("API key not valid for service").into());
    }
    metric.application_org_id = Some(contract.application.organization_id.clone());
    metric.application_id = Some(contract.application.application_id.clone());
    metric.application_version = Some(contract.application.version.clone());
    metric.plan_id = Some(contract.plan.clone());
    metric.contract_id = Some(redact_api_key(&contract.api_key));

    let chain = state.policies.chain_for(&contract.policies)?;
    let mut context = PolicyContext::new(service_request.id.as_str());
    chain
        .apply_request(&mut service_request, &mut context)
        .await
        .map_err(Rejection::Policy)?;

    let required_auth = RequiredAuthType::from_properties(&contract.service.endpoint_properties)?;
    let (handler, head) = AsyncResultHandler::<ConnectionResponse>::channel();
    metric.set_service_start(Utc::now());
    let connection = Arc::new(
        state
            .connector
            .connect(&contract.service, &service_request, required_auth, handler)?,
    );

    let mut inbound = body.into_data_stream();
    while let Some(chunk) = inbound.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                connection.abort();
                return Err(GatewayError::connector(format!("Failed to read request body: {}", e)).into());
            }
        };
        metric.bytes_uploaded += chunk.len() as u64;
        if let Err(write_error) = connection.write(chunk).await {
            connection.abort();
            // Prefer the upstream's own failure over the symptom seen while writing
            let error = match await_result(head).await {
                Err(e) => e,
                Ok(_) => write_error,
            };
            return Err(error.into());
        }
    }
    connection.end();

    let mut response = await_result(head).await?;
    metric.set_service_end(Utc::now());

    if let Err(failure) = chain.apply_response(response.head_mut(), &mut context).await {
        response.abort();
        return Err(Rejection::Policy(failure));
    }

    let status = match StatusCode::from_u16(response.head().code) {
        Ok(status) => status,
        Err(e) => {
            let code = response.head().code;
            response.abort();
            return Err(GatewayError::connector(format!("Invalid upstream status {}: {}", code, e)).into());
        }
    };
    metric.response_code = response.head().code;
    metric.response_message = response.head().message.clone();

    let recorder = MetricRecorder::new(state.metrics.clone(), std::mem::take(metric));
    let body = stream_response_body(&mut response, connection, recorder);

    let mut http_response = Response::new(body);
    *http_response.status_mut() = status;
    *http_response.headers_mut() = response.head().headers.clone();
    response.transmit();
    Ok(http_response)
}

/// Map the inbound request onto service coordinates, key and forwarded parts
fn service_request_from_parts(parts: &Parts, transport_secure: bool) -> GatewayResult<ServiceRequest> {
    let header_version = parts
        .headers
        .get(API_VERSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let path = parse_service_path(parts.uri.path(), header_version)?;

    let (query_keys, query_params): (Vec<_>, Vec<_>) = parse_query(parts.uri.query().unwrap_or_default())
        .into_iter()
        .partition(|(key, _)| key == API_KEY_QUERY_PARAM);
    let query_key = query_keys.into_iter().find_map(|(_, value)| value);

    let header_key = parts
        .headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let mut request = ServiceRequest::new(path.organization_id, path.service_id, path.version);
    request.api_key = header_key.or(query_key);
    request.method = parts.method.clone();
    request.destination = path.destination;
    request.query_params = query_params;
    request.headers = parts.headers.clone();
    request.transport_secure = transport_secure;
    request.url = parts.uri.to_string();
    request.remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string());
    Ok(request)
}

#[derive(Debug, PartialEq)]
struct ServicePath {
    organization_id: String,
    service_id: String,
    version: String,
    destination: Option<String>,
}

fn parse_service_path(path: &str, header_version: Option<String>) -> GatewayResult<ServicePath> {
    let invalid = || GatewayError::invalid_request(format!("Path does not address a service: {}", path));
    let trimmed = path.trim_start_matches('/');

    let (organization_id, service_id, version, rest) = match header_version {
        Some(version) => {
            let mut segments = trimmed.splitn(3, '/');
            let org = segments.next().unwrap_or_default();
            let service = segments.next().unwrap_or_default();
            (org, service, version, segments.next())
        }
        None => {
            let mut segments = trimmed.splitn(4, '/');
            let org = segments.next().unwrap_or_default();
            let service = segments.next().unwrap_or_default();
            let version = segments.next().unwrap_or_default().to_string();
            (org, service, version, segments.next())
        }
    };

    if organization_id.is_empty() || service_id.is_empty() || version.is_empty() {
        return Err(invalid());
    }

    let destination = rest.filter(|rest| !rest.is_empty()).map(|rest| format!("/{}", rest));
    Ok(ServicePath {
        organization_id: decode(organization_id),
        service_id: decode(service_id),
        version: decode(&version),
        destination,
    })
}

fn parse_query(query: &str) -> Vec<(String, Option<String>)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (decode(key), Some(decode(value))),
            None => (decode(pair), None),
        })
        .collect()
}

fn decode(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

fn policy_failure_response(failure: PolicyFailure) -> Response {
    let status = StatusCode::from_u16(failure.response_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let headers = failure.response_headers();
    (status, headers, Json(failure)).into_response()
}

/// Metric of a call that has not reached its response body yet
///
/// If the handler future is dropped first (the client went away mid-upload)
/// the metric is recorded as an error on drop.
struct PendingMetric {
    sink: Arc<dyn MetricsSink>,
    metric: Option<RequestMetric>,
}

impl PendingMetric {
    fn new(sink: Arc<dyn MetricsSink>, metric: RequestMetric) -> Self {
        Self {
            sink,
            metric: Some(metric),
        }
    }

    fn metric(&mut self) -> &mut RequestMetric {
        self.metric.get_or_insert_with(RequestMetric::new)
    }

    fn take(&mut self) -> RequestMetric {
        self.metric.take().unwrap_or_default()
    }

    /// The response body handlers own the metric from here on
    fn disarm(&mut self) {
        self.metric = None;
    }
}

impl Drop for PendingMetric {
    fn drop(&mut self) {
        if let Some(mut metric) = self.metric.take() {
            debug!("Client went away before the response started");
            metric.record_error("Client disconnected");
            metric.set_request_end(Utc::now());
            self.sink.record(metric);
        }
    }
}

/// Records the call's metric exactly once, whichever way the body ends
#[derive(Clone)]
struct MetricRecorder {
    sink: Arc<dyn MetricsSink>,
    metric: Arc<Mutex<Option<RequestMetric>>>,
    bytes_downloaded: Arc<AtomicU64>,
}

impl MetricRecorder {
    fn new(sink: Arc<dyn MetricsSink>, metric: RequestMetric) -> Self {
        Self {
            sink,
            metric: Arc::new(Mutex::new(Some(metric))),
            bytes_downloaded: Arc::new(AtomicU64::new(0)),
        }
    }

    fn add_downloaded(&self, bytes: usize) {
        self.bytes_downloaded.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn finish(&self, error: Option<&GatewayError>) {
        let Some(mut metric) = self.metric.lock().take() else {
            return;
        };
        metric.bytes_downloaded = self.bytes_downloaded.load(Ordering::Relaxed);
        if let Some(error) = error {
            metric.record_error(&error.to_string());
        }
        metric.set_request_end(Utc::now());
        self.sink.record(metric);
    }
}

/// Wire the connection's body handlers into a streaming axum body
fn stream_response_body(
    response: &mut ConnectionResponse,
    connection: Arc<ServiceConnection>,
    recorder: MetricRecorder,
) -> Body {
    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(RESPONSE_BUFFER_CHUNKS);

    // Fires when axum drops the body, even while the upstream sends nothing
    let client_gone = CancellationToken::new();
    let body_guard = client_gone.clone().drop_guard();
    let watched = connection.clone();
    let watch_recorder = recorder.clone();
    tokio::spawn(async move {
        client_gone.cancelled().await;
        if !watched.is_finished() {
            debug!("Client went away mid-download, aborting upstream call");
            watched.abort();
            watch_recorder.finish(Some(&GatewayError::connector("Client disconnected")));
        }
    });

    let body_tx = tx.clone();
    let body_recorder = recorder.clone();
    response.body_handler(move |chunk: Bytes| {
        let tx = body_tx.clone();
        let connection = connection.clone();
        let recorder = body_recorder.clone();
        async move {
            recorder.add_downloaded(chunk.len());
            if tx.send(Ok(chunk)).await.is_err() {
                debug!("Client went away, aborting upstream call");
                connection.abort();
                recorder.finish(Some(&GatewayError::connector("Client disconnected")));
            }
        }
    });

    let error_tx = tx.clone();
    let error_recorder = recorder.clone();
    response.error_handler(move |error| {
        warn!(error = %error, "Upstream response body failed mid-stream");
        error_recorder.finish(Some(&error));
        tokio::spawn(async move {
            let _ = error_tx.send(Err(io::Error::new(io::ErrorKind::Other, error.to_string()))).await;
        });
    });

    response.end_handler(move || {
        drop(tx);
        recorder.finish(None);
    });

    let stream = ReceiverStream::new(rx).map(move |item| {
        let _ = &body_guard;
        item
    });
    Body::from_stream(stream)
}
