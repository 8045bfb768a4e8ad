//! # End-to-End Tests
//!
//! Client → data-path server → registry → policy chain → connector → echo
//! upstream, over real sockets.

mod common;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use common::{application, contract, service, spawn_echo_upstream};
use contract_gateway::connector::{HttpConnector, ReqwestTransport, TlsOptions};
use contract_gateway::core::types::{Policy, PolicyFailure, PolicyFailureType, ServiceRequest, ServiceResponse};
use contract_gateway::gateway::server::{serve, GatewayState};
use contract_gateway::observability::{InMemoryMetricsSink, RequestMetric};
use contract_gateway::policy::{GatewayPolicy, PolicyContext, PolicyOutcome, PolicyRegistry};
use contract_gateway::registry::{CachingRegistry, InMemoryStore, Registry};
use futures::StreamExt;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;

/// Rejects every call
#[derive(Debug)]
struct Deny;

#[async_trait]
impl GatewayPolicy for Deny {
    fn name(&self) -> &str {
        "deny"
    }

    async fn apply_request(
        &self,
        _request: &mut ServiceRequest,
        _context: &mut PolicyContext,
        _config: &Policy,
    ) -> PolicyOutcome {
        Err(PolicyFailure::new(PolicyFailureType::Authorization, 10005, "Not allowed"))
    }
}

/// Marks the request going up and the response coming down
#[derive(Debug)]
struct Stamp;

#[async_trait]
impl GatewayPolicy for Stamp {
    fn name(&self) -> &str {
        "stamp"
    }

    async fn apply_request(
        &self,
        request: &mut ServiceRequest,
        _context: &mut PolicyContext,
        _config: &Policy,
    ) -> PolicyOutcome {
        request.headers.insert("x-policy", HeaderValue::from_static("applied"));
        Ok(())
    }

    async fn apply_response(
        &self,
        response: &mut ServiceResponse,
        _context: &mut PolicyContext,
        _config: &Policy,
    ) -> PolicyOutcome {
        response.headers.insert("x-stamped", HeaderValue::from_static("yes"));
        Ok(())
    }
}

/// Sets its flag when dropped
struct Release(Arc<AtomicBool>);

impl Drop for Release {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// What a slow upstream observed about its calls
#[derive(Clone, Default)]
struct Tracking {
    upload_started: Arc<AtomicBool>,
    upload_released: Arc<AtomicBool>,
    download_released: Arc<AtomicBool>,
}

/// Upstream that drains uploads to the end and streams downloads forever
async fn spawn_slow_upstream() -> (SocketAddr, Tracking) {
    let tracking = Tracking::default();
    let app = Router::new()
        .route("/upload", post(drain_upload))
        .route("/download", get(endless_download))
        .with_state(tracking.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, tracking)
}

async fn drain_upload(State(tracking): State<Tracking>, body: Body) -> &'static str {
    tracking.upload_started.store(true, Ordering::SeqCst);
    let _release = Release(tracking.upload_released.clone());
    let mut body = body.into_data_stream();
    while let Some(Ok(_)) = body.next().await {}
    "drained"
}

async fn endless_download(State(tracking): State<Tracking>) -> Body {
    let release = Release(tracking.download_released.clone());
    let ticks = futures::stream::unfold(release, |release| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Some((Ok::<_, std::io::Error>(Bytes::from_static(b"tick\n")), release))
    });
    Body::from_stream(ticks)
}

async fn wait_until(flag: &AtomicBool, what: &str) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !flag.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

struct Harness {
    gateway: SocketAddr,
    registry: Arc<dyn Registry>,
    metrics: Arc<InMemoryMetricsSink>,
    client: reqwest::Client,
    upstream: SocketAddr,
    _shutdown: oneshot::Sender<()>,
}

impl Harness {
    async fn start() -> Self {
        let upstream = spawn_echo_upstream().await;
        let registry: Arc<dyn Registry> = Arc::new(CachingRegistry::new(Arc::new(InMemoryStore::new())));

        let mut policies = PolicyRegistry::new();
        policies.register(Arc::new(Deny));
        policies.register(Arc::new(Stamp));

        let metrics = Arc::new(InMemoryMetricsSink::new());
        let transport = Arc::new(ReqwestTransport::new(Duration::from_secs(5)));
        let state = GatewayState {
            registry: registry.clone(),
            connector: HttpConnector::new(transport, TlsOptions::default(), 4),
            policies: Arc::new(policies),
            metrics: metrics.clone(),
            transport_secure: false,
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let gateway = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            serve(listener, state, async {
                let _ = shutdown_rx.await;
            })
            .await
            .unwrap();
        });

        Self {
            gateway,
            registry,
            metrics,
            client: reqwest::Client::new(),
            upstream,
            _shutdown: shutdown_tx,
        }
    }

    async fn seed(&self) {
        let endpoint = format!("http://{}/", self.upstream);
        self.registry.publish_service(&service("echo", &endpoint)).await.unwrap();
        self.registry.publish_service(&service("guarded", &endpoint)).await.unwrap();
        self.registry.publish_service(&service("stamped", &endpoint)).await.unwrap();

        let mut guarded = contract("guarded-key", "guarded");
        guarded.policies = vec![Policy::new("deny", "{}")];
        let mut stamped = contract("stamped-key", "stamped");
        stamped.policies = vec![Policy::new("stamp", "{}")];
        self.registry
            .register_application(&application(
                "app",
                vec![contract("12345", "echo"), guarded, stamped],
            ))
            .await
            .unwrap();
    }

    /// Publish a service on the slow upstream, reachable with `slow-key`
    async fn seed_slow(&self) -> Tracking {
        let (addr, tracking) = spawn_slow_upstream().await;
        self.registry
            .publish_service(&service("slow", &format!("http://{}/", addr)))
            .await
            .unwrap();
        self.registry
            .register_application(&application("slow-app", vec![contract("slow-key", "slow")]))
            .await
            .unwrap();
        tracking
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.gateway, path)
    }

    async fn wait_for_metrics(&self, count: usize) -> Vec<RequestMetric> {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if self.metrics.len() >= count {
                    return self.metrics.metrics();
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("metrics were not recorded")
    }
}

#[tokio::test]
async fn test_echo_scenario_until_retirement() {
    let harness = Harness::start().await;
    harness.seed().await;

    let response = harness
        .client
        .get(harness.url("/T/echo/1.0/path/to/resource?x=1"))
        .header("X-API-Key", "12345")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let echoed: Value = response.json().await.unwrap();
    assert_eq!(echoed["path"], "/path/to/resource");
    assert_eq!(echoed["query"], "x=1");
    assert!(echoed["headers"].get("x-api-key").is_none());

    harness
        .registry
        .retire_service(&service("echo", &format!("http://{}/", harness.upstream)))
        .await
        .unwrap();

    let response = harness
        .client
        .get(harness.url("/T/echo/1.0/path/to/resource?x=1"))
        .header("X-API-Key", "12345")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
    let error: Value = response.json().await.unwrap();
    assert_eq!(error["error"]["type"], "invalid_contract");

    let metrics = harness.wait_for_metrics(2).await;
    let success = metrics.iter().find(|m| m.response_code == 200).unwrap();
    assert_eq!(success.service_id, "echo");
    assert_eq!(success.plan_id.as_deref(), Some("P"));
    assert!(success.bytes_downloaded > 0);
    assert!(success.request_duration() >= 0);
    assert!(success.service_duration() >= 0);
    let failed = metrics.iter().find(|m| m.response_code == 403).unwrap();
    assert!(failed.error);
}

#[tokio::test]
async fn test_request_body_streams_upstream() {
    let harness = Harness::start().await;
    harness.seed().await;

    let response = harness
        .client
        .post(harness.url("/T/echo/1.0/upload"))
        .header("X-API-Key", "12345")
        .body("payload bytes")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let echoed: Value = response.json().await.unwrap();
    assert_eq!(echoed["method"], "POST");
    assert_eq!(echoed["body"], "payload bytes");

    let metrics = harness.wait_for_metrics(1).await;
    assert_eq!(metrics[0].bytes_uploaded, "payload bytes".len() as u64);
    assert_eq!(metrics[0].outcome(), "success");
}

#[tokio::test]
async fn test_api_key_query_parameter_is_consumed() {
    let harness = Harness::start().await;
    harness.seed().await;

    let response = harness
        .client
        .get(harness.url("/T/echo/1.0/search?apikey=12345&q=rust"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let echoed: Value = response.json().await.unwrap();
    assert_eq!(echoed["query"], "q=rust");
}

#[tokio::test]
async fn test_version_header_replaces_path_segment() {
    let harness = Harness::start().await;
    harness.seed().await;

    let response = harness
        .client
        .get(harness.url("/T/echo/items"))
        .header("X-API-Key", "12345")
        .header("X-API-Version", "1.0")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let echoed: Value = response.json().await.unwrap();
    assert_eq!(echoed["path"], "/items");
}

#[tokio::test]
async fn test_policy_failure_short_circuits() {
    let harness = Harness::start().await;
    harness.seed().await;

    let response = harness
        .client
        .get(harness.url("/T/guarded/1.0/secret"))
        .header("X-API-Key", "guarded-key")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
    assert_eq!(response.headers()["x-policy-failure-code"], "10005");
    assert_eq!(response.headers()["x-policy-failure-type"], "Authorization");
    assert_eq!(response.headers()["x-policy-failure-message"], "Not allowed");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["failureCode"], 10005);

    let metrics = harness.wait_for_metrics(1).await;
    assert!(metrics[0].failure);
    assert_eq!(metrics[0].failure_code, 10005);
    assert_eq!(metrics[0].outcome(), "failure");
}

#[tokio::test]
async fn test_policies_wrap_the_upstream_call() {
    let harness = Harness::start().await;
    harness.seed().await;

    let response = harness
        .client
        .get(harness.url("/T/stamped/1.0/"))
        .header("X-API-Key", "stamped-key")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-stamped"], "yes");
    let echoed: Value = response.json().await.unwrap();
    assert_eq!(echoed["headers"]["x-policy"], "applied");
    assert_eq!(echoed["path"], "/");
}

#[tokio::test]
async fn test_rejected_calls() {
    let harness = Harness::start().await;
    harness.seed().await;

    // Key bound to another service
    let response = harness
        .client
        .get(harness.url("/T/guarded/1.0/"))
        .header("X-API-Key", "12345")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    // Unknown key
    let response = harness
        .client
        .get(harness.url("/T/echo/1.0/"))
        .header("X-API-Key", "unknown")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    // Path without a version
    let response = harness
        .client
        .get(harness.url("/T/echo"))
        .header("X-API-Key", "12345")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let health = harness.client.get(harness.url("/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);
}

#[tokio::test]
async fn test_client_disconnect_mid_upload_releases_upstream() {
    let harness = Harness::start().await;
    let tracking = harness.seed_slow().await;

    let mut socket = tokio::net::TcpStream::connect(harness.gateway).await.unwrap();
    socket
        .write_all(
            b"POST /T/slow/1.0/upload HTTP/1.1\r\n\
              host: gateway\r\n\
              x-api-key: slow-key\r\n\
              content-length: 1048576\r\n\r\n\
              partial body",
        )
        .await
        .unwrap();
    wait_until(&tracking.upload_started, "the upload to reach the upstream").await;
    drop(socket);

    wait_until(&tracking.upload_released, "the upstream call to be released").await;
    let metrics = harness.wait_for_metrics(1).await;
    assert!(metrics[0].error);
    assert_eq!(metrics[0].service_id, "slow");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.metrics.len(), 1);
}

#[tokio::test]
async fn test_client_disconnect_mid_download_records_one_error() {
    let harness = Harness::start().await;
    let tracking = harness.seed_slow().await;

    let mut response = harness
        .client
        .get(harness.url("/T/slow/1.0/download"))
        .header("X-API-Key", "slow-key")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let first = response.chunk().await.unwrap().unwrap();
    assert!(first.starts_with(b"tick"));
    drop(response);

    wait_until(&tracking.download_released, "the upstream call to be released").await;
    let metrics = harness.wait_for_metrics(1).await;
    assert!(metrics[0].error);
    assert!(metrics[0]
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("Client disconnected"));
    assert_eq!(metrics[0].response_code, 200);
    assert!(metrics[0].bytes_downloaded > 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.metrics.len(), 1);
}
