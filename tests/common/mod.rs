//! Shared fixtures for the integration tests

#![allow(dead_code)]

use contract_gateway::core::types::{Application, Contract, Policy, Service, ServiceRequest};
use std::collections::HashMap;

pub const ORG: &str = "T";

pub fn service(service_id: &str, endpoint: &str) -> Service {
    Service {
        organization_id: ORG.to_string(),
        service_id: service_id.to_string(),
        version: "1.0".to_string(),
        endpoint: endpoint.to_string(),
        endpoint_type: "rest".to_string(),
        endpoint_properties: HashMap::new(),
        service_policies: vec![Policy::new("service-level", "{}")],
        ..Default::default()
    }
}

pub fn contract(api_key: &str, service_id: &str) -> Contract {
    Contract {
        api_key: api_key.to_string(),
        service_org_id: ORG.to_string(),
        service_id: service_id.to_string(),
        service_version: "1.0".to_string(),
        plan: "P".to_string(),
        policies: vec![],
    }
}

pub fn application(application_id: &str, contracts: Vec<Contract>) -> Application {
    Application {
        organization_id: ORG.to_string(),
        application_id: application_id.to_string(),
        version: "1.0".to_string(),
        contracts: contracts.into_iter().collect(),
    }
}

pub fn request(api_key: &str, service_id: &str) -> ServiceRequest {
    ServiceRequest::new(ORG, service_id, "1.0").with_api_key(api_key)
}

/// Upstream that answers every call with a JSON description of what it received
pub async fn spawn_echo_upstream() -> std::net::SocketAddr {
    use axum::routing::any;
    use axum::Router;

    let app = Router::new().route("/", any(echo)).route("/*path", any(echo));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn echo(
    method: axum::http::Method,
    uri: axum::http::Uri,
    headers: axum::http::HeaderMap,
    body: bytes::Bytes,
) -> axum::Json<serde_json::Value> {
    let headers: serde_json::Map<String, serde_json::Value> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                serde_json::Value::String(value.to_str().unwrap_or_default().to_string()),
            )
        })
        .collect();
    axum::Json(serde_json::json!({
        "method": method.as_str(),
        "path": uri.path(),
        "query": uri.query(),
        "headers": headers,
        "body": String::from_utf8_lossy(&body),
    }))
}
