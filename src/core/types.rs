//! # Core Types Module
//!
//! The entities routing and policy decisions operate on: published services,
//! registered applications and their contracts, the resolved `ServiceContract`
//! used per request, and the mutable request/response envelopes that flow
//! through the policy chain.
//!
//! Registry entities serialize with camelCase field names, which is the shape
//! they take inside the durable store.

use axum::http::{Extensions, HeaderMap, HeaderName, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// A policy reference attached to a service, plan or contract
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    /// Name of the policy implementation, resolved by the policy registry
    pub policy_impl: String,

    /// Raw JSON configuration handed to the implementation
    #[serde(default)]
    pub policy_json_config: String,
}

impl Policy {
    pub fn new<S: Into<String>>(policy_impl: S, policy_json_config: S) -> Self {
        Self {
            policy_impl: policy_impl.into(),
            policy_json_config: policy_json_config.into(),
        }
    }
}

/// Identity triple of a service version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCoordinates {
    pub organization_id: String,
    pub service_id: String,
    pub version: String,
}

impl ServiceCoordinates {
    pub fn new<S: Into<String>>(organization_id: S, service_id: S, version: S) -> Self {
        Self {
            organization_id: organization_id.into(),
            service_id: service_id.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ServiceCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.organization_id, self.service_id, self.version)
    }
}

/// A published backend service version
///
/// Equality and hashing only look at `(organization_id, service_id, version)`.
/// A service is immutable once published; a new version is a new `Service`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    #[serde(default)]
    pub public_service: bool,
    pub organization_id: String,
    pub service_id: String,
    pub version: String,

    /// Backend URL the connector talks to
    pub endpoint: String,
    #[serde(default)]
    pub endpoint_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_content_type: Option<String>,

    /// Free-form endpoint settings (auth configuration lives here)
    #[serde(default)]
    pub endpoint_properties: HashMap<String, String>,

    #[serde(default)]
    pub service_policies: Vec<Policy>,
}

impl Service {
    pub fn coordinates(&self) -> ServiceCoordinates {
        ServiceCoordinates::new(
            self.organization_id.as_str(),
            self.service_id.as_str(),
            self.version.as_str(),
        )
    }
}

impl PartialEq for Service {
    fn eq(&self, other: &Self) -> bool {
        self.organization_id == other.organization_id
            && self.service_id == other.service_id
            && self.version == other.version
    }
}

impl Eq for Service {}

impl Hash for Service {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.organization_id.hash(state);
        self.service_id.hash(state);
        self.version.hash(state);
    }
}

/// Binding of one application version to one service version under one plan
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    /// Routing token presented by callers
    pub api_key: String,
    pub service_org_id: String,
    pub service_id: String,
    pub service_version: String,
    pub plan: String,

    /// Effective policy list (plan, service and application layers merged)
    #[serde(default)]
    pub policies: Vec<Policy>,
}

impl Contract {
    pub fn service_coordinates(&self) -> ServiceCoordinates {
        ServiceCoordinates::new(
            self.service_org_id.as_str(),
            self.service_id.as_str(),
            self.service_version.as_str(),
        )
    }
}

/// A registered consumer application version
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub organization_id: String,
    pub application_id: String,
    pub version: String,

    /// Unique contracts, no ordering guarantee
    #[serde(default)]
    pub contracts: HashSet<Contract>,
}

impl Application {
    /// Copy of this application without its contracts
    pub fn without_contracts(&self) -> Self {
        Self {
            organization_id: self.organization_id.clone(),
            application_id: self.application_id.clone(),
            version: self.version.clone(),
            contracts: HashSet::new(),
        }
    }
}

/// Fully resolved, denormalized view of a contract ready for request-time use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceContract {
    pub api_key: String,
    pub service: Service,
    pub application: Application,
    pub plan: String,
    #[serde(default)]
    pub policies: Vec<Policy>,
}

impl ServiceContract {
    pub fn new(api_key: String, service: Service, application: Application, plan: String, policies: Vec<Policy>) -> Self {
        Self {
            api_key,
            service,
            application,
            plan,
            policies,
        }
    }
}

/// Mutable per-call request envelope
///
/// Built by the data-path server from the inbound HTTP request and handed,
/// by mutable reference, through every request-phase policy.
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    /// Unique identifier for this call (tracing and logging)
    pub id: String,

    /// Presented API key, if any
    pub api_key: Option<String>,

    pub service_org_id: String,
    pub service_id: String,
    pub service_version: String,

    /// HTTP method used towards the upstream
    pub method: Method,

    /// Resource path below the service, always beginning with `/` when set
    pub destination: Option<String>,

    /// Ordered query parameters; `None` values are bare keys
    pub query_params: Vec<(String, Option<String>)>,

    /// Headers as received (names are case-insensitive)
    pub headers: HeaderMap,

    pub remote_addr: Option<String>,

    /// Whether the inbound connection was TLS-protected
    pub transport_secure: bool,

    /// Full inbound URL
    pub url: String,

    /// Typed attachments for platform-specific state (e.g. the raw body handle)
    pub extensions: Extensions,
}

impl ServiceRequest {
    /// Create a request envelope for the given service coordinates
    pub fn new<S: Into<String>>(service_org_id: S, service_id: S, service_version: S) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            api_key: None,
            service_org_id: service_org_id.into(),
            service_id: service_id.into(),
            service_version: service_version.into(),
            method: Method::GET,
            destination: None,
            query_params: Vec::new(),
            headers: HeaderMap::new(),
            remote_addr: None,
            transport_secure: false,
            url: String::new(),
            extensions: Extensions::new(),
        }
    }

    pub fn with_api_key<S: Into<String>>(mut self, api_key: S) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn service_coordinates(&self) -> ServiceCoordinates {
        ServiceCoordinates::new(
            self.service_org_id.as_str(),
            self.service_id.as_str(),
            self.service_version.as_str(),
        )
    }

    /// Get a header value by name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// Mutable per-call response envelope
#[derive(Debug, Clone, Default)]
pub struct ServiceResponse {
    pub code: u16,
    pub message: String,
    pub headers: HeaderMap,

    /// Policy-to-policy scratch space
    pub attributes: HashMap<String, serde_json::Value>,
}

impl ServiceResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// Category of a policy failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyFailureType {
    Authentication,
    Authorization,
    Other,
}

impl fmt::Display for PolicyFailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyFailureType::Authentication => write!(f, "Authentication"),
            PolicyFailureType::Authorization => write!(f, "Authorization"),
            PolicyFailureType::Other => write!(f, "Other"),
        }
    }
}

/// Terminal decision a policy produces instead of forwarding downstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyFailure {
    pub response_code: u16,
    pub failure_code: u32,
    pub message: String,
    #[serde(rename = "type")]
    pub failure_type: PolicyFailureType,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl PolicyFailure {
    pub fn new<S: Into<String>>(failure_type: PolicyFailureType, failure_code: u32, message: S) -> Self {
        let response_code = match failure_type {
            PolicyFailureType::Authentication => 401,
            PolicyFailureType::Authorization => 403,
            PolicyFailureType::Other => 500,
        };
        Self {
            response_code,
            failure_code,
            message: message.into(),
            failure_type,
            headers: HashMap::new(),
        }
    }

    pub fn with_response_code(mut self, response_code: u16) -> Self {
        self.response_code = response_code;
        self
    }

    pub fn with_header<S: Into<String>>(mut self, name: S, value: S) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Headers describing the failure, plus any the policy attached
    pub fn response_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let standard = [
            ("x-policy-failure-type", self.failure_type.to_string()),
            ("x-policy-failure-message", self.message.clone()),
            ("x-policy-failure-code", self.failure_code.to_string()),
        ];
        let extra = self.headers.iter().map(|(k, v)| (k.as_str(), v.clone()));
        for (name, value) in standard.into_iter().chain(extra) {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                headers.insert(name, value);
            }
        }
        headers
    }
}
