//! # Contract Gateway Library
//!
//! Runtime data path of a contract-routed API gateway. A client call carries
//! an API key; the key resolves to a contract binding an application to a
//! published service; the contract's policies run around the upstream call;
//! the backend response streams back under flow control.
//!
//! ## Layout
//! - [`registry`]: where services, applications and contracts live, with an
//!   optional in-process cache kept coherent across nodes by a shared
//!   data-version marker
//! - [`connector`]: one upstream HTTP(S) call per gateway request
//! - [`policy`]: the request/response policy-chain contract
//! - [`gateway`]: the axum server tying the pieces together
//! - [`observability`]: logging and per-request metrics

/// Error types, configuration, the async result protocol and the domain model
pub mod core;

/// Service, application and contract registry with its caching layers
pub mod registry;

/// Upstream connector: auth requirements, URL composition, streaming bodies
pub mod connector;

/// Policy-chain invocation contract
pub mod policy;

/// Inbound data-path server
pub mod gateway;

/// Structured logging and request metrics
pub mod observability;

// Re-exports for the types most callers need

pub use core::error::{GatewayError, GatewayResult};

pub use core::config::GatewayConfig;

pub use core::async_result::{AsyncResult, AsyncResultHandler};

pub use core::types::{
    Application, Contract, Policy, PolicyFailure, PolicyFailureType, Service, ServiceContract, ServiceRequest,
    ServiceResponse,
};

pub use registry::Registry;

pub use gateway::server::GatewayState;
