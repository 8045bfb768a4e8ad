//! # Upstream Connector Module
//!
//! Carries one gateway request to its backend service and streams the
//! response back under flow control.

pub mod auth;
pub mod http;
pub mod transport;

pub use auth::{verify_connection, BasicAuthOptions, RequiredAuthType};
pub use http::{ConnectionResponse, HttpConnector, ServiceConnection, API_KEY_HEADER};
pub use transport::{ReqwestTransport, TlsOptions, UpstreamRequest, UpstreamResponse, UpstreamTransport};
