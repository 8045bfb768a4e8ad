//! # Error Handling Module
//!
//! This module defines every error the gateway data path can produce, using the
//! `thiserror` crate, and maps each one onto the HTTP status returned to callers.
//!
//! ## Error Taxonomy
//!
//! - **Publishing**: administrative conflicts (duplicate publish, retiring or
//!   unregistering something that does not exist).
//! - **Registration**: an application failed validation or could not be written.
//! - **InvalidContract**: a presented API key does not resolve, or resolves to a
//!   retired service. This one lives on the request hot path.
//! - **Connector**: malformed endpoint, auth-policy violation or transport failure
//!   while talking to the backend.
//!
//! All of them are terminal for the request in which they occur. Nothing in the
//! registry or the connector retries internally.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::convert::Infallible;
use thiserror::Error;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Error types for the gateway data path
///
/// The `#[error("...")]` attribute from `thiserror` implements `Display` with the
/// given message. `Clone` lets the connector hand the same failure to both the
/// synchronous caller and the result handler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Administrative conflict: duplicate publish, or retiring/unregistering something absent
    #[error("Publishing error: {message}")]
    Publishing { message: String },

    /// Application registration failed validation or write
    #[error("Registration error: {message}")]
    Registration { message: String },

    /// Presented API key does not resolve to a live contract
    #[error("Invalid contract: {message}")]
    InvalidContract { message: String },

    /// Inbound request could not be mapped onto a service call
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// Upstream connection failure (bad endpoint, auth requirements, transport)
    #[error("Connector error: {message}")]
    Connector { message: String },

    /// An operation was attempted in a state that does not allow it
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// The durable registry store could not complete a call
    #[error("Registry store error: {message}")]
    Store { message: String },

    /// Configuration-related errors (invalid config, unreadable files, etc.)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal server errors for unexpected failures
    #[error("Internal server error: {message}")]
    Internal { message: String },

    /// I/O errors (file operations, sockets, etc.)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration and seed files
    #[error("YAML error: {message}")]
    Yaml { message: String },

    /// HTTP client errors raised while talking to the upstream
    #[error("HTTP client error: {message}")]
    HttpClient { message: String },
}

impl GatewayError {
    /// Create a publishing error
    pub fn publishing<S: Into<String>>(message: S) -> Self {
        Self::Publishing {
            message: message.into(),
        }
    }

    /// Create a registration error
    pub fn registration<S: Into<String>>(message: S) -> Self {
        Self::Registration {
            message: message.into(),
        }
    }

    /// Create an invalid contract error
    pub fn invalid_contract<S: Into<String>>(message: S) -> Self {
        Self::InvalidContract {
            message: message.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid_request<S: Into<String>>(message: S) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create a connector error
    pub fn connector<S: Into<String>>(message: S) -> Self {
        Self::Connector {
            message: message.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create a store error
    pub fn store<S: Into<String>>(message: S) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Publishing { .. } => StatusCode::CONFLICT,
            Self::Registration { .. } => StatusCode::BAD_REQUEST,
            Self::InvalidContract { .. } => StatusCode::FORBIDDEN,
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Connector { .. } => StatusCode::BAD_GATEWAY,
            Self::HttpClient { .. } => StatusCode::BAD_GATEWAY,
            Self::Store { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidState { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Json { .. } => StatusCode::BAD_REQUEST,
            Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get a string representation of the error type for API responses
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Publishing { .. } => "publishing_error",
            Self::Registration { .. } => "registration_error",
            Self::InvalidContract { .. } => "invalid_contract",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Connector { .. } => "connector_error",
            Self::InvalidState { .. } => "invalid_state",
            Self::Store { .. } => "store_error",
            Self::Configuration { .. } => "configuration_error",
            Self::Internal { .. } => "internal_error",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
            Self::HttpClient { .. } => "http_client_error",
        }
    }
}

impl From<Infallible> for GatewayError {
    fn from(infallible: Infallible) -> Self {
        match infallible {}
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        Self::HttpClient {
            message: err.to_string(),
        }
    }
}

/// Converts errors into JSON HTTP responses for the data-path server
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let error_response = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });

        (status, Json(error_response)).into_response()
    }
}
