//! Upstream authentication requirements read from a service's endpoint properties.

use crate::core::error::{GatewayError, GatewayResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const AUTHORIZATION_TYPE: &str = "authorization.type";
pub const BASIC_AUTH_USERNAME: &str = "basic-auth.username";
pub const BASIC_AUTH_PASSWORD: &str = "basic-auth.password";
pub const BASIC_AUTH_REQUIRE_SSL: &str = "basic-auth.requireSSL";

/// How the gateway must authenticate to the backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequiredAuthType {
    /// No upstream authentication
    #[default]
    Default,
    /// HTTP basic credentials injected by the connector
    Basic,
    /// Mutual TLS with the configured client certificate
    Mtls,
}

impl RequiredAuthType {
    pub fn from_properties(properties: &HashMap<String, String>) -> GatewayResult<Self> {
        match properties.get(AUTHORIZATION_TYPE).map(|value| value.trim().to_lowercase()) {
            None => Ok(Self::Default),
            Some(value) => match value.as_str() {
                "" | "none" | "default" => Ok(Self::Default),
                "basic" => Ok(Self::Basic),
                "mtls" => Ok(Self::Mtls),
                other => Err(GatewayError::connector(format!(
                    "Unsupported upstream authorization type: {}",
                    other
                ))),
            },
        }
    }
}

/// Credentials for `RequiredAuthType::Basic`
#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuthOptions {
    pub username: String,
    pub password: String,
    /// Refuse to send credentials over plain HTTP
    pub require_ssl: bool,
}

impl std::fmt::Debug for BasicAuthOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuthOptions")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("require_ssl", &self.require_ssl)
            .finish()
    }
}

impl BasicAuthOptions {
    pub fn from_properties(properties: &HashMap<String, String>) -> GatewayResult<Self> {
        let username = properties
            .get(BASIC_AUTH_USERNAME)
            .cloned()
            .ok_or_else(|| GatewayError::connector(format!("Basic auth requires {}", BASIC_AUTH_USERNAME)))?;
        let password = properties.get(BASIC_AUTH_PASSWORD).cloned().unwrap_or_default();
        let require_ssl = match properties.get(BASIC_AUTH_REQUIRE_SSL) {
            None => true,
            Some(value) => value.trim().parse::<bool>().map_err(|_| {
                GatewayError::connector(format!("Invalid {} value: {}", BASIC_AUTH_REQUIRE_SSL, value))
            })?,
        };

        Ok(Self {
            username,
            password,
            require_ssl,
        })
    }

    /// Value of the `Authorization` header
    pub fn authorization_header(&self) -> String {
        let credentials = format!("{}:{}", self.username, self.password);
        format!("Basic {}", STANDARD.encode(credentials))
    }
}

/// Check auth requirements against the endpoint before any network I/O
pub fn verify_connection(
    required: RequiredAuthType,
    endpoint_secure: bool,
    basic: Option<&BasicAuthOptions>,
) -> GatewayResult<()> {
    match required {
        RequiredAuthType::Basic => {
            let require_ssl = basic.map(|options| options.require_ssl).unwrap_or(true);
            if require_ssl && !endpoint_secure {
                return Err(GatewayError::connector(
                    "Endpoint security requested (BASIC auth) but endpoint is not secure (SSL).",
                ));
            }
        }
        RequiredAuthType::Mtls => {
            if !endpoint_secure {
                return Err(GatewayError::connector(
                    "Mutual TLS specified, but endpoint is not HTTPS.",
                ));
            }
        }
        RequiredAuthType::Default => {}
    }
    Ok(())
}
