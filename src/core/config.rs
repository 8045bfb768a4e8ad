//! # Configuration Module
//!
//! Configuration structures and loading for the gateway data path.
//!
//! ## Key Features
//! - YAML configuration parsing with serde
//! - Environment variable overrides (`GATEWAY_<SECTION>_<FIELD>`)
//! - Validation that reports every problem at once

use crate::connector::TlsOptions;
use crate::core::error::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/gateway.yaml";

/// Main gateway configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Data-path listener settings
    pub server: ServerConfig,

    /// Registry store and caching strategy
    pub registry: RegistryConfig,

    /// Upstream connector settings
    pub connector: ConnectorConfig,

    /// Logging and metrics
    pub observability: ObservabilityConfig,
}

impl GatewayConfig {
    /// Load configuration from a YAML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: GatewayConfig = serde_yaml::from_str(&content)
            .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file, falling back to defaults when it does not exist
    pub async fn load_or_default<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        if tokio::fs::try_exists(path.as_ref()).await.unwrap_or(false) {
            return Self::load_from_file(path).await;
        }

        let mut config = GatewayConfig::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    ///
    /// Environment variables follow the pattern: GATEWAY_<SECTION>_<FIELD>
    /// For example: GATEWAY_REGISTRY_CACHE_POLLING_INTERVAL=30s
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> GatewayResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("GATEWAY_SERVER_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }

        if let Some(secure) = lookup("GATEWAY_SERVER_TRANSPORT_SECURE") {
            self.server.transport_secure = secure
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_SERVER_TRANSPORT_SECURE: {}", e)))?;
        }

        if let Some(mode) = lookup("GATEWAY_REGISTRY_CACHING") {
            self.registry.caching = match mode.to_lowercase().as_str() {
                "none" => CachingMode::None,
                "local" => CachingMode::Local,
                "polling" => CachingMode::Polling,
                other => {
                    return Err(GatewayError::config(format!(
                        "Invalid GATEWAY_REGISTRY_CACHING: {}",
                        other
                    )))
                }
            };
        }

        if let Some(interval) = lookup("GATEWAY_REGISTRY_CACHE_POLLING_INTERVAL") {
            self.registry.cache_polling_interval = humantime::parse_duration(&interval).map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_REGISTRY_CACHE_POLLING_INTERVAL: {}", e))
            })?;
        }

        if let Some(url) = lookup("GATEWAY_REGISTRY_REDIS_URL") {
            let key_prefix = match &self.registry.store {
                StoreConfig::Redis { key_prefix, .. } => key_prefix.clone(),
                StoreConfig::Memory => default_key_prefix(),
            };
            self.registry.store = StoreConfig::Redis { url, key_prefix };
        }

        if let Some(seed) = lookup("GATEWAY_REGISTRY_SEED_FILE") {
            self.registry.seed_file = Some(PathBuf::from(seed));
        }

        if let Some(timeout) = lookup("GATEWAY_CONNECTOR_CONNECT_TIMEOUT") {
            self.connector.connect_timeout = humantime::parse_duration(&timeout)
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_CONNECTOR_CONNECT_TIMEOUT: {}", e)))?;
        }

        if let Some(level) = lookup("GATEWAY_LOG_LEVEL") {
            self.observability.logging.level = level;
        }

        if let Some(format) = lookup("GATEWAY_LOG_FORMAT") {
            self.observability.logging.format = match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                other => return Err(GatewayError::config(format!("Invalid GATEWAY_LOG_FORMAT: {}", other))),
            };
        }

        if let Some(addr) = lookup("GATEWAY_METRICS_ADDRESS") {
            self.observability.metrics_address = Some(addr);
        }

        Ok(())
    }

    /// Configuration validation with detailed error messages
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "server.bind_address '{}' is not a valid socket address",
                self.server.bind_address
            ));
        }

        if self.registry.caching == CachingMode::Polling && self.registry.cache_polling_interval.is_zero() {
            errors.push("registry.cache_polling_interval must be greater than 0".to_string());
        }

        if let StoreConfig::Redis { url, .. } = &self.registry.store {
            if !(url.starts_with("redis://") || url.starts_with("rediss://")) {
                errors.push(format!("registry.store.url '{}' must be a redis:// or rediss:// URL", url));
            }
            // A shared store needs marker-based invalidation to see other nodes' writes
            if self.registry.caching == CachingMode::Local {
                errors.push("registry.caching 'local' cannot be used with a redis store; use 'polling' or 'none'".to_string());
            }
        }

        if self.connector.write_buffer_chunks == 0 {
            errors.push("connector.write_buffer_chunks must be greater than 0".to_string());
        }

        if self.connector.connect_timeout.is_zero() {
            errors.push("connector.connect_timeout must be greater than 0".to_string());
        }

        let tls = &self.connector.tls;
        if tls.client_certificate_file.is_some() != tls.client_key_file.is_some() {
            errors.push("connector.tls client_certificate_file and client_key_file must be set together".to_string());
        }

        if let Some(addr) = &self.observability.metrics_address {
            if addr.parse::<SocketAddr>().is_err() {
                errors.push(format!("observability.metrics_address '{}' is not a valid socket address", addr));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Data-path listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the gateway listens on
    pub bind_address: String,

    /// Marks every inbound request as transport-secure (TLS terminated in front of the gateway)
    pub transport_secure: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            transport_secure: false,
        }
    }
}

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Durable store backing the registry
    pub store: StoreConfig,

    /// Caching strategy layered over the store
    pub caching: CachingMode,

    /// How often the cluster-aware registry checks the data-version marker
    #[serde(with = "humantime_serde")]
    pub cache_polling_interval: Duration,

    /// Services and applications published at startup
    pub seed_file: Option<PathBuf>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::Memory,
            caching: CachingMode::Polling,
            cache_polling_interval: Duration::from_secs(10),
            seed_file: None,
        }
    }
}

/// Durable store selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Process-local store (single node, tests)
    Memory,

    /// Redis shared by every gateway node
    Redis {
        url: String,
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
    },
}

fn default_key_prefix() -> String {
    "gateway:registry:".to_string()
}

/// Registry caching strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachingMode {
    /// Every lookup goes to the store
    None,

    /// In-process cache, correct for a single node only
    Local,

    /// In-process cache invalidated through the shared data-version marker
    Polling,
}

/// Upstream connector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// TLS settings for upstream connections
    pub tls: TlsOptions,

    /// Timeout for establishing the upstream connection
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Outbound body chunks buffered before `write` waits on the upstream
    pub write_buffer_chunks: usize,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            tls: TlsOptions::default(),
            connect_timeout: Duration::from_secs(10),
            write_buffer_chunks: 16,
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub logging: LoggingConfig,

    /// Prometheus exporter listen address; metrics export is off when unset
    pub metrics_address: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by RUST_LOG
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "contract_gateway=info,tower_http=info".to_string(),
            format: LogFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}
