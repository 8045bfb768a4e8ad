//! # Contract Gateway - Main Entry Point
//!
//! Boots the data path from `GATEWAY_CONFIG_PATH` (default
//! `config/gateway.yaml`, built-in defaults when the file is absent):
//!
//! 1. Load and validate configuration, apply `GATEWAY_*` overrides
//! 2. Initialize logging and, if configured, the Prometheus exporter
//! 3. Build the registry stack and apply the seed file
//! 4. Serve until SIGINT or SIGTERM, then stop the registry poller

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use contract_gateway::connector::{HttpConnector, ReqwestTransport};
use contract_gateway::core::config::{GatewayConfig, DEFAULT_CONFIG_PATH};
use contract_gateway::core::error::{GatewayError, GatewayResult};
use contract_gateway::gateway::server::{serve, GatewayState};
use contract_gateway::observability::{init_logging, install_prometheus_exporter, MetricsSink, PrometheusMetricsSink};
use contract_gateway::policy::PolicyRegistry;
use contract_gateway::registry::seed::SeedFile;
use contract_gateway::registry::build_registry;

#[tokio::main]
async fn main() -> GatewayResult<()> {
    let config_path = std::env::var("GATEWAY_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = GatewayConfig::load_or_default(&config_path).await?;

    init_logging(&config.observability.logging);
    info!(version = env!("CARGO_PKG_VERSION"), config = %config_path, "Starting contract gateway");

    if let Err(e) = run(config).await {
        error!(error = %e, "Gateway stopped with an error");
        return Err(e);
    }

    info!("Contract gateway shutdown complete");
    Ok(())
}

async fn run(config: GatewayConfig) -> GatewayResult<()> {
    if let Some(address) = &config.observability.metrics_address {
        let address = address
            .parse()
            .map_err(|e| GatewayError::config(format!("Invalid metrics address '{}': {}", address, e)))?;
        install_prometheus_exporter(address)?;
    }

    let registry = build_registry(&config.registry).await?;
    if let Some(seed_file) = &config.registry.seed_file {
        let seed = SeedFile::load(seed_file).await?;
        seed.apply(registry.as_ref()).await?;
    }

    let transport = Arc::new(ReqwestTransport::new(config.connector.connect_timeout));
    let connector = HttpConnector::new(
        transport,
        config.connector.tls.clone(),
        config.connector.write_buffer_chunks,
    );
    let metrics: Arc<dyn MetricsSink> = Arc::new(PrometheusMetricsSink::new());

    let state = GatewayState {
        registry: registry.clone(),
        connector,
        policies: Arc::new(PolicyRegistry::new()),
        metrics,
        transport_secure: config.server.transport_secure,
    };

    let listener = TcpListener::bind(&config.server.bind_address).await.map_err(|e| {
        GatewayError::config(format!("Failed to bind {}: {}", config.server.bind_address, e))
    })?;

    let served = serve(listener, state, shutdown_signal()).await;
    registry.shutdown().await;
    served
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
