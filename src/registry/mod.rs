//! # Registry Module
//!
//! Resolves and caches routing metadata: published services, registered
//! applications and the per-API-key contracts that tie them together.
//!
//! Three layers implement the same [`Registry`] trait:
//! - [`StoreRegistry`] goes to the durable store on every call
//! - [`CachingRegistry`] keeps an in-process cache, correct for one node
//! - [`PollingCachingRegistry`] keeps that cache correct across a cluster by
//!   polling a shared data-version marker
//!
//! ## Staleness
//!
//! A `PollingCachingRegistry` node may serve cached data for up to one poll
//! interval after another node mutates the shared store. The window is
//! bounded by `cache_polling_interval`.

pub mod base;
pub mod caching;
pub mod keys;
pub mod polling;
pub mod seed;
pub mod store;
pub mod stores;

pub use base::StoreRegistry;
pub use caching::{CacheStats, CachingRegistry};
pub use polling::PollingCachingRegistry;
pub use store::{DocumentStore, DocumentType, FieldFilter, StoreError, StoreResult, StoredDocument};
pub use stores::{InMemoryStore, RedisStore};

use crate::core::config::{CachingMode, RegistryConfig, StoreConfig};
use crate::core::error::GatewayResult;
use crate::core::types::{Application, Service, ServiceContract, ServiceRequest};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Service registry operations
///
/// Each method resolves exactly once with success or failure. Mutations are
/// administrative; `get_contract` and `get_service` sit on the request path.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Publish a service version. Fails with `Publishing` if it is already live.
    async fn publish_service(&self, service: &Service) -> GatewayResult<()>;

    /// Retire a service version. Fails with `Publishing` if it is not live.
    async fn retire_service(&self, service: &Service) -> GatewayResult<()>;

    /// Register an application and one contract record per API key
    async fn register_application(&self, application: &Application) -> GatewayResult<()>;

    /// Remove an application and every contract record that references it
    async fn unregister_application(&self, application: &Application) -> GatewayResult<()>;

    /// Resolve the contract behind the request's API key
    async fn get_contract(&self, request: &ServiceRequest) -> GatewayResult<ServiceContract>;

    async fn get_service(
        &self,
        organization_id: &str,
        service_id: &str,
        version: &str,
    ) -> GatewayResult<Option<Service>>;

    /// Stop background work owned by the registry
    async fn shutdown(&self) {}
}

/// Build the registry stack described by the configuration
pub async fn build_registry(config: &RegistryConfig) -> GatewayResult<Arc<dyn Registry>> {
    match &config.store {
        StoreConfig::Memory => Ok(layer(Arc::new(InMemoryStore::new()), config)),
        StoreConfig::Redis { url, key_prefix } => {
            let store = RedisStore::connect(url, key_prefix).await?;
            Ok(layer(Arc::new(store), config))
        }
    }
}

fn layer<S: DocumentStore + 'static>(store: Arc<S>, config: &RegistryConfig) -> Arc<dyn Registry> {
    info!(caching = ?config.caching, "Building registry");
    match config.caching {
        CachingMode::None => Arc::new(StoreRegistry::new(store)),
        CachingMode::Local => Arc::new(CachingRegistry::new(store)),
        CachingMode::Polling => Arc::new(PollingCachingRegistry::new(store, config.cache_polling_interval)),
    }
}
