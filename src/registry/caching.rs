//! # Caching Registry
//!
//! Single-node cache over [`StoreRegistry`]: services, applications and
//! contracts live in three maps behind one mutex.
//!
//! A contract hit never trusts the service it was cached with. The service is
//! looked up again through the service cache, so a retired service is noticed
//! as soon as its cache entry is gone.
//!
//! Every eviction bumps a generation counter. Populating reads capture the
//! generation before going to the store and drop their result if it moved,
//! so an in-flight load can never resurrect something just evicted.

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{Application, Policy, Service, ServiceContract, ServiceCoordinates, ServiceRequest};
use crate::observability::logging::redact_api_key;
use crate::registry::base::StoreRegistry;
use crate::registry::keys;
use crate::registry::store::DocumentStore;
use crate::registry::Registry;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Cached contract; the service half is resolved at lookup time
#[derive(Debug, Clone)]
struct ContractEntry {
    api_key: String,
    service: ServiceCoordinates,
    application: Application,
    plan: String,
    policies: Vec<Policy>,
}

impl ContractEntry {
    fn from_contract(contract: &ServiceContract) -> Self {
        Self {
            api_key: contract.api_key.clone(),
            service: contract.service.coordinates(),
            application: contract.application.clone(),
            plan: contract.plan.clone(),
            policies: contract.policies.clone(),
        }
    }

    fn resolve(self, service: Service) -> ServiceContract {
        ServiceContract::new(self.api_key, service, self.application, self.plan, self.policies)
    }

    fn belongs_to(&self, application: &Application) -> bool {
        self.application.organization_id == application.organization_id
            && self.application.application_id == application.application_id
            && self.application.version == application.version
    }
}

#[derive(Debug, Default)]
struct RegistryCache {
    services: HashMap<String, Service>,
    applications: HashMap<String, Application>,
    contracts: HashMap<String, ContractEntry>,
    generation: u64,
}

impl RegistryCache {
    fn clear(&mut self) {
        self.services.clear();
        self.applications.clear();
        self.contracts.clear();
        self.generation += 1;
    }

    fn insert_application(&mut self, application: &Application) {
        let key = keys::application_cache_key(
            &application.organization_id,
            &application.application_id,
            &application.version,
        );
        let owner = application.without_contracts();
        for contract in &application.contracts {
            self.contracts.insert(
                keys::contract_cache_key(&contract.api_key),
                ContractEntry {
                    api_key: contract.api_key.clone(),
                    service: contract.service_coordinates(),
                    application: owner.clone(),
                    plan: contract.plan.clone(),
                    policies: contract.policies.clone(),
                },
            );
        }
        self.applications.insert(key, application.clone());
    }
}

/// Entry counts per cache map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub services: usize,
    pub applications: usize,
    pub contracts: usize,
}

/// Registry with an in-process cache
pub struct CachingRegistry<S> {
    base: Arc<StoreRegistry<S>>,
    cache: Arc<Mutex<RegistryCache>>,
}

impl<S> Clone for CachingRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            base: self.base.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<S: DocumentStore + 'static> CachingRegistry<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            base: Arc::new(StoreRegistry::new(store)),
            cache: Arc::new(Mutex::new(RegistryCache::default())),
        }
    }

    /// The uncached registry underneath
    pub fn base(&self) -> &StoreRegistry<S> {
        &self.base
    }

    /// Drop every cached entry, all three maps at once
    pub fn invalidate_cache(&self) {
        self.cache.lock().clear();
        debug!("Registry cache invalidated");
    }

    /// Cache an application and an unresolved contract entry per API key
    pub fn cache_application(&self, application: &Application) {
        self.cache.lock().insert_application(application);
    }

    pub fn cache_stats(&self) -> CacheStats {
        let cache = self.cache.lock();
        CacheStats {
            services: cache.services.len(),
            applications: cache.applications.len(),
            contracts: cache.contracts.len(),
        }
    }

    fn generation(&self) -> u64 {
        self.cache.lock().generation
    }

    /// Load the full application behind a freshly resolved contract in the background
    fn warm_application(&self, application: &Application, generation: u64) {
        let base = self.base.clone();
        let cache = self.cache.clone();
        let organization_id = application.organization_id.clone();
        let application_id = application.application_id.clone();
        let version = application.version.clone();

        tokio::spawn(async move {
            let label = format!("{}/{}/{}", organization_id, application_id, version);
            match base.get_application(&organization_id, &application_id, &version).await {
                Ok(Some(application)) => {
                    let mut cache = cache.lock();
                    if cache.generation == generation {
                        cache.insert_application(&application);
                        debug!(application = %label, contracts = application.contracts.len(), "Application cache warmed");
                    }
                }
                Ok(None) => warn!(application = %label, "Application behind a resolved contract is no longer registered"),
                Err(e) => warn!(application = %label, error = %e, "Failed to warm application cache"),
            }
        });
    }
}

#[async_trait]
impl<S: DocumentStore + 'static> Registry for CachingRegistry<S> {
    async fn publish_service(&self, service: &Service) -> GatewayResult<()> {
        self.base.publish_service(service).await
    }

    async fn retire_service(&self, service: &Service) -> GatewayResult<()> {
        self.base.retire_service(service).await?;

        let key = keys::service_cache_key(&service.organization_id, &service.service_id, &service.version);
        let mut cache = self.cache.lock();
        cache.services.remove(&key);
        cache.generation += 1;
        Ok(())
    }

    async fn register_application(&self, application: &Application) -> GatewayResult<()> {
        self.base.register_application(application).await
    }

    async fn unregister_application(&self, application: &Application) -> GatewayResult<()> {
        self.base.unregister_application(application).await?;

        let key = keys::application_cache_key(
            &application.organization_id,
            &application.application_id,
            &application.version,
        );
        let mut cache = self.cache.lock();
        cache.applications.remove(&key);
        cache.contracts.retain(|_, entry| !entry.belongs_to(application));
        cache.generation += 1;
        Ok(())
    }

    async fn get_contract(&self, request: &ServiceRequest) -> GatewayResult<ServiceContract> {
        let api_key = request
            .api_key
            .as_deref()
            .ok_or_else(|| GatewayError::invalid_contract("No API key provided"))?;
        let key = keys::contract_cache_key(api_key);

        let (cached, generation) = {
            let cache = self.cache.lock();
            (cache.contracts.get(&key).cloned(), cache.generation)
        };

        if let Some(entry) = cached {
            debug!(api_key = %redact_api_key(api_key), "Contract cache hit");
            let coordinates = entry.service.clone();
            let service = self
                .get_service(&coordinates.organization_id, &coordinates.service_id, &coordinates.version)
                .await?
                .ok_or_else(|| {
                    GatewayError::invalid_contract(format!(
                        "Service {} in organization {} was retired",
                        coordinates.service_id, coordinates.organization_id
                    ))
                })?;
            return Ok(entry.resolve(service));
        }

        debug!(api_key = %redact_api_key(api_key), "Contract cache miss");
        let contract = self.base.get_contract(request).await?;

        {
            let mut cache = self.cache.lock();
            if cache.generation == generation {
                cache.contracts.insert(key, ContractEntry::from_contract(&contract));
                let service = &contract.service;
                cache.services.insert(
                    keys::service_cache_key(&service.organization_id, &service.service_id, &service.version),
                    service.clone(),
                );
            }
        }
        self.warm_application(&contract.application, generation);

        Ok(contract)
    }

    async fn get_service(
        &self,
        organization_id: &str,
        service_id: &str,
        version: &str,
    ) -> GatewayResult<Option<Service>> {
        let key = keys::service_cache_key(organization_id, service_id, version);
        let (cached, generation) = {
            let cache = self.cache.lock();
            (cache.services.get(&key).cloned(), cache.generation)
        };
        if cached.is_some() {
            return Ok(cached);
        }

        let service = self.base.get_service(organization_id, service_id, version).await?;
        if let Some(service) = &service {
            let mut cache = self.cache.lock();
            if cache.generation == generation {
                cache.services.insert(key, service.clone());
            }
        }
        Ok(service)
    }
}
