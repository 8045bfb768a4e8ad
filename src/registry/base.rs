//! # Store-Backed Registry
//!
//! The registry of record: every call goes to the [`DocumentStore`]. The
//! caching layers wrap this type and delegate to it on a miss.
//!
//! Records written per entity:
//! - `service` keyed by `org:id:version`
//! - `application` keyed by `org:id:version`, stored with its contracts
//! - `serviceContract` keyed by API key, holding the application without its
//!   contracts and the service without its policies

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{Application, Service, ServiceContract, ServiceCoordinates, ServiceRequest};
use crate::observability::logging::redact_api_key;
use crate::registry::keys;
use crate::registry::store::{DocumentStore, DocumentType, FieldFilter};
use crate::registry::Registry;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Registry that reads and writes the durable store directly
pub struct StoreRegistry<S> {
    store: Arc<S>,
}

impl<S> Clone for StoreRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: DocumentStore> StoreRegistry<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Fetch an application record, contracts included
    pub async fn get_application(
        &self,
        organization_id: &str,
        application_id: &str,
        version: &str,
    ) -> GatewayResult<Option<Application>> {
        let id = keys::application_id(organization_id, application_id, version);
        match self.store.get(DocumentType::Application, &id).await? {
            Some(document) => Ok(Some(serde_json::from_value(document.source)?)),
            None => Ok(None),
        }
    }

    async fn fetch_service(&self, coordinates: &ServiceCoordinates) -> GatewayResult<Option<Service>> {
        let id = keys::service_id(
            &coordinates.organization_id,
            &coordinates.service_id,
            &coordinates.version,
        );
        match self.store.get(DocumentType::Service, &id).await? {
            Some(document) => Ok(Some(serde_json::from_value(document.source)?)),
            None => Ok(None),
        }
    }

    /// Replace the contract's embedded service with the live record, or fail if it was retired
    async fn check_service(&self, mut contract: ServiceContract) -> GatewayResult<ServiceContract> {
        let coordinates = contract.service.coordinates();
        match self.fetch_service(&coordinates).await? {
            Some(service) => {
                contract.service = service;
                Ok(contract)
            }
            None => Err(GatewayError::invalid_contract(format!(
                "Service {} in organization {} was retired",
                coordinates.service_id, coordinates.organization_id
            ))),
        }
    }

    /// Undo a partially written registration
    async fn rollback_registration(&self, application_id: &str, api_keys: &[String]) {
        for api_key in api_keys {
            if let Err(e) = self.store.delete(DocumentType::ServiceContract, api_key).await {
                warn!(api_key = %redact_api_key(api_key), error = %e, "Failed to roll back contract record");
            }
        }
        if let Err(e) = self.store.delete(DocumentType::Application, application_id).await {
            warn!(application = %application_id, error = %e, "Failed to roll back application record");
        }
    }
}

fn registration_store_error(err: impl std::fmt::Display) -> GatewayError {
    GatewayError::registration(format!("Registry store failure: {}", err))
}

fn publishing_store_error(err: impl std::fmt::Display) -> GatewayError {
    GatewayError::publishing(format!("Registry store failure: {}", err))
}

#[async_trait]
impl<S: DocumentStore> Registry for StoreRegistry<S> {
    async fn publish_service(&self, service: &Service) -> GatewayResult<()> {
        let coordinates = service.coordinates();
        let id = keys::service_id(&service.organization_id, &service.service_id, &service.version);
        let source = serde_json::to_value(service)?;

        let created = self
            .store
            .create(DocumentType::Service, &id, source)
            .await
            .map_err(publishing_store_error)?;
        if !created {
            return Err(GatewayError::publishing(format!(
                "Service already published: {}",
                coordinates
            )));
        }

        info!(service = %coordinates, "Service published");
        Ok(())
    }

    async fn retire_service(&self, service: &Service) -> GatewayResult<()> {
        let coordinates = service.coordinates();
        let id = keys::service_id(&service.organization_id, &service.service_id, &service.version);

        let deleted = self
            .store
            .delete(DocumentType::Service, &id)
            .await
            .map_err(publishing_store_error)?;
        if !deleted {
            return Err(GatewayError::publishing(format!("Service not found: {}", coordinates)));
        }

        info!(service = %coordinates, "Service retired");
        Ok(())
    }

    async fn register_application(&self, application: &Application) -> GatewayResult<()> {
        let app_label = format!(
            "{}/{}/{}",
            application.organization_id, application.application_id, application.version
        );
        if application.contracts.is_empty() {
            return Err(GatewayError::registration(format!(
                "No contracts found for application {}",
                app_label
            )));
        }

        // Validate every referenced service before writing anything
        let mut services: HashMap<ServiceCoordinates, Service> = HashMap::new();
        for contract in &application.contracts {
            let coordinates = contract.service_coordinates();
            if services.contains_key(&coordinates) {
                continue;
            }
            let service = self
                .fetch_service(&coordinates)
                .await
                .map_err(registration_store_error)?
                .ok_or_else(|| {
                    GatewayError::registration(format!(
                        "Service {} not found in organization {}",
                        contract.service_id, contract.service_org_id
                    ))
                })?;
            services.insert(coordinates, service);
        }

        let app_id = keys::application_id(
            &application.organization_id,
            &application.application_id,
            &application.version,
        );
        let created = self
            .store
            .create(DocumentType::Application, &app_id, serde_json::to_value(application)?)
            .await
            .map_err(registration_store_error)?;
        if !created {
            return Err(GatewayError::registration(format!(
                "Application already registered: {}",
                app_label
            )));
        }

        let owner = application.without_contracts();
        let mut written: Vec<String> = Vec::with_capacity(application.contracts.len());
        for contract in &application.contracts {
            let mut service = match services.get(&contract.service_coordinates()) {
                Some(service) => service.clone(),
                None => {
                    self.rollback_registration(&app_id, &written).await;
                    return Err(GatewayError::internal("Validated service missing during registration"));
                }
            };
            service.service_policies.clear();

            let record = ServiceContract::new(
                contract.api_key.clone(),
                service,
                owner.clone(),
                contract.plan.clone(),
                contract.policies.clone(),
            );
            let source = match serde_json::to_value(&record) {
                Ok(source) => source,
                Err(e) => {
                    self.rollback_registration(&app_id, &written).await;
                    return Err(e.into());
                }
            };

            match self
                .store
                .create(DocumentType::ServiceContract, &contract.api_key, source)
                .await
            {
                Ok(true) => written.push(contract.api_key.clone()),
                Ok(false) => {
                    self.rollback_registration(&app_id, &written).await;
                    return Err(GatewayError::registration(format!(
                        "Contract already published for API key {}",
                        redact_api_key(&contract.api_key)
                    )));
                }
                Err(e) => {
                    self.rollback_registration(&app_id, &written).await;
                    return Err(registration_store_error(e));
                }
            }
        }

        info!(application = %app_label, contracts = written.len(), "Application registered");
        Ok(())
    }

    async fn unregister_application(&self, application: &Application) -> GatewayResult<()> {
        let app_label = format!(
            "{}/{}/{}",
            application.organization_id, application.application_id, application.version
        );
        let app_id = keys::application_id(
            &application.organization_id,
            &application.application_id,
            &application.version,
        );

        let deleted = self
            .store
            .delete(DocumentType::Application, &app_id)
            .await
            .map_err(publishing_store_error)?;
        if !deleted {
            return Err(GatewayError::publishing(format!("Application not found: {}", app_label)));
        }

        let filters = [
            FieldFilter::new("/application/organizationId", application.organization_id.as_str()),
            FieldFilter::new("/application/applicationId", application.application_id.as_str()),
            FieldFilter::new("/application/version", application.version.as_str()),
        ];
        let removed = self
            .store
            .delete_by_query(DocumentType::ServiceContract, &filters)
            .await
            .map_err(publishing_store_error)?;

        info!(application = %app_label, contracts_removed = removed, "Application unregistered");
        Ok(())
    }

    async fn get_contract(&self, request: &ServiceRequest) -> GatewayResult<ServiceContract> {
        let api_key = request
            .api_key
            .as_deref()
            .ok_or_else(|| GatewayError::invalid_contract("No API key provided"))?;

        let document = self
            .store
            .get(DocumentType::ServiceContract, api_key)
            .await?
            .ok_or_else(|| {
                GatewayError::invalid_contract(format!(
                    "No contract found for API key {}",
                    redact_api_key(api_key)
                ))
            })?;

        let contract: ServiceContract = serde_json::from_value(document.source)?;
        debug!(api_key = %redact_api_key(api_key), service = %contract.service.coordinates(), "Contract loaded from store");
        self.check_service(contract).await
    }

    async fn get_service(
        &self,
        organization_id: &str,
        service_id: &str,
        version: &str,
    ) -> GatewayResult<Option<Service>> {
        self.fetch_service(&ServiceCoordinates::new(organization_id, service_id, version))
            .await
    }
}
