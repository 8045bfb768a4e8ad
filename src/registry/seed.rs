//! Startup seeding of the registry from a YAML file.
//!
//! ```yaml
//! services:
//!   - organizationId: T
//!     serviceId: echo
//!     version: "1.0"
//!     endpoint: http://localhost:9000/
//! applications:
//!   - organizationId: T
//!     applicationId: app
//!     version: "1.0"
//!     contracts:
//!       - apiKey: "12345"
//!         serviceOrgId: T
//!         serviceId: echo
//!         serviceVersion: "1.0"
//!         plan: P
//! ```

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{Application, Service, ServiceRequest};
use crate::registry::Registry;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedFile {
    pub services: Vec<Service>,
    pub applications: Vec<Application>,
}

impl SeedFile {
    pub async fn load<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await.map_err(|e| {
            GatewayError::config(format!(
                "Failed to read seed file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Publish every service, then register every application
    ///
    /// Entries already present in the registry are skipped, so a node
    /// restarting against a durable store can apply the same file again.
    pub async fn apply(&self, registry: &dyn Registry) -> GatewayResult<()> {
        let mut published = 0;
        for service in &self.services {
            let existing = registry
                .get_service(&service.organization_id, &service.service_id, &service.version)
                .await?;
            if existing.is_some() {
                debug!(service = %service.coordinates(), "Seed service already published");
                continue;
            }
            registry.publish_service(service).await?;
            published += 1;
        }

        let mut registered = 0;
        for application in &self.applications {
            if is_registered(registry, application).await {
                debug!(application = %application.application_id, "Seed application already registered");
                continue;
            }
            registry.register_application(application).await?;
            registered += 1;
        }

        info!(services = published, applications = registered, "Registry seeded");
        Ok(())
    }
}

/// Every contract of the application already resolves
async fn is_registered(registry: &dyn Registry, application: &Application) -> bool {
    if application.contracts.is_empty() {
        return false;
    }
    for contract in &application.contracts {
        let request = ServiceRequest::new(
            contract.service_org_id.as_str(),
            contract.service_id.as_str(),
            contract.service_version.as_str(),
        )
        .with_api_key(contract.api_key.as_str());
        if registry.get_contract(&request).await.is_err() {
            return false;
        }
    }
    true
}
