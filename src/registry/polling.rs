//! # Cluster-Aware Polling Registry
//!
//! [`CachingRegistry`] for deployments where several gateway nodes share one
//! durable store. Every successful mutation rewrites a single data-version
//! marker record. A background task reads the marker on a fixed interval and
//! clears the whole local cache unless the marker's revision matches the one
//! it saw last time. A missing marker or a failed read also clears the cache.
//!
//! Between a remote mutation and the next tick a node can serve stale data.
//! That window is at most one polling interval.

use crate::core::error::GatewayResult;
use crate::core::types::{Application, Service, ServiceContract, ServiceRequest};
use crate::registry::caching::{CacheStats, CachingRegistry};
use crate::registry::keys::DATA_VERSION_ID;
use crate::registry::store::{DocumentStore, DocumentType};
use crate::registry::Registry;
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Caching registry kept coherent across nodes by polling the data-version marker
pub struct PollingCachingRegistry<S> {
    caching: CachingRegistry<S>,

    /// Marker revision observed by the last check
    last_seen: Arc<Mutex<Option<u64>>>,

    shutdown: CancellationToken,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl<S: DocumentStore + 'static> PollingCachingRegistry<S> {
    /// Create the registry and start its polling task
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(store: Arc<S>, polling_interval: Duration) -> Self {
        let caching = CachingRegistry::new(store);
        let last_seen = Arc::new(Mutex::new(None));
        let shutdown = CancellationToken::new();

        let poller = {
            let caching = caching.clone();
            let last_seen = last_seen.clone();
            let shutdown = shutdown.clone();

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(polling_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick completes immediately
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            let check = AssertUnwindSafe(check_cache_version(&caching, &last_seen)).catch_unwind();
                            if check.await.is_err() {
                                error!("Cache version check panicked, polling continues");
                            }
                        }
                    }
                }
                debug!("Cache version poller stopped");
            })
        };

        info!(interval = ?polling_interval, "Cache version poller started");

        Self {
            caching,
            last_seen,
            shutdown,
            poller: Mutex::new(Some(poller)),
        }
    }

    /// The node-local caching layer
    pub fn caching(&self) -> &CachingRegistry<S> {
        &self.caching
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.caching.cache_stats()
    }

    /// Run one marker check now, outside the polling schedule
    pub async fn check_cache_version(&self) {
        check_cache_version(&self.caching, &self.last_seen).await;
    }

    /// Stop the polling task and wait for it to exit
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let poller = self.poller.lock().take();
        if let Some(poller) = poller {
            if let Err(e) = poller.await {
                warn!(error = %e, "Cache version poller ended abnormally");
            }
        }
    }

    /// Record that this node changed the shared store
    async fn update_data_version(&self) {
        let marker = json!({ "updatedOn": Utc::now().timestamp_millis() });
        match self
            .caching
            .base()
            .store()
            .put(DocumentType::DataVersion, DATA_VERSION_ID, marker)
            .await
        {
            Ok(revision) => debug!(revision, "Data version marker updated"),
            Err(e) => error!(error = %e, "Failed to update data version marker"),
        }
        // Forget the last revision so this node's next check invalidates too
        *self.last_seen.lock() = None;
    }
}

async fn check_cache_version<S: DocumentStore + 'static>(
    caching: &CachingRegistry<S>,
    last_seen: &Mutex<Option<u64>>,
) {
    let latest = caching
        .base()
        .store()
        .get(DocumentType::DataVersion, DATA_VERSION_ID)
        .await;

    let fresh = match latest {
        Ok(Some(marker)) => {
            let mut seen = last_seen.lock();
            let unchanged = *seen == Some(marker.version);
            *seen = Some(marker.version);
            unchanged
        }
        Ok(None) => {
            *last_seen.lock() = None;
            false
        }
        Err(e) => {
            warn!(error = %e, "Failed to read data version marker, assuming stale cache");
            *last_seen.lock() = None;
            false
        }
    };

    if !fresh {
        caching.invalidate_cache();
    }
}

impl<S> Drop for PollingCachingRegistry<S> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl<S: DocumentStore + 'static> Registry for PollingCachingRegistry<S> {
    async fn publish_service(&self, service: &Service) -> GatewayResult<()> {
        self.caching.publish_service(service).await?;
        self.update_data_version().await;
        Ok(())
    }

    async fn retire_service(&self, service: &Service) -> GatewayResult<()> {
        self.caching.retire_service(service).await?;
        self.update_data_version().await;
        Ok(())
    }

    async fn register_application(&self, application: &Application) -> GatewayResult<()> {
        self.caching.register_application(application).await?;
        self.update_data_version().await;
        Ok(())
    }

    async fn unregister_application(&self, application: &Application) -> GatewayResult<()> {
        self.caching.unregister_application(application).await?;
        self.update_data_version().await;
        Ok(())
    }

    async fn get_contract(&self, request: &ServiceRequest) -> GatewayResult<ServiceContract> {
        self.caching.get_contract(request).await
    }

    async fn get_service(
        &self,
        organization_id: &str,
        service_id: &str,
        version: &str,
    ) -> GatewayResult<Option<Service>> {
        self.caching.get_service(organization_id, service_id, version).await
    }

    async fn shutdown(&self) {
        self.stop().await;
    }
}
