//! External DNS reconciliation.
//!
//! Runs on an interval rather than on watch events: its inputs are process
//! configuration, and its outputs drift only through outside edits.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::Config;
use crate::controller::common::Tick;
use crate::controller::error::{Error, Result};
use crate::resources::external_dns::{InstanceAction, instances};
use crate::resources::lifecycle::{clean, reconcile_set};
use crate::resources::retriever::{CleanRetriever, TypeMapper};
use crate::resources::store::ObjectStore;

/// Controller name used in metrics and logs
pub const CONTROLLER_NAME: &str = "external-dns";

/// Deploy every instance with zones, clean every instance without.
pub async fn reconcile_dns(
    store: &dyn ObjectStore,
    mapper: &dyn TypeMapper,
    config: &Config,
) -> Result<()> {
    let mut errors = Vec::new();
    let mut unwanted = CleanRetriever::empty();

    for instance in instances(config)? {
        let name = instance.config.resource_name();
        match instance.action {
            InstanceAction::Deploy => {
                debug!(instance = name, zones = instance.config.zones.len(), "Deploying external-dns");
                let result = match instance.retriever().retrieve(mapper) {
                    Ok(observed) => reconcile_set(store, &instance.resources, &observed).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!(instance = name, error = %e, "Failed to deploy external-dns");
                    errors.push(e);
                }
            }
            InstanceAction::Clean => {
                debug!(instance = name, "Cleaning external-dns");
                unwanted = unwanted.add(&instance.retriever());
            }
        }
    }

    if let Err(e) = clean(store, mapper, &unwanted).await {
        warn!(error = %e, "Failed to clean unused external-dns instances");
        errors.push(e);
    }
    Error::from_batch(errors)
}

/// Interval-triggered external DNS reconciler.
pub struct DnsReconciler {
    store: Arc<dyn ObjectStore>,
    mapper: Arc<dyn TypeMapper>,
    config: Arc<Config>,
}

impl DnsReconciler {
    pub fn new(store: Arc<dyn ObjectStore>, mapper: Arc<dyn TypeMapper>, config: Arc<Config>) -> Self {
        Self {
            store,
            mapper,
            config,
        }
    }
}

#[async_trait]
impl Tick for DnsReconciler {
    async fn tick(&mut self) -> Result<()> {
        reconcile_dns(self.store.as_ref(), self.mapper.as_ref(), &self.config).await
    }
}
