//! One-shot runnables executed once leadership is acquired.
//!
//! - [`DefaultNginxController`] makes sure the default NginxIngressController
//!   exists.
//! - [`LegacyCleanup`] purges objects shipped by earlier operator versions.
//!
//! Both retry with backoff until they succeed or shutdown fires.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::controller::common::retry_until_ok;
use crate::controller::error::Result;
use crate::controller::manager::Runnable;
use crate::crd::NginxIngressController;
use crate::resources::common::{COMPONENT_LABEL, top_level_labels};
use crate::resources::lifecycle::{clean, upsert};
use crate::resources::retriever::{CleanRetriever, TypeMapper};
use crate::resources::store::{GroupKind, ManagedObject, ObjectStore};

/// Components earlier releases deployed and this one no longer does.
pub const RETIRED_COMPONENTS: &[&str] = &["osm-integration", "keyvault-placeholder"];

/// Upsert the default NginxIngressController.
pub async fn ensure_default_controller(store: &dyn ObjectStore) -> Result<()> {
    let mut nic = NginxIngressController::default_instance();
    nic.metadata.labels = Some(top_level_labels());
    upsert(store, &ManagedObject::from_typed(&nic)?).await
}

/// Objects of retired components, plus kinds the operator stopped using.
pub fn legacy_retriever() -> CleanRetriever {
    let kinds = || {
        [
            GroupKind::of::<ConfigMap>(),
            GroupKind::of::<Deployment>(),
            GroupKind::of::<Service>(),
            GroupKind::of::<ServiceAccount>(),
            GroupKind::of::<Role>(),
            GroupKind::of::<RoleBinding>(),
            GroupKind::of::<ClusterRole>(),
            GroupKind::of::<ClusterRoleBinding>(),
        ]
    };
    let components = RETIRED_COMPONENTS
        .iter()
        .fold(CleanRetriever::empty(), |retriever, component| {
            let mut labels: BTreeMap<String, String> = top_level_labels();
            labels.insert(COMPONENT_LABEL.to_string(), (*component).to_string());
            retriever.add(&CleanRetriever::from_group_kinds(labels, kinds()))
        });
    components.add(&CleanRetriever::from_group_kinds(
        top_level_labels(),
        [GroupKind::new("policy", "PodSecurityPolicy")],
    ))
}

/// Runnable creating the default NginxIngressController.
pub struct DefaultNginxController {
    store: Arc<dyn ObjectStore>,
}

impl DefaultNginxController {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Runnable for DefaultNginxController {
    fn name(&self) -> &str {
        "default-nginx-ingress-controller"
    }

    async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        retry_until_ok(self.name(), &shutdown, || {
            ensure_default_controller(self.store.as_ref())
        })
        .await?;
        info!("Default NginxIngressController ensured");
        Ok(())
    }
}

/// Runnable purging objects of earlier operator versions.
pub struct LegacyCleanup {
    store: Arc<dyn ObjectStore>,
    mapper: Arc<dyn TypeMapper>,
}

impl LegacyCleanup {
    pub fn new(store: Arc<dyn ObjectStore>, mapper: Arc<dyn TypeMapper>) -> Self {
        Self { store, mapper }
    }
}

#[async_trait]
impl Runnable for LegacyCleanup {
    fn name(&self) -> &str {
        "legacy-cleanup"
    }

    async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let retriever = legacy_retriever();
        retry_until_ok(self.name(), &shutdown, || {
            clean(self.store.as_ref(), self.mapper.as_ref(), &retriever)
        })
        .await?;
        info!("Legacy resources cleaned");
        Ok(())
    }
}
