//! Key Vault SecretProviderClass reconciliation.
//!
//! Two kube-runtime controllers share this module: one watches Ingresses,
//! one watches NginxIngressControllers. Both funnel into
//! [`reconcile_owner`], which converges the owner's SecretProviderClass and
//! turns unusable certificate references into Warning events.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::controller::common::{finish_reconcile, requeue_action};
use crate::controller::context::{Context, EventSink, publish_warning};
use crate::controller::error::{Error, Result};
use crate::crd::NginxIngressController;
use crate::resources::keyvault::{
    INVALID_INPUT_REASON, SpcIdentity, SpcOutcome, SpcOwner, ingress_uses_class, reconcile_spc,
};
use crate::resources::store::{ObjectStore, ResourceType};

/// Controller name for Ingress-owned SecretProviderClasses
pub const INGRESS_CONTROLLER_NAME: &str = "keyvault-ingress";

/// Controller name for NginxIngressController-owned SecretProviderClasses
pub const NGINX_CONTROLLER_NAME: &str = "keyvault-nginx";

/// Resync period for drift correction
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Ingress classes served by App Routing.
pub async fn managed_ingress_classes(store: &dyn ObjectStore) -> Result<Vec<String>> {
    let objects = store
        .list(
            &ResourceType::of::<NginxIngressController>(),
            None,
            &BTreeMap::new(),
        )
        .await?;
    let mut classes = Vec::with_capacity(objects.len());
    for object in objects {
        let nic: NginxIngressController = serde_json::from_value(serde_json::to_value(object)?)?;
        classes.push(nic.spec.ingress_class_name);
    }
    Ok(classes)
}

fn identity(ctx: &Context) -> SpcIdentity {
    SpcIdentity {
        tenant_id: ctx.config.tenant_id.clone(),
        client_id: ctx.config.msi_client_id.clone(),
    }
}

/// Converge the SecretProviderClass of any owner.
///
/// User-input errors are reported as a Warning event on the owner and are
/// not returned, so they are never retried.
pub async fn reconcile_owner(ctx: &Context, owner: SpcOwner<'_>, eligible: bool) -> Result<SpcOutcome> {
    converge_owner(
        ctx.store.as_ref(),
        ctx.events.as_ref(),
        &ctx.config.namespace,
        &identity(ctx),
        owner,
        eligible,
    )
    .await
}

/// [`reconcile_owner`] over explicit collaborators.
pub async fn converge_owner(
    store: &dyn ObjectStore,
    events: &dyn EventSink,
    operator_namespace: &str,
    identity: &SpcIdentity,
    owner: SpcOwner<'_>,
    eligible: bool,
) -> Result<SpcOutcome> {
    let outcome = reconcile_spc(store, &owner, eligible, operator_namespace, identity).await?;

    if let SpcOutcome::InvalidInput(message) = &outcome {
        warn!(kind = owner.kind(), name = %owner.name(), message = %message, "Invalid certificate reference");
        publish_warning(
            events,
            &owner.object_ref(),
            INVALID_INPUT_REASON,
            "Reconcile",
            Some(message.clone()),
        )
        .await;
    }
    debug!(kind = owner.kind(), name = %owner.name(), outcome = ?outcome, "SecretProviderClass reconciled");
    Ok(outcome)
}

/// Reconcile the SecretProviderClass of an Ingress.
pub async fn reconcile_ingress(ingress: Arc<Ingress>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let result: Result<Action> = async {
        let classes = managed_ingress_classes(ctx.store.as_ref()).await?;
        let eligible = ingress_uses_class(&ingress, &classes);
        reconcile_owner(&ctx, SpcOwner::Ingress(&ingress), eligible).await?;
        Ok(Action::requeue(RESYNC_INTERVAL))
    }
    .await;
    finish_reconcile(ctx.health_state.as_ref(), INGRESS_CONTROLLER_NAME, started, &result);
    result
}

/// Reconcile the default-certificate SecretProviderClass of an
/// NginxIngressController.
pub async fn reconcile_nginx(nic: Arc<NginxIngressController>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let result = reconcile_owner(&ctx, SpcOwner::NginxIngressController(&nic), true)
        .await
        .map(|_| Action::requeue(RESYNC_INTERVAL));
    finish_reconcile(ctx.health_state.as_ref(), NGINX_CONTROLLER_NAME, started, &result);
    result
}

pub fn ingress_error_policy(ingress: Arc<Ingress>, error: &Error, _ctx: Arc<Context>) -> Action {
    requeue_action(INGRESS_CONTROLLER_NAME, &ingress.name_any(), error)
}

pub fn nginx_error_policy(
    nic: Arc<NginxIngressController>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    requeue_action(NGINX_CONTROLLER_NAME, &nic.name_any(), error)
}
