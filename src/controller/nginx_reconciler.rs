//! NginxIngressController reconciliation.
//!
//! Converges the object graph of each NginxIngressController and reports an
//! `Available` condition. Objects left over from an earlier spec (for
//! example the IngressClass of a renamed class) are deleted through the
//! guarded lifecycle delete.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::controller::common::{finish_reconcile, requeue_action};
use crate::controller::context::{Context, FIELD_MANAGER};
use crate::controller::error::{Error, Result};
use crate::controller::status::ConditionBuilder;
use crate::crd::{NginxIngressController, NginxIngressControllerStatus};
use crate::resources::lifecycle::reconcile_set;
use crate::resources::nginx::{controller_labels, desired_resources};
use crate::resources::retriever::CleanRetriever;

/// Controller name used in metrics and logs
pub const CONTROLLER_NAME: &str = "nginx-ingress-controller";

/// Resync period for drift correction
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Reconcile an NginxIngressController.
pub async fn reconcile(nic: Arc<NginxIngressController>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let result = converge(&nic, &ctx).await;
    finish_reconcile(ctx.health_state.as_ref(), CONTROLLER_NAME, started, &result);
    result
}

async fn converge(nic: &NginxIngressController, ctx: &Context) -> Result<Action> {
    let name = nic.name_any();
    if nic.metadata.deletion_timestamp.is_some() {
        debug!(name = %name, "NginxIngressController is being deleted, owned objects are garbage collected");
        return Ok(Action::await_change());
    }
    debug!(name = %name, "Reconciling NginxIngressController");

    let desired = desired_resources(nic, &ctx.config.namespace)?;
    let observed = CleanRetriever::from_objects(&desired, controller_labels(nic))
        .retrieve(ctx.mapper.as_ref())?;
    let applied = reconcile_set(ctx.store.as_ref(), &desired, &observed).await;

    if let Err(e) = &applied {
        warn!(name = %name, error = %e, "Failed to converge managed objects");
        ctx.publish_warning_event(nic, "ApplyFailed", "Reconcile", Some(e.to_string()))
            .await;
    }
    let status = converged_status(nic, &applied);
    update_status(ctx, &name, status).await?;

    applied?;
    info!(name = %name, objects = desired.len(), "NginxIngressController reconciled");
    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Status reporting the outcome of one convergence pass.
pub fn converged_status(
    nic: &NginxIngressController,
    applied: &Result<()>,
) -> NginxIngressControllerStatus {
    let generation = nic.metadata.generation;
    let previous = nic
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default();
    let mut conditions = ConditionBuilder::from_existing(previous);
    match applied {
        Ok(()) => {
            conditions
                .available(true, "Reconciled", "All managed objects are applied", generation)
                .degraded(false, "Reconciled", "", generation);
        }
        Err(e) => {
            conditions
                .available(false, "ApplyFailed", &e.to_string(), generation)
                .degraded(true, "ApplyFailed", &e.to_string(), generation);
        }
    }
    NginxIngressControllerStatus {
        conditions: conditions.build(),
        observed_generation: generation,
    }
}

async fn update_status(ctx: &Context, name: &str, status: NginxIngressControllerStatus) -> Result<()> {
    let api: Api<NginxIngressController> = Api::all(ctx.client.clone());
    let patch = json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Error policy for the NginxIngressController controller
pub fn error_policy(nic: Arc<NginxIngressController>, error: &Error, _ctx: Arc<Context>) -> Action {
    requeue_action(CONTROLLER_NAME, &nic.name_any(), error)
}
