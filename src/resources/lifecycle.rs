//! Managed-resource lifecycle protocol.
//!
//! Keeps "should this object exist" and "does this object exist" in step for a
//! controller's resource set:
//!
//! - desired objects are upserted with server-side apply;
//! - previously owned objects that are no longer desired are deleted;
//! - nothing without the top-level labels, and no Namespace, is ever deleted.
//!
//! Every object in a batch is attempted; failures are aggregated.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Namespace;
use kube::ResourceExt;
use kube::api::DynamicObject;
use tracing::{debug, info, warn};

use crate::controller::context::FIELD_MANAGER;
use crate::controller::error::{Error, Result};
use crate::resources::common::is_managed;
use crate::resources::retriever::{CleanRetriever, CompareStrategy, TypeDescriptor, TypeMapper};
use crate::resources::store::{GroupKind, ManagedObject, ObjectKey, ObjectStore, ResourceType};

/// Whether the resource type is categorically exempt from deletion.
pub fn is_protected(resource: &ResourceType) -> bool {
    resource.group_kind() == GroupKind::of::<Namespace>()
}

/// Retriever matching the Namespace kind, removed from every cleanup pass.
pub fn protected_kinds() -> CleanRetriever {
    CleanRetriever::from_group_kinds(Default::default(), [GroupKind::of::<Namespace>()])
}

/// Apply `object`, creating it when the apply reports it missing.
pub async fn upsert(store: &dyn ObjectStore, object: &ManagedObject) -> Result<()> {
    match store.apply(object, FIELD_MANAGER).await {
        Ok(_) => {
            debug!(object = %object.key(), "Upserted object");
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            debug!(object = %object.key(), "Apply found no object, creating");
            store.create(object).await?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Delete an observed object if, and only if, this operator owns it.
///
/// Returns whether a delete was issued.
pub async fn delete_if_managed(
    store: &dyn ObjectStore,
    resource: &ResourceType,
    object: &DynamicObject,
) -> Result<bool> {
    let key = ObjectKey::of(resource, object);
    if is_protected(resource) {
        debug!(object = %key, "Refusing to delete protected kind");
        return Ok(false);
    }
    if !is_managed(&object.metadata) {
        debug!(object = %key, "Object lacks managed-by labels, leaving it");
        return Ok(false);
    }
    info!(object = %key, "Deleting object no longer desired");
    store
        .delete(resource, object.namespace().as_deref(), &object.name_any())
        .await?;
    Ok(true)
}

/// Converge a resource set.
///
/// Upserts `desired`, then deletes every managed object matched by an
/// `observed` descriptor that is not part of `desired`.
pub async fn reconcile_set(
    store: &dyn ObjectStore,
    desired: &[ManagedObject],
    observed: &[TypeDescriptor],
) -> Result<()> {
    let mut errors = Vec::new();

    for object in desired {
        if let Err(e) = upsert(store, object).await {
            warn!(object = %object.key(), error = %e, "Failed to upsert object");
            errors.push(e);
        }
    }

    let desired_keys: Vec<ObjectKey> = desired.iter().map(ManagedObject::key).collect();
    // Keyed without the version: one kind may be observed under several.
    let mut visited: Vec<ObjectKey> = Vec::new();
    for descriptor in observed {
        let existing = match store.list(&descriptor.resource, None, &descriptor.labels).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!(resource = %descriptor.resource, error = %e, "Failed to list objects");
                errors.push(e);
                continue;
            }
        };
        for object in existing {
            let key = ObjectKey::of(&descriptor.resource, &object);
            if desired_keys.iter().any(|d| d.same_object(&key))
                || visited.iter().any(|v| v.same_object(&key))
            {
                continue;
            }
            visited.push(key.clone());
            if let Err(e) = delete_if_managed(store, &descriptor.resource, &object).await {
                warn!(object = %key, error = %e, "Failed to delete object");
                errors.push(e);
            }
        }
    }

    Error::from_batch(errors)
}

/// Delete every managed object `retriever` describes.
///
/// The Namespace kind is always removed from the retriever first.
pub async fn clean(
    store: &dyn ObjectStore,
    mapper: &dyn TypeMapper,
    retriever: &CleanRetriever,
) -> Result<()> {
    let descriptors = retriever
        .remove(&protected_kinds(), CompareStrategy::IgnoreLabels)
        .retrieve(mapper)?;
    let descriptors: Vec<TypeDescriptor> = descriptors
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    debug!(count = descriptors.len(), "Running cleanup pass");
    reconcile_set(store, &[], &descriptors).await
}
