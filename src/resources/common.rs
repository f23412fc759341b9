//! Common resource generation utilities.
//!
//! Provides the top-level label set stamped on every managed object, the
//! ownership checks used before deletion, and owner reference helpers.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

/// Label key marking objects created by this operator
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`] on objects created by this operator
pub const MANAGED_BY_VALUE: &str = "aks-app-routing-operator";

/// Label key naming the component an object belongs to
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";

/// Label key naming the application an object belongs to
pub const NAME_LABEL: &str = "app.kubernetes.io/name";

/// Namespace the operator deploys shared components into
pub const DEFAULT_OPERATOR_NAMESPACE: &str = "app-routing-system";

/// Labels applied to every object this operator creates.
///
/// An object lacking any of these is never deleted by the operator.
pub fn top_level_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string())])
}

/// Top-level labels plus component-specific ones.
pub fn standard_labels(name: &str, component: &str) -> BTreeMap<String, String> {
    let mut labels = top_level_labels();
    labels.insert(NAME_LABEL.to_string(), name.to_string());
    labels.insert(COMPONENT_LABEL.to_string(), component.to_string());
    labels
}

/// Whether `labels` contains every entry of `required` with an equal value.
pub fn has_labels(labels: &BTreeMap<String, String>, required: &BTreeMap<String, String>) -> bool {
    required
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

/// Whether the object carries the full top-level label set.
pub fn is_managed(meta: &ObjectMeta) -> bool {
    meta.labels
        .as_ref()
        .is_some_and(|labels| has_labels(labels, &top_level_labels()))
}

/// Render match labels as a Kubernetes label selector string.
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Create a controlling owner reference for any typed resource.
pub fn owner_reference<K>(owner: &K) -> OwnerReference
where
    K: Resource<DynamicType = ()>,
{
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: owner.name_any(),
        uid: owner.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Object metadata with the standard labels and an optional owner.
pub fn managed_meta(
    name: &str,
    namespace: Option<&str>,
    labels: BTreeMap<String, String>,
    owner: Option<OwnerReference>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(labels),
        owner_references: owner.map(|o| vec![o]),
        ..Default::default()
    }
}
