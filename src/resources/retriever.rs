//! Composable descriptions of what the cleanup pass may garbage collect.
//!
//! A [`CleanRetriever`] is an immutable combinator value. Resolving it against
//! a [`TypeMapper`] yields [`TypeDescriptor`]s: a storage resource plus the
//! labels an object of that resource must carry to be a cleanup candidate.
//!
//! ```
//! use std::collections::BTreeMap;
//! use app_routing_operator::resources::retriever::{CleanRetriever, CompareStrategy};
//! use app_routing_operator::resources::store::GroupKind;
//!
//! let legacy = CleanRetriever::from_group_kinds(
//!     BTreeMap::new(),
//!     [GroupKind::new("apps", "Deployment"), GroupKind::new("", "Namespace")],
//! );
//! let namespaces = CleanRetriever::from_group_kinds(BTreeMap::new(), [GroupKind::new("", "Namespace")]);
//! let retriever = CleanRetriever::empty()
//!     .add(&legacy)
//!     .remove(&namespaces, CompareStrategy::IgnoreLabels);
//! # let _ = retriever;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::{Ingress, IngressClass};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use kube::discovery::Discovery;
use tracing::debug;

use crate::controller::error::{Error, Result};
use crate::resources::store::{GroupKind, ManagedObject, ResourceType};

/// A resource type plus the labels its cleanup candidates carry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeDescriptor {
    pub resource: ResourceType,
    pub labels: BTreeMap<String, String>,
}

/// How [`CleanRetriever::remove`] matches descriptors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareStrategy {
    /// Resource type and labels must be equal.
    Everything,
    /// Only the resource type (group and plural) must be equal.
    IgnoreLabels,
}

impl CompareStrategy {
    pub fn matches(self, a: &TypeDescriptor, b: &TypeDescriptor) -> bool {
        match self {
            CompareStrategy::Everything => a == b,
            CompareStrategy::IgnoreLabels => a.resource.same_resource(&b.resource),
        }
    }
}

/// Resolves a group/kind to the storage resources serving it.
///
/// A kind can be served by several API versions. Returns
/// [`Error::UnknownResourceType`] when the cluster does not serve the kind.
pub trait TypeMapper: Send + Sync {
    fn resources_for(&self, gk: &GroupKind) -> Result<Vec<ResourceType>>;
}

/// Type mapper over a fixed table of resource types.
#[derive(Clone, Debug, Default)]
pub struct StaticTypeMapper {
    resources: Vec<ResourceType>,
}

impl StaticTypeMapper {
    pub fn new(resources: Vec<ResourceType>) -> Self {
        Self { resources }
    }

    /// Built-in kinds the operator creates or has shipped.
    pub fn builtin() -> Self {
        Self::new(vec![
            ResourceType::of::<Namespace>(),
            ResourceType::of::<ConfigMap>(),
            ResourceType::of::<Secret>(),
            ResourceType::of::<Service>(),
            ResourceType::of::<ServiceAccount>(),
            ResourceType::of::<Deployment>(),
            ResourceType::of::<Ingress>(),
            ResourceType::of::<IngressClass>(),
            ResourceType::of::<PodDisruptionBudget>(),
            ResourceType::of::<Role>(),
            ResourceType::of::<RoleBinding>(),
            ResourceType::of::<ClusterRole>(),
            ResourceType::of::<ClusterRoleBinding>(),
        ])
    }

    pub fn with(mut self, resource: ResourceType) -> Self {
        self.resources.push(resource);
        self
    }
}

impl TypeMapper for StaticTypeMapper {
    fn resources_for(&self, gk: &GroupKind) -> Result<Vec<ResourceType>> {
        let found: Vec<ResourceType> = self
            .resources
            .iter()
            .filter(|r| r.group == gk.group && r.kind == gk.kind)
            .cloned()
            .collect();
        if found.is_empty() {
            return Err(Error::UnknownResourceType {
                group: gk.group.clone(),
                kind: gk.kind.clone(),
            });
        }
        Ok(found)
    }
}

/// Type mapper backed by a completed API discovery run.
pub struct DiscoveryTypeMapper {
    discovery: Discovery,
}

impl DiscoveryTypeMapper {
    pub async fn run(client: kube::Client) -> Result<Self> {
        let discovery = Discovery::new(client).run().await?;
        Ok(Self { discovery })
    }
}

impl TypeMapper for DiscoveryTypeMapper {
    fn resources_for(&self, gk: &GroupKind) -> Result<Vec<ResourceType>> {
        let mut found = Vec::new();
        for group in self.discovery.groups().filter(|g| g.name() == gk.group) {
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    if ar.kind == gk.kind {
                        found.push(ResourceType {
                            group: ar.group.clone(),
                            version: ar.version.clone(),
                            kind: ar.kind.clone(),
                            plural: ar.plural.clone(),
                            namespaced: matches!(caps.scope, kube::discovery::Scope::Namespaced),
                        });
                    }
                }
            }
        }
        if found.is_empty() {
            return Err(Error::UnknownResourceType {
                group: gk.group.clone(),
                kind: gk.kind.clone(),
            });
        }
        Ok(found)
    }
}

#[derive(Debug)]
enum Node {
    Empty,
    GroupKinds {
        labels: BTreeMap<String, String>,
        kinds: Vec<GroupKind>,
    },
    Add(CleanRetriever, CleanRetriever),
    Remove(CleanRetriever, CleanRetriever, CompareStrategy),
}

/// Immutable combinator producing cleanup [`TypeDescriptor`]s.
#[derive(Clone, Debug)]
pub struct CleanRetriever {
    node: Arc<Node>,
}

impl Default for CleanRetriever {
    fn default() -> Self {
        Self::empty()
    }
}

impl CleanRetriever {
    fn from_node(node: Node) -> Self {
        Self {
            node: Arc::new(node),
        }
    }

    /// Retriever producing nothing; identity of [`CleanRetriever::add`].
    pub fn empty() -> Self {
        Self::from_node(Node::Empty)
    }

    /// Every resource serving the kinds of `objects`, paired with `labels`.
    pub fn from_objects(objects: &[ManagedObject], labels: BTreeMap<String, String>) -> Self {
        Self::from_group_kinds(labels, objects.iter().map(|o| o.resource.group_kind()))
    }

    /// Every resource serving `kinds`, paired with `labels`.
    ///
    /// Used for retired kinds that no longer have a desired object.
    pub fn from_group_kinds(
        labels: BTreeMap<String, String>,
        kinds: impl IntoIterator<Item = GroupKind>,
    ) -> Self {
        Self::from_node(Node::GroupKinds {
            labels,
            kinds: kinds.into_iter().collect(),
        })
    }

    /// Results of `self` followed by results of `other`.
    pub fn add(&self, other: &CleanRetriever) -> Self {
        Self::from_node(Node::Add(self.clone(), other.clone()))
    }

    /// Results of `self` without anything `other` produces under `strategy`.
    pub fn remove(&self, other: &CleanRetriever, strategy: CompareStrategy) -> Self {
        Self::from_node(Node::Remove(self.clone(), other.clone(), strategy))
    }

    /// Resolve to descriptors. Kinds the mapper does not know are skipped;
    /// any other mapper error is returned.
    pub fn retrieve(&self, mapper: &dyn TypeMapper) -> Result<Vec<TypeDescriptor>> {
        match self.node.as_ref() {
            Node::Empty => Ok(Vec::new()),
            Node::GroupKinds { labels, kinds } => {
                let mut descriptors = Vec::new();
                for gk in kinds {
                    let resources = match mapper.resources_for(gk) {
                        Ok(resources) => resources,
                        Err(Error::UnknownResourceType { group, kind }) => {
                            debug!(group = %group, kind = %kind, "Kind not served, nothing to clean");
                            continue;
                        }
                        Err(e) => return Err(e),
                    };
                    descriptors.extend(resources.into_iter().map(|resource| TypeDescriptor {
                        resource,
                        labels: labels.clone(),
                    }));
                }
                Ok(descriptors)
            }
            Node::Add(left, right) => {
                let mut descriptors = left.retrieve(mapper)?;
                descriptors.extend(right.retrieve(mapper)?);
                Ok(descriptors)
            }
            Node::Remove(base, removed, strategy) => {
                let removed = removed.retrieve(mapper)?;
                Ok(base
                    .retrieve(mapper)?
                    .into_iter()
                    .filter(|d| !removed.iter().any(|r| strategy.matches(d, r)))
                    .collect())
            }
        }
    }
}
