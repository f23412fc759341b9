//! Object store abstraction over the Kubernetes API.
//!
//! Controllers never talk to typed `Api<K>` handles for the objects they
//! manage. They build [`ManagedObject`]s and hand them to an [`ObjectStore`],
//! which lets the lifecycle protocol treat dozens of kinds uniformly and lets
//! tests substitute an in-memory store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
    TypeMeta,
};
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use tracing::debug;

use crate::controller::error::{Error, Result};
use crate::resources::common::label_selector;

/// Compile-time knowledge of whether a resource scope is namespaced.
pub trait Scoped {
    const NAMESPACED: bool;
}

impl Scoped for NamespaceResourceScope {
    const NAMESPACED: bool = true;
}

impl Scoped for ClusterResourceScope {
    const NAMESPACED: bool = false;
}

/// An API group plus kind, without version.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            kind: kind.to_string(),
        }
    }

    /// Group/kind of a typed resource.
    pub fn of<K: Resource<DynamicType = ()>>() -> Self {
        Self::new(&K::group(&()), &K::kind(&()))
    }
}

/// A storage resource: group, version, kind, plural and scope.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceType {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl ResourceType {
    /// Resource type of a typed resource.
    pub fn of<K>() -> Self
    where
        K: Resource<DynamicType = ()>,
        K::Scope: Scoped,
    {
        Self {
            group: K::group(&()).to_string(),
            version: K::version(&()).to_string(),
            kind: K::kind(&()).to_string(),
            plural: K::plural(&()).to_string(),
            namespaced: <K::Scope as Scoped>::NAMESPACED,
        }
    }

    pub fn group_kind(&self) -> GroupKind {
        GroupKind::new(&self.group, &self.kind)
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Same resource ignoring version.
    pub fn same_resource(&self, other: &ResourceType) -> bool {
        self.group == other.group && self.plural == other.plural
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version: self.api_version(),
            kind: self.kind.clone(),
            plural: self.plural.clone(),
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.plural)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.plural)
        }
    }
}

/// Identity of a single object in the store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub resource: ResourceType,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    /// Key of an observed object of the given resource type.
    pub fn of(resource: &ResourceType, object: &DynamicObject) -> Self {
        Self {
            resource: resource.clone(),
            namespace: object.namespace(),
            name: object.name_any(),
        }
    }

    /// Whether two keys name the same object regardless of API version.
    pub fn same_object(&self, other: &ObjectKey) -> bool {
        self.resource.same_resource(&other.resource)
            && self.namespace == other.namespace
            && self.name == other.name
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.resource, ns, self.name),
            None => write!(f, "{} {}", self.resource, self.name),
        }
    }
}

/// A desired object ready to be applied, erased to its dynamic form.
#[derive(Clone, Debug)]
pub struct ManagedObject {
    pub resource: ResourceType,
    pub object: DynamicObject,
}

impl ManagedObject {
    /// Erase a typed object.
    pub fn from_typed<K>(typed: &K) -> Result<Self>
    where
        K: Resource<DynamicType = ()> + Serialize,
        K::Scope: Scoped,
    {
        let resource = ResourceType::of::<K>();
        let mut object: DynamicObject = serde_json::from_value(serde_json::to_value(typed)?)?;
        object.types = Some(TypeMeta {
            api_version: resource.api_version(),
            kind: resource.kind.clone(),
        });
        Ok(Self { resource, object })
    }

    /// Wrap an already dynamic object, e.g. a third-party CRD instance.
    pub fn from_dynamic(resource: ResourceType, mut object: DynamicObject) -> Self {
        object.types = Some(TypeMeta {
            api_version: resource.api_version(),
            kind: resource.kind.clone(),
        });
        Self { resource, object }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::of(&self.resource, &self.object)
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        self.object.labels()
    }
}

/// Operations the lifecycle protocol needs from the cluster.
///
/// Reads report absence as `Ok(None)` and deletes of missing objects succeed,
/// so callers never have to special-case concurrent deletion.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(
        &self,
        resource: &ResourceType,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// List objects carrying every label in `labels`.
    async fn list(
        &self,
        resource: &ResourceType,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>>;

    async fn create(&self, object: &ManagedObject) -> Result<DynamicObject>;

    /// Server-side apply with forced field ownership.
    async fn apply(&self, object: &ManagedObject, field_manager: &str) -> Result<DynamicObject>;

    async fn delete(&self, resource: &ResourceType, namespace: Option<&str>, name: &str)
    -> Result<()>;
}

/// [`ObjectStore`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ResourceType, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = resource.api_resource();
        match namespace {
            Some(ns) if resource.namespaced => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(
        &self,
        resource: &ResourceType,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        Ok(self.api(resource, namespace).get_opt(name).await?)
    }

    async fn list(
        &self,
        resource: &ResourceType,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>> {
        let mut params = ListParams::default();
        if !labels.is_empty() {
            params = params.labels(&label_selector(labels));
        }
        let list = self.api(resource, namespace).list(&params).await?;
        Ok(list.items)
    }

    async fn create(&self, object: &ManagedObject) -> Result<DynamicObject> {
        let api = self.api(&object.resource, object.object.metadata.namespace.as_deref());
        Ok(api.create(&PostParams::default(), &object.object).await?)
    }

    async fn apply(&self, object: &ManagedObject, field_manager: &str) -> Result<DynamicObject> {
        let name = object.object.name_any();
        let api = self.api(&object.resource, object.object.metadata.namespace.as_deref());
        debug!(object = %object.key(), "Applying object");
        Ok(api
            .patch(
                &name,
                &PatchParams::apply(field_manager).force(),
                &Patch::Apply(&object.object),
            )
            .await?)
    }

    async fn delete(
        &self,
        resource: &ResourceType,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<()> {
        match self
            .api(resource, namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(Error::Kube(e)),
        }
    }
}
