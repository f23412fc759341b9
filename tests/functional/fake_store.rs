//! In-memory object store.
//!
//! Mimics the parts of the API server the lifecycle protocol relies on:
//! label-filtered lists, server-side apply that creates missing objects, and
//! idempotent deletes. Failures can be injected per object name.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use kube::ResourceExt;
use kube::api::DynamicObject;

use app_routing_operator::controller::error::{Error, Result};
use app_routing_operator::resources::common::has_labels;
use app_routing_operator::resources::store::{ManagedObject, ObjectStore, ResourceType};

/// Storage key: version-independent resource identity plus namespace/name.
type Key = (String, String, Option<String>, String);

fn key(resource: &ResourceType, namespace: Option<&str>, name: &str) -> Key {
    let namespace = if resource.namespaced {
        namespace.map(str::to_string)
    } else {
        None
    };
    (
        resource.group.clone(),
        resource.plural.clone(),
        namespace,
        name.to_string(),
    )
}

/// API error with the given HTTP status.
pub fn api_error(code: u16) -> Error {
    Error::Kube(kube::Error::Api(kube::core::Status::failure(&format!("injected {code}"), "Injected").with_code(code).boxed()))
}

/// A store operation, in call order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Apply(String),
    Create(String),
    Delete(String),
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, DynamicObject>,
    ops: Vec<Op>,
    failing: BTreeSet<String>,
    apply_requires_existing: bool,
    graceful_deletes: bool,
}

#[derive(Default)]
pub struct FakeStore {
    inner: Mutex<Inner>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make apply report 404 for objects that do not exist yet, like an API
    /// server without server-side apply create semantics.
    pub fn apply_requires_existing(self) -> Self {
        self.inner.lock().unwrap().apply_requires_existing = true;
        self
    }

    /// Keep deleted objects listed, like objects held by a finalizer.
    pub fn graceful_deletes(self) -> Self {
        self.inner.lock().unwrap().graceful_deletes = true;
        self
    }

    /// Fail every write to objects named `name` with a 500.
    pub fn fail_writes_to(&self, name: &str) {
        self.inner.lock().unwrap().failing.insert(name.to_string());
    }

    /// Seed an object directly, bypassing the operation log.
    pub fn insert(&self, object: ManagedObject) {
        let k = key(
            &object.resource,
            object.object.metadata.namespace.as_deref(),
            &object.object.name_any(),
        );
        self.inner.lock().unwrap().objects.insert(k, object.object);
    }

    pub fn contains(&self, resource: &ResourceType, namespace: Option<&str>, name: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .objects
            .contains_key(&key(resource, namespace, name))
    }

    pub fn object(
        &self,
        resource: &ResourceType,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<DynamicObject> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .get(&key(resource, namespace, name))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().objects.len()
    }

    pub fn ops(&self) -> Vec<Op> {
        self.inner.lock().unwrap().ops.clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Delete(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn clear_ops(&self) {
        self.inner.lock().unwrap().ops.clear();
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn get(
        &self,
        resource: &ResourceType,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        Ok(self.object(resource, namespace, name))
    }

    async fn list(
        &self,
        resource: &ResourceType,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .objects
            .iter()
            .filter(|((group, plural, ns, _), _)| {
                *group == resource.group
                    && *plural == resource.plural
                    && namespace.is_none_or(|wanted| ns.as_deref() == Some(wanted))
            })
            .filter(|(_, object)| has_labels(object.labels(), labels))
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn create(&self, object: &ManagedObject) -> Result<DynamicObject> {
        let name = object.object.name_any();
        let mut inner = self.inner.lock().unwrap();
        if inner.failing.contains(&name) {
            return Err(api_error(500));
        }
        let k = key(
            &object.resource,
            object.object.metadata.namespace.as_deref(),
            &name,
        );
        if inner.objects.contains_key(&k) {
            return Err(api_error(409));
        }
        inner.ops.push(Op::Create(name));
        inner.objects.insert(k, object.object.clone());
        Ok(object.object.clone())
    }

    async fn apply(&self, object: &ManagedObject, _field_manager: &str) -> Result<DynamicObject> {
        let name = object.object.name_any();
        let mut inner = self.inner.lock().unwrap();
        if inner.failing.contains(&name) {
            return Err(api_error(500));
        }
        let k = key(
            &object.resource,
            object.object.metadata.namespace.as_deref(),
            &name,
        );
        if inner.apply_requires_existing && !inner.objects.contains_key(&k) {
            return Err(api_error(404));
        }
        inner.ops.push(Op::Apply(name));
        inner.objects.insert(k, object.object.clone());
        Ok(object.object.clone())
    }

    async fn delete(
        &self,
        resource: &ResourceType,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.failing.contains(name) {
            return Err(api_error(500));
        }
        inner.ops.push(Op::Delete(name.to_string()));
        if !inner.graceful_deletes {
            inner.objects.remove(&key(resource, namespace, name));
        }
        Ok(())
    }
}
