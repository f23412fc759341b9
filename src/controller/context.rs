//! Shared context for the controllers.
//!
//! The Context struct holds shared state passed to every reconciler: the
//! Kubernetes client, the object store and type mapper, configuration and the
//! event sink.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};

use crate::config::Config;
use crate::health::HealthState;
use crate::resources::retriever::TypeMapper;
use crate::resources::store::ObjectStore;

/// Field manager name for server-side apply and event reporting
pub const FIELD_MANAGER: &str = "aks-app-routing-operator";

/// Where reconcilers report Kubernetes events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &Event, object_ref: &ObjectReference) -> kube::Result<()>;
}

/// Publishes through the events API.
pub struct KubeEvents {
    recorder: Recorder,
}

impl KubeEvents {
    pub fn new(client: Client, reporter: Reporter) -> Self {
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventSink for KubeEvents {
    async fn publish(&self, event: &Event, object_ref: &ObjectReference) -> kube::Result<()> {
        self.recorder.publish(event, object_ref).await
    }
}

/// Report a Warning event on `object_ref`. Publishing failures are logged,
/// never returned.
pub async fn publish_warning(
    events: &dyn EventSink,
    object_ref: &ObjectReference,
    reason: &str,
    action: &str,
    note: Option<String>,
) {
    let event = Event {
        type_: EventType::Warning,
        reason: reason.into(),
        note,
        action: action.into(),
        secondary: None,
    };
    if let Err(e) = events.publish(&event, object_ref).await {
        tracing::warn!(reason = %reason, error = %e, "Failed to publish event");
    }
}

/// Shared context for the controllers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Store the lifecycle protocol converges through
    pub store: Arc<dyn ObjectStore>,
    /// Resolves kinds to storage resources for cleanup passes
    pub mapper: Arc<dyn TypeMapper>,
    /// Process configuration
    pub config: Arc<Config>,
    /// Event sink, the events API unless replaced
    pub events: Arc<dyn EventSink>,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
}

impl Context {
    /// Create a new context
    pub fn new(
        client: Client,
        store: Arc<dyn ObjectStore>,
        mapper: Arc<dyn TypeMapper>,
        config: Arc<Config>,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        let reporter = Reporter {
            controller: FIELD_MANAGER.into(),
            instance: config.pod_name.clone(),
        };
        Self {
            events: Arc::new(KubeEvents::new(client.clone(), reporter)),
            client,
            store,
            mapper,
            config,
            health_state,
        }
    }

    /// Publish a warning event for a resource
    pub async fn publish_warning_event<K>(
        &self,
        resource: &K,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) where
        K: Resource<DynamicType = ()>,
    {
        publish_warning(
            self.events.as_ref(),
            &resource.object_ref(&()),
            reason,
            action,
            note,
        )
        .await;
    }
}
