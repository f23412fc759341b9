//! Fake pod API, metrics endpoint and event sink.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use jiff::Timestamp;
use k8s_openapi::api::core::v1::{ObjectReference, Pod, PodCondition, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::ResourceExt;
use kube::runtime::events::{Event, EventType};

use app_routing_operator::controller::context::EventSink;
use app_routing_operator::controller::error::{Error, Result};
use app_routing_operator::watchdog::PodClient;
use app_routing_operator::watchdog::scrape::Scraper;

/// A pod created at `created`.
pub fn pod(name: &str, ready: bool, created: Timestamp) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("app-routing-system".to_string()),
            creation_timestamp: Some(Time(created)),
            labels: Some(BTreeMap::from([("app".to_string(), "nginx".to_string())])),
            ..Default::default()
        },
        status: Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Pods served by the fake API. Evicted pods disappear from later lists.
#[derive(Default)]
pub struct FakePods {
    pods: Mutex<Vec<Pod>>,
    evicted: Mutex<Vec<String>>,
    reject_evictions: Mutex<bool>,
}

impl FakePods {
    pub fn new(pods: Vec<Pod>) -> Self {
        Self {
            pods: Mutex::new(pods),
            ..Default::default()
        }
    }

    pub fn set(&self, pods: Vec<Pod>) {
        *self.pods.lock().unwrap() = pods;
    }

    pub fn evicted(&self) -> Vec<String> {
        self.evicted.lock().unwrap().clone()
    }

    /// Answer evictions with 429, as a PodDisruptionBudget would.
    pub fn reject_evictions(&self) {
        *self.reject_evictions.lock().unwrap() = true;
    }
}

#[async_trait]
impl PodClient for FakePods {
    async fn list_pods(
        &self,
        _namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>> {
        Ok(self
            .pods
            .lock()
            .unwrap()
            .iter()
            .filter(|p| selector.iter().all(|(k, v)| p.labels().get(k) == Some(v)))
            .cloned()
            .collect())
    }

    async fn evict(&self, _namespace: &str, name: &str) -> Result<()> {
        if *self.reject_evictions.lock().unwrap() {
            return Err(crate::fake_store::api_error(429));
        }
        self.evicted.lock().unwrap().push(name.to_string());
        self.pods.lock().unwrap().retain(|p| p.name_any() != name);
        Ok(())
    }
}

/// Active connections per pod. Pods without a load fail to scrape.
#[derive(Default)]
pub struct FakeScraper {
    loads: Mutex<HashMap<String, f64>>,
}

impl FakeScraper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every load; `loads[i]` belongs to `pod-{i + 1}`.
    pub fn set_loads(&self, loads: &[f64]) {
        *self.loads.lock().unwrap() = loads
            .iter()
            .enumerate()
            .map(|(i, load)| (format!("pod-{}", i + 1), *load))
            .collect();
    }

    pub fn forget(&self, pod: &str) {
        self.loads.lock().unwrap().remove(pod);
    }
}

#[async_trait]
impl Scraper for FakeScraper {
    async fn scrape(&self, pod: &Pod) -> Result<f64> {
        let name = pod.name_any();
        self.loads
            .lock()
            .unwrap()
            .get(&name)
            .copied()
            .ok_or_else(|| Error::Scrape {
                pod: name,
                message: "connection refused".to_string(),
            })
    }
}

/// A published event, reduced to what tests assert on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub warning: bool,
    pub reason: String,
    pub kind: Option<String>,
    pub name: Option<String>,
}

/// Event sink that keeps every event in memory.
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEvents {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for RecordingEvents {
    async fn publish(&self, event: &Event, object_ref: &ObjectReference) -> kube::Result<()> {
        self.events.lock().unwrap().push(RecordedEvent {
            warning: matches!(event.type_, EventType::Warning),
            reason: event.reason.clone(),
            kind: object_ref.kind.clone(),
            name: object_ref.name.clone(),
        });
        Ok(())
    }
}
