//! Concurrency watchdog.
//!
//! NGINX keeps long-lived connections on the replica that accepted them, so
//! a scale-out leaves new replicas idle while old ones stay hot. Each tick
//! the watchdog compares every ready replica's active connections with the
//! target's average, votes against replicas far above it, and evicts a
//! replica once it gathers enough live votes. The evicted pod's clients
//! reconnect and spread across the remaining replicas.

pub mod scrape;
pub mod votes;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use jiff::{SignedDuration, Timestamp};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, EvictParams, ListParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::config::WatchdogConfig;
use crate::controller::common::Tick;
use crate::controller::error::{Error, Result};
use crate::crd::NginxIngressController;
use crate::health::HealthState;
use crate::resources::common::label_selector;
use crate::resources::store::{ObjectStore, ResourceType};
use scrape::Scraper;
use votes::{Vote, VoteRing};

/// Name used in metrics and logs
pub const CONTROLLER_NAME: &str = "concurrency-watchdog";

/// Fewer ready replicas than this and the average is not meaningful.
pub const MIN_READY_PODS: usize = 3;

/// Pod operations the watchdog needs.
#[async_trait]
pub trait PodClient: Send + Sync {
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>>;

    async fn evict(&self, namespace: &str, name: &str) -> Result<()>;
}

/// [`PodClient`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubePodClient {
    client: Client,
}

impl KubePodClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodClient for KubePodClient {
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&label_selector(selector));
        Ok(api.list(&params).await?.items)
    }

    async fn evict(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.evict(name, &EvictParams::default()).await?;
        Ok(())
    }
}

/// One monitored ingress controller.
#[derive(Clone)]
pub struct WatchdogTarget {
    pub name: String,
    pub scraper: Arc<dyn Scraper>,
    pub pod_selector: BTreeMap<String, String>,
}

/// Supplies the targets of each tick.
#[async_trait]
pub trait TargetSource: Send + Sync {
    async fn targets(&self) -> Result<Vec<WatchdogTarget>>;
}

/// A fixed target list.
pub struct StaticTargets(pub Vec<WatchdogTarget>);

#[async_trait]
impl TargetSource for StaticTargets {
    async fn targets(&self) -> Result<Vec<WatchdogTarget>> {
        Ok(self.0.clone())
    }
}

/// One target per NginxIngressController currently in the cluster.
pub struct NginxTargets {
    store: Arc<dyn ObjectStore>,
    scraper: Arc<dyn Scraper>,
}

impl NginxTargets {
    pub fn new(store: Arc<dyn ObjectStore>, scraper: Arc<dyn Scraper>) -> Self {
        Self { store, scraper }
    }
}

#[async_trait]
impl TargetSource for NginxTargets {
    async fn targets(&self) -> Result<Vec<WatchdogTarget>> {
        let objects = self
            .store
            .list(
                &ResourceType::of::<NginxIngressController>(),
                None,
                &BTreeMap::new(),
            )
            .await?;
        let mut targets = Vec::with_capacity(objects.len());
        for object in objects {
            let nic: NginxIngressController = serde_json::from_value(serde_json::to_value(object)?)?;
            targets.push(WatchdogTarget {
                name: nic.name_any(),
                scraper: self.scraper.clone(),
                pod_selector: nic.pod_selector(),
            });
        }
        Ok(targets)
    }
}

/// What a tick did, for logging and tests.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// `(target, pod)` of every vote cast
    pub votes: Vec<(String, String)>,
    /// `(target, pod)` of every eviction issued
    pub evictions: Vec<(String, String)>,
}

/// Whether the pod's Ready condition is true.
pub fn is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Arithmetic mean, `None` for no samples.
fn average(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<f64>() / samples.len() as f64)
}

/// The concurrency watchdog. Owns one vote ring per target.
pub struct Watchdog {
    config: WatchdogConfig,
    targets: Arc<dyn TargetSource>,
    pods: Arc<dyn PodClient>,
    health_state: Option<Arc<HealthState>>,
    votes: HashMap<String, VoteRing>,
}

impl Watchdog {
    pub fn new(
        config: WatchdogConfig,
        targets: Arc<dyn TargetSource>,
        pods: Arc<dyn PodClient>,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            config,
            targets,
            pods,
            health_state,
            votes: HashMap::new(),
        }
    }

    /// Vote ring of a target, if it has one.
    pub fn ring(&self, target: &str) -> Option<&VoteRing> {
        self.votes.get(target)
    }

    fn old_enough(&self, pod: &Pod, now: Timestamp) -> bool {
        let min_age = SignedDuration::try_from(self.config.min_pod_age).unwrap_or(SignedDuration::MAX);
        pod.metadata
            .creation_timestamp
            .as_ref()
            .is_some_and(|created| now.duration_since(created.0) >= min_age)
    }

    /// Run one tick as of `now`.
    ///
    /// Every target is processed even when others fail; failures are
    /// returned aggregated.
    pub async fn tick_at(&mut self, now: Timestamp) -> Result<TickReport> {
        let targets = self.targets.targets().await?;
        let live: BTreeSet<&str> = targets.iter().map(|t| t.name.as_str()).collect();
        self.votes.retain(|name, _| live.contains(name.as_str()));

        let mut report = TickReport::default();
        let mut errors = Vec::new();
        for target in &targets {
            if let Err(e) = self.tick_target(target, now, &mut report).await {
                warn!(target = %target.name, error = %e, "Watchdog tick failed for target");
                errors.push(e);
            }
        }
        Error::from_batch(errors).map(|()| report)
    }

    async fn tick_target(
        &mut self,
        target: &WatchdogTarget,
        now: Timestamp,
        report: &mut TickReport,
    ) -> Result<()> {
        let pods = self
            .pods
            .list_pods(&self.config.namespace, &target.pod_selector)
            .await?;
        let candidates: BTreeSet<String> = pods.iter().map(ResourceExt::name_any).collect();

        let mut errors = Vec::new();
        let mut loads: Vec<(&Pod, f64)> = Vec::new();
        for pod in pods.iter().filter(|p| is_ready(p)) {
            match target.scraper.scrape(pod).await {
                Ok(connections) => loads.push((pod, connections)),
                Err(e) => {
                    debug!(target = %target.name, pod = %pod.name_any(), error = %e, "Scrape failed");
                    errors.push(e);
                }
            }
        }

        if loads.len() < MIN_READY_PODS {
            debug!(
                target = %target.name,
                ready = loads.len(),
                "Too few ready pods to compare load"
            );
            return Error::from_batch(errors);
        }
        let samples: Vec<f64> = loads.iter().map(|(_, c)| *c).collect();
        let Some(avg) = average(&samples).filter(|avg| *avg > 0.0) else {
            debug!(target = %target.name, "No active connections");
            return Error::from_batch(errors);
        };

        let threshold = self.config.min_percent_over_avg_before_vote;
        let mut vote = None;
        for (pod, connections) in &loads {
            let rank = connections / avg * 100.0;
            if rank >= threshold && self.old_enough(pod, now) {
                vote = Some(Vote {
                    pod_name: pod.name_any(),
                    time: now,
                });
            }
        }

        let ring = self.votes.entry(target.name.clone()).or_default();
        if let Some(vote) = vote {
            info!(target = %target.name, pod = %vote.pod_name, "Voting to evict overloaded pod");
            report.votes.push((target.name.clone(), vote.pod_name.clone()));
            if let Some(state) = &self.health_state {
                state.metrics.record_vote(&target.name);
            }
            ring.cast(vote);
        }

        let tally = ring.tally(now, self.config.vote_ttl, &candidates);
        let elected = tally
            .iter()
            .find(|(_, count)| **count >= self.config.min_votes_before_eviction);
        if let Some((pod, count)) = elected {
            info!(target = %target.name, pod = %pod, votes = *count, "Evicting pod");
            match self.pods.evict(&self.config.namespace, pod).await {
                Ok(()) => {
                    report.evictions.push((target.name.clone(), pod.clone()));
                    if let Some(state) = &self.health_state {
                        state.metrics.record_eviction(&target.name);
                    }
                }
                Err(e) => {
                    warn!(target = %target.name, pod = %pod, error = %e, "Eviction failed");
                }
            }
        }

        Error::from_batch(errors)
    }
}

#[async_trait]
impl Tick for Watchdog {
    async fn tick(&mut self) -> Result<()> {
        let report = self.tick_at(Timestamp::now()).await?;
        debug!(
            votes = report.votes.len(),
            evictions = report.evictions.len(),
            "Watchdog tick complete"
        );
        Ok(())
    }
}
