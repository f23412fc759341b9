//! External DNS deployments for public and private Azure DNS zones.
//!
//! One [`Instance`] exists per zone kind. An instance with at least one zone
//! is deployed; an instance without zones is cleaned so that removing the
//! last zone of a kind tears its external-dns deployment down.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, Namespace, PodSpec, PodTemplateSpec,
    ServiceAccount, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use serde_json::json;

use crate::config::{Config, DnsZoneId, DnsZoneKind};
use crate::controller::error::Result;
use crate::resources::common::{managed_meta, standard_labels, top_level_labels};
use crate::resources::retriever::CleanRetriever;
use crate::resources::store::ManagedObject;

/// external-dns image
pub const EXTERNAL_DNS_IMAGE: &str = "mcr.microsoft.com/oss/kubernetes/external-dns:v0.14.2";

const COMPONENT: &str = "external-dns";
const CONFIG_FILE: &str = "azure.json";
const CONFIG_MOUNT_PATH: &str = "/etc/kubernetes";

/// Whether an instance should exist.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceAction {
    Deploy,
    Clean,
}

/// Settings of one external-dns deployment.
#[derive(Clone, Debug)]
pub struct ExternalDnsConfig {
    pub kind: DnsZoneKind,
    pub namespace: String,
    pub tenant_id: String,
    pub client_id: String,
    pub cloud: String,
    pub zones: Vec<DnsZoneId>,
}

impl ExternalDnsConfig {
    pub fn resource_name(&self) -> &'static str {
        match self.kind {
            DnsZoneKind::Public => "external-dns",
            DnsZoneKind::Private => "external-dns-private",
        }
    }

    pub fn provider(&self) -> &'static str {
        match self.kind {
            DnsZoneKind::Public => "azure",
            DnsZoneKind::Private => "azure-private-dns",
        }
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        standard_labels(self.resource_name(), COMPONENT)
    }

    fn selector(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("app".to_string(), self.resource_name().to_string())])
    }

    fn metadata(&self, namespaced: bool) -> ObjectMeta {
        let namespace = namespaced.then_some(self.namespace.as_str());
        managed_meta(self.resource_name(), namespace, self.labels(), None)
    }
}

/// An external-dns deployment target and what to do with it this tick.
#[derive(Clone, Debug)]
pub struct Instance {
    pub config: ExternalDnsConfig,
    pub resources: Vec<ManagedObject>,
    pub action: InstanceAction,
}

impl Instance {
    pub fn new(config: ExternalDnsConfig) -> Result<Self> {
        let action = if config.zones.is_empty() {
            InstanceAction::Clean
        } else {
            InstanceAction::Deploy
        };
        let resources = desired_resources(&config)?;
        Ok(Self {
            config,
            resources,
            action,
        })
    }

    /// Retriever covering every kind this instance creates, restricted to
    /// its own labels.
    pub fn retriever(&self) -> CleanRetriever {
        CleanRetriever::from_objects(&self.resources, self.config.labels())
    }
}

/// Public and private instances for the current configuration.
pub fn instances(config: &Config) -> Result<Vec<Instance>> {
    let (public, private) = config.dns_zones()?;
    [(DnsZoneKind::Public, public), (DnsZoneKind::Private, private)]
        .into_iter()
        .map(|(kind, zones)| {
            Instance::new(ExternalDnsConfig {
                kind,
                namespace: config.namespace.clone(),
                tenant_id: config.tenant_id.clone(),
                client_id: config.msi_client_id.clone(),
                cloud: config.cloud.clone(),
                zones,
            })
        })
        .collect()
}

pub fn desired_resources(config: &ExternalDnsConfig) -> Result<Vec<ManagedObject>> {
    Ok(vec![
        ManagedObject::from_typed(&generate_namespace(config))?,
        ManagedObject::from_typed(&generate_service_account(config))?,
        ManagedObject::from_typed(&generate_cluster_role(config))?,
        ManagedObject::from_typed(&generate_cluster_role_binding(config))?,
        ManagedObject::from_typed(&generate_config_map(config))?,
        ManagedObject::from_typed(&generate_deployment(config))?,
    ])
}

// Shared by both instances, so it carries only the top-level labels.
fn generate_namespace(config: &ExternalDnsConfig) -> Namespace {
    Namespace {
        metadata: managed_meta(&config.namespace, None, top_level_labels(), None),
        ..Default::default()
    }
}

fn generate_service_account(config: &ExternalDnsConfig) -> ServiceAccount {
    ServiceAccount {
        metadata: config.metadata(true),
        ..Default::default()
    }
}

fn generate_cluster_role(config: &ExternalDnsConfig) -> ClusterRole {
    let read = |groups: &[&str], resources: &[&str]| PolicyRule {
        api_groups: Some(groups.iter().map(|s| s.to_string()).collect()),
        resources: Some(resources.iter().map(|s| s.to_string()).collect()),
        verbs: vec!["get".to_string(), "watch".to_string(), "list".to_string()],
        ..Default::default()
    };
    ClusterRole {
        metadata: config.metadata(false),
        rules: Some(vec![
            read(&[""], &["endpoints", "pods", "services", "nodes"]),
            read(&["extensions", "networking.k8s.io"], &["ingresses"]),
        ]),
        ..Default::default()
    }
}

fn generate_cluster_role_binding(config: &ExternalDnsConfig) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: config.metadata(false),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: config.resource_name().to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: config.resource_name().to_string(),
            namespace: Some(config.namespace.clone()),
            ..Default::default()
        }]),
    }
}

fn generate_config_map(config: &ExternalDnsConfig) -> ConfigMap {
    let first = config.zones.first();
    let azure = json!({
        "cloud": config.cloud,
        "tenantId": config.tenant_id,
        "subscriptionId": first.map(|z| z.subscription.as_str()).unwrap_or_default(),
        "resourceGroup": first.map(|z| z.resource_group.as_str()).unwrap_or_default(),
        "useManagedIdentityExtension": true,
        "userAssignedIdentityID": config.client_id,
    });
    ConfigMap {
        metadata: config.metadata(true),
        data: Some(BTreeMap::from([(CONFIG_FILE.to_string(), azure.to_string())])),
        ..Default::default()
    }
}

fn generate_deployment(config: &ExternalDnsConfig) -> Deployment {
    let name = config.resource_name();
    let mut args = vec![
        format!("--provider={}", config.provider()),
        "--source=ingress".to_string(),
        "--interval=3m0s".to_string(),
        format!("--txt-owner-id={name}"),
    ];
    args.extend(config.zones.iter().map(|z| format!("--domain-filter={}", z.name)));

    let mut pod_labels = config.labels();
    pod_labels.extend(config.selector());

    Deployment {
        metadata: config.metadata(true),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(config.selector()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(name.to_string()),
                    containers: vec![Container {
                        name: "controller".to_string(),
                        image: Some(EXTERNAL_DNS_IMAGE.to_string()),
                        args: Some(args),
                        volume_mounts: Some(vec![VolumeMount {
                            name: "azure-config".to_string(),
                            mount_path: CONFIG_MOUNT_PATH.to_string(),
                            read_only: Some(true),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: "azure-config".to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: name.to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
