//! Object graph for an NginxIngressController.
//!
//! | Resource | Purpose |
//! |----------|---------|
//! | IngressClass | Binds the class name to this controller |
//! | ServiceAccount, ClusterRole, ClusterRoleBinding | Controller identity and RBAC |
//! | Deployment | The NGINX controller pods |
//! | Service | LoadBalancer in front of the pods |
//! | PodDisruptionBudget | Keeps one replica up during voluntary disruptions |
//!
//! Every object carries the top-level labels and a controlling owner
//! reference to the NginxIngressController.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    CSIVolumeSource, Capabilities, Container, ContainerPort, EnvVar, EnvVarSource,
    HTTPGetAction, ObjectFieldSelector, PodSpec, PodTemplateSpec, Probe, ResourceRequirements,
    SecurityContext, Service, ServiceAccount, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::networking::v1::{IngressClass, IngressClassSpec};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::controller::error::Result;
use crate::crd::NginxIngressController;
use crate::resources::common::{managed_meta, owner_reference, standard_labels};
use crate::resources::keyvault::{SECRETS_STORE_DRIVER, SpcOwner};
use crate::resources::store::ManagedObject;

/// NGINX ingress controller image
pub const NGINX_IMAGE: &str =
    "mcr.microsoft.com/oss/kubernetes/ingress/nginx-ingress-controller:v1.11.5";

/// Port the controller serves Prometheus metrics and health checks on
pub const NGINX_METRICS_PORT: i32 = 10254;

const HTTP_PORT: i32 = 8080;
const HTTPS_PORT: i32 = 8443;
const REPLICAS: i32 = 2;
const COMPONENT: &str = "ingress-controller";
const SECRETS_MOUNT_PATH: &str = "/mnt/secrets-store";

/// Labels carried by every object of this controller.
///
/// Includes the pod selector so objects of different controllers never
/// share a label set.
pub fn controller_labels(nic: &NginxIngressController) -> BTreeMap<String, String> {
    let mut labels = standard_labels(&nic.resource_name(), COMPONENT);
    labels.extend(nic.pod_selector());
    labels
}

fn metadata(nic: &NginxIngressController, name: &str, namespace: Option<&str>) -> ObjectMeta {
    managed_meta(
        name,
        namespace,
        controller_labels(nic),
        Some(owner_reference(nic)),
    )
}

/// Every object the controller needs, in apply order.
pub fn desired_resources(
    nic: &NginxIngressController,
    namespace: &str,
) -> Result<Vec<ManagedObject>> {
    Ok(vec![
        ManagedObject::from_typed(&generate_ingress_class(nic))?,
        ManagedObject::from_typed(&generate_service_account(nic, namespace))?,
        ManagedObject::from_typed(&generate_cluster_role(nic))?,
        ManagedObject::from_typed(&generate_cluster_role_binding(nic, namespace))?,
        ManagedObject::from_typed(&generate_deployment(nic, namespace))?,
        ManagedObject::from_typed(&generate_service(nic, namespace))?,
        ManagedObject::from_typed(&generate_pod_disruption_budget(nic, namespace))?,
    ])
}

pub fn generate_ingress_class(nic: &NginxIngressController) -> IngressClass {
    IngressClass {
        metadata: metadata(nic, &nic.spec.ingress_class_name, None),
        spec: Some(IngressClassSpec {
            controller: Some(nic.controller_class()),
            ..Default::default()
        }),
    }
}

pub fn generate_service_account(nic: &NginxIngressController, namespace: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: metadata(nic, &nic.resource_name(), Some(namespace)),
        ..Default::default()
    }
}

fn rule(groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    PolicyRule {
        api_groups: Some(owned(groups)),
        resources: Some(owned(resources)),
        verbs: owned(verbs),
        ..Default::default()
    }
}

pub fn generate_cluster_role(nic: &NginxIngressController) -> ClusterRole {
    ClusterRole {
        metadata: metadata(nic, &nic.resource_name(), None),
        rules: Some(vec![
            rule(
                &[""],
                &["configmaps", "endpoints", "nodes", "pods", "secrets", "namespaces", "services"],
                &["get", "list", "watch"],
            ),
            rule(&[""], &["events"], &["create", "patch"]),
            rule(
                &["networking.k8s.io"],
                &["ingresses", "ingressclasses"],
                &["get", "list", "watch"],
            ),
            rule(&["networking.k8s.io"], &["ingresses/status"], &["update"]),
            rule(
                &["discovery.k8s.io"],
                &["endpointslices"],
                &["get", "list", "watch"],
            ),
            rule(
                &["coordination.k8s.io"],
                &["leases"],
                &["get", "list", "watch", "create", "update"],
            ),
        ]),
        ..Default::default()
    }
}

pub fn generate_cluster_role_binding(
    nic: &NginxIngressController,
    namespace: &str,
) -> ClusterRoleBinding {
    let name = nic.resource_name();
    ClusterRoleBinding {
        metadata: metadata(nic, &name, None),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name,
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    }
}

pub fn generate_deployment(nic: &NginxIngressController, namespace: &str) -> Deployment {
    let name = nic.resource_name();
    let certificate_spc = nic
        .default_certificate_uri()
        .map(|_| SpcOwner::NginxIngressController(nic).spc_name());

    let (volumes, volume_mounts) = match &certificate_spc {
        Some(spc) => (
            Some(vec![Volume {
                name: "keyvault".to_string(),
                csi: Some(CSIVolumeSource {
                    driver: SECRETS_STORE_DRIVER.to_string(),
                    read_only: Some(true),
                    volume_attributes: Some(BTreeMap::from([(
                        "secretProviderClass".to_string(),
                        spc.clone(),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            Some(vec![VolumeMount {
                name: "keyvault".to_string(),
                mount_path: SECRETS_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            }]),
        ),
        None => (None, None),
    };

    Deployment {
        metadata: metadata(nic, &name, Some(namespace)),
        spec: Some(DeploymentSpec {
            replicas: Some(REPLICAS),
            selector: LabelSelector {
                match_labels: Some(nic.pod_selector()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(controller_labels(nic)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(name.clone()),
                    containers: vec![generate_controller_container(
                        nic,
                        namespace,
                        certificate_spc.as_deref(),
                        volume_mounts,
                    )],
                    volumes,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn generate_controller_container(
    nic: &NginxIngressController,
    namespace: &str,
    certificate_spc: Option<&str>,
    volume_mounts: Option<Vec<VolumeMount>>,
) -> Container {
    let name = nic.resource_name();
    let mut args = vec![
        "/nginx-ingress-controller".to_string(),
        format!("--ingress-class={}", nic.spec.ingress_class_name),
        format!("--controller-class={}", nic.controller_class()),
        format!("--election-id={name}"),
        format!("--publish-service={namespace}/{name}"),
        format!("--http-port={HTTP_PORT}"),
        format!("--https-port={HTTPS_PORT}"),
        "--enable-annotation-validation=true".to_string(),
    ];
    if let Some(spc) = certificate_spc {
        args.push(format!("--default-ssl-certificate={namespace}/{spc}"));
    }

    let field_env = |env_name: &str, path: &str| EnvVar {
        name: env_name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    let port = |port_name: &str, number: i32| ContainerPort {
        container_port: number,
        name: Some(port_name.to_string()),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    };

    Container {
        name: "controller".to_string(),
        image: Some(NGINX_IMAGE.to_string()),
        args: Some(args),
        env: Some(vec![
            field_env("POD_NAME", "metadata.name"),
            field_env("POD_NAMESPACE", "metadata.namespace"),
        ]),
        ports: Some(vec![
            port("http", HTTP_PORT),
            port("https", HTTPS_PORT),
            port("metrics", NGINX_METRICS_PORT),
        ]),
        resources: Some(ResourceRequirements {
            requests: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity("500m".to_string())),
                ("memory".to_string(), Quantity("127Mi".to_string())),
            ])),
            ..Default::default()
        }),
        security_context: Some(SecurityContext {
            allow_privilege_escalation: Some(false),
            run_as_non_root: Some(true),
            run_as_user: Some(101),
            capabilities: Some(Capabilities {
                add: Some(vec!["NET_BIND_SERVICE".to_string()]),
                drop: Some(vec!["ALL".to_string()]),
            }),
            ..Default::default()
        }),
        readiness_probe: Some(health_probe(10, 1)),
        liveness_probe: Some(health_probe(10, 5)),
        volume_mounts,
        ..Default::default()
    }
}

fn health_probe(initial_delay: i32, failure_threshold: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/healthz".to_string()),
            port: IntOrString::Int(NGINX_METRICS_PORT),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(5),
        timeout_seconds: Some(1),
        failure_threshold: Some(failure_threshold),
        ..Default::default()
    }
}

pub fn generate_service(nic: &NginxIngressController, namespace: &str) -> Service {
    let port = |port_name: &str, number: i32| ServicePort {
        name: Some(port_name.to_string()),
        port: number,
        target_port: Some(IntOrString::String(port_name.to_string())),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    };
    Service {
        metadata: metadata(nic, &nic.resource_name(), Some(namespace)),
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            external_traffic_policy: Some("Local".to_string()),
            selector: Some(nic.pod_selector()),
            ports: Some(vec![port("http", 80), port("https", 443)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// One replica may be unavailable at a time, which is what lets the
/// watchdog evict an overloaded pod.
pub fn generate_pod_disruption_budget(
    nic: &NginxIngressController,
    namespace: &str,
) -> PodDisruptionBudget {
    PodDisruptionBudget {
        metadata: metadata(nic, &nic.resource_name(), Some(namespace)),
        spec: Some(PodDisruptionBudgetSpec {
            max_unavailable: Some(IntOrString::Int(1)),
            selector: Some(LabelSelector {
                match_labels: Some(nic.pod_selector()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::get_unwrap
)]
mod tests {
    use super::*;
    use crate::crd::{DefaultSslCertificate, NginxIngressControllerSpec};
    use crate::resources::common::is_managed;

    fn test_nic(name: &str) -> NginxIngressController {
        let mut nic = NginxIngressController::new(
            name,
            NginxIngressControllerSpec {
                ingress_class_name: format!("{name}.approuting.kubernetes.azure.com"),
                controller_name_prefix: "nginx".to_string(),
                default_ssl_certificate: None,
            },
        );
        nic.metadata.uid = Some("nic-uid".to_string());
        nic
    }

    #[test]
    fn test_desired_resources_are_managed_and_owned() {
        let nic = test_nic("internal");
        let objects = desired_resources(&nic, "app-routing-system").unwrap();
        let kinds: Vec<&str> = objects.iter().map(|o| o.resource.kind.as_str()).collect();
        assert_eq!(
            kinds,
            vec![
                "IngressClass",
                "ServiceAccount",
                "ClusterRole",
                "ClusterRoleBinding",
                "Deployment",
                "Service",
                "PodDisruptionBudget"
            ]
        );
        for object in &objects {
            assert!(is_managed(&object.object.metadata), "{}", object.key());
            let owners = object.object.metadata.owner_references.as_ref().unwrap();
            assert_eq!(owners[0].uid, "nic-uid");
            assert_eq!(owners[0].kind, "NginxIngressController");
        }
    }

    #[test]
    fn test_ingress_class_is_cluster_scoped() {
        let nic = test_nic("internal");
        let class = generate_ingress_class(&nic);
        assert_eq!(
            class.metadata.name.as_deref(),
            Some("internal.approuting.kubernetes.azure.com")
        );
        assert!(class.metadata.namespace.is_none());
        assert_eq!(
            class.spec.unwrap().controller.as_deref(),
            Some("approuting.kubernetes.azure.com/nginx-internal")
        );
    }

    #[test]
    fn test_deployment_selects_pod_labels() {
        let nic = test_nic("internal");
        let deployment = generate_deployment(&nic, "app-routing-system");
        let spec = deployment.spec.unwrap();
        let selector = spec.selector.match_labels.unwrap();
        let pod_labels = spec.template.metadata.unwrap().labels.unwrap();
        for (k, v) in &selector {
            assert_eq!(pod_labels.get(k), Some(v));
        }
        let pod_spec = spec.template.spec.unwrap();
        assert!(pod_spec.volumes.is_none());
        let args = pod_spec.containers[0].args.clone().unwrap();
        assert!(!args.iter().any(|a| a.starts_with("--default-ssl-certificate")));
    }

    #[test]
    fn test_deployment_mounts_default_certificate() {
        let mut nic = test_nic("internal");
        nic.spec.default_ssl_certificate = Some(DefaultSslCertificate {
            key_vault_uri: Some("https://vault.vault.azure.net/certificates/wildcard".to_string()),
        });
        let deployment = generate_deployment(&nic, "app-routing-system");
        let pod_spec = deployment.spec.unwrap().template.spec.unwrap();
        let volume = &pod_spec.volumes.unwrap()[0];
        let csi = volume.csi.as_ref().unwrap();
        assert_eq!(csi.driver, SECRETS_STORE_DRIVER);
        assert_eq!(
            csi.volume_attributes.as_ref().unwrap()["secretProviderClass"],
            "keyvault-nginx-internal"
        );
        let args = pod_spec.containers[0].args.clone().unwrap();
        assert!(args.contains(
            &"--default-ssl-certificate=app-routing-system/keyvault-nginx-internal".to_string()
        ));
    }

    #[test]
    fn test_labels_differ_between_controllers() {
        let a = controller_labels(&test_nic("a"));
        let b = controller_labels(&test_nic("b"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_pdb_allows_single_eviction() {
        let pdb = generate_pod_disruption_budget(&test_nic("internal"), "app-routing-system");
        let spec = pdb.spec.unwrap();
        assert_eq!(spec.max_unavailable, Some(IntOrString::Int(1)));
    }
}
