//! NginxIngressController Custom Resource Definition.
//!
//! Each NginxIngressController describes one NGINX ingress controller
//! deployment serving a single IngressClass.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Name of the NginxIngressController created at startup
pub const DEFAULT_CONTROLLER_NAME: &str = "default";

/// IngressClass served by the default NginxIngressController
pub const DEFAULT_INGRESS_CLASS: &str = "webapprouting.kubernetes.azure.com";

/// Controller-class prefix written into every managed IngressClass
pub const CONTROLLER_CLASS_PREFIX: &str = "approuting.kubernetes.azure.com";

const DEFAULT_NAME_PREFIX: &str = "nginx";

/// Kubernetes object names are capped at 63 characters for labels and Services.
const MAX_RESOURCE_NAME_LEN: usize = 63;

/// NginxIngressController is a cluster-scoped custom resource describing an
/// NGINX ingress controller managed by App Routing.
///
/// Example:
/// ```yaml
/// apiVersion: approuting.kubernetes.azure.com/v1alpha1
/// kind: NginxIngressController
/// metadata:
///   name: internal
/// spec:
///   ingressClassName: internal.approuting.kubernetes.azure.com
///   controllerNamePrefix: nginx-internal
///   defaultSSLCertificate:
///     keyVaultURI: https://my-vault.vault.azure.net/certificates/wildcard
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "approuting.kubernetes.azure.com",
    version = "v1alpha1",
    kind = "NginxIngressController",
    plural = "nginxingresscontrollers",
    shortname = "nic",
    status = "NginxIngressControllerStatus",
    printcolumn = r#"{"name":"IngressClass", "type":"string", "jsonPath":".spec.ingressClassName"}"#,
    printcolumn = r#"{"name":"ControllerNamePrefix", "type":"string", "jsonPath":".spec.controllerNamePrefix"}"#,
    printcolumn = r#"{"name":"Available", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Available\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NginxIngressControllerSpec {
    /// IngressClass this controller serves. Immutable once created.
    pub ingress_class_name: String,

    /// Prefix of every object name created for this controller.
    #[serde(default = "default_name_prefix")]
    pub controller_name_prefix: String,

    /// Certificate served when an Ingress does not name its own.
    #[serde(
        default,
        rename = "defaultSSLCertificate",
        skip_serializing_if = "Option::is_none"
    )]
    pub default_ssl_certificate: Option<DefaultSslCertificate>,
}

fn default_name_prefix() -> String {
    DEFAULT_NAME_PREFIX.to_string()
}

/// Default certificate sourced from Azure Key Vault.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct DefaultSslCertificate {
    /// Key Vault certificate URI
    #[serde(
        default,
        rename = "keyVaultURI",
        skip_serializing_if = "Option::is_none"
    )]
    pub key_vault_uri: Option<String>,
}

/// Observed state of an NginxIngressController.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NginxIngressControllerStatus {
    /// Conditions describing the current state.
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Generation most recently acted on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Condition describes the state of a resource at a certain point.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition ("True", "False", "Unknown").
    pub status: String,
    /// Machine-readable reason for the condition's last transition.
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: String,
    /// The generation of the resource this condition was observed for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new condition.
    pub fn new(
        condition_type: &str,
        status: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: if status {
                "True".to_string()
            } else {
                "False".to_string()
            },
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: jiff::Timestamp::now().to_string(),
            observed_generation: generation,
        }
    }

    /// Create an "Available" condition.
    pub fn available(available: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new(
            &ConditionType::Available.to_string(),
            available,
            reason,
            message,
            generation,
        )
    }

    /// Create a "Degraded" condition.
    pub fn degraded(degraded: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new(
            &ConditionType::Degraded.to_string(),
            degraded,
            reason,
            message,
            generation,
        )
    }
}

/// Condition types reported on an NginxIngressController.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionType {
    /// Every managed object was applied.
    Available,
    /// At least one managed object failed to apply.
    Degraded,
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionType::Available => write!(f, "Available"),
            ConditionType::Degraded => write!(f, "Degraded"),
        }
    }
}

impl NginxIngressController {
    /// Base name shared by the objects created for this controller.
    ///
    /// The default controller uses the bare prefix so its objects keep the
    /// names earlier releases gave them.
    pub fn resource_name(&self) -> String {
        let name = self.name_any();
        let full = if name == DEFAULT_CONTROLLER_NAME {
            self.spec.controller_name_prefix.clone()
        } else {
            format!("{}-{}", self.spec.controller_name_prefix, name)
        };
        let mut truncated: String = full.chars().take(MAX_RESOURCE_NAME_LEN).collect();
        while truncated.ends_with('-') {
            truncated.pop();
        }
        truncated
    }

    /// Value of the IngressClass `spec.controller` field.
    pub fn controller_class(&self) -> String {
        format!("{}/{}", CONTROLLER_CLASS_PREFIX, self.resource_name())
    }

    /// Labels selecting this controller's pods.
    pub fn pod_selector(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("app".to_string(), self.resource_name())])
    }

    /// Key Vault URI of the default certificate, when one is requested.
    pub fn default_certificate_uri(&self) -> Option<&str> {
        self.spec
            .default_ssl_certificate
            .as_ref()
            .and_then(|c| c.key_vault_uri.as_deref())
            .filter(|uri| !uri.is_empty())
    }

    /// The instance upserted at startup.
    pub fn default_instance() -> Self {
        Self::new(
            DEFAULT_CONTROLLER_NAME,
            NginxIngressControllerSpec {
                ingress_class_name: DEFAULT_INGRESS_CLASS.to_string(),
                controller_name_prefix: default_name_prefix(),
                default_ssl_certificate: None,
            },
        )
    }
}
