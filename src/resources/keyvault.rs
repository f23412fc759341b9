//! Azure Key Vault SecretProviderClass generation.
//!
//! A `secrets-store.csi.x-k8s.io/v1` SecretProviderClass is produced for every
//! owner that asks for a Key Vault certificate. The CSI driver syncs the
//! certificate into a TLS Secret named after the SecretProviderClass.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use kube::api::DynamicObject;
use reqwest::Url;
use serde_json::json;
use tracing::{debug, info};

use crate::controller::error::Result;
use crate::crd::NginxIngressController;
use crate::resources::common::{managed_meta, owner_reference, standard_labels};
use crate::resources::lifecycle::{delete_if_managed, upsert};
use crate::resources::store::{ManagedObject, ObjectKey, ObjectStore, ResourceType};

/// Annotation on an Ingress naming its Key Vault certificate
pub const KEYVAULT_URI_ANNOTATION: &str = "kubernetes.azure.com/tls-cert-keyvault-uri";

/// CSI driver name serving SecretProviderClass volumes
pub const SECRETS_STORE_DRIVER: &str = "secrets-store.csi.k8s.io";

/// Event reason for unusable certificate references
pub const INVALID_INPUT_REASON: &str = "InvalidInput";

const COMPONENT: &str = "keyvault";

/// Storage resource of SecretProviderClass.
pub fn spc_resource() -> ResourceType {
    ResourceType {
        group: "secrets-store.csi.x-k8s.io".to_string(),
        version: "v1".to_string(),
        kind: "SecretProviderClass".to_string(),
        plural: "secretproviderclasses".to_string(),
        namespaced: true,
    }
}

/// Why a Key Vault URI was rejected.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyVaultUriError {
    #[error("invalid URI: {0}")]
    Malformed(String),
    #[error("URI must use https")]
    NotHttps,
    #[error("URI has no Key Vault host")]
    MissingHost,
    #[error("URI path contains too few segments")]
    TooFewSegments,
    #[error("URI path contains too many segments")]
    TooManySegments,
}

/// A certificate object in Azure Key Vault.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyVaultCertificate {
    pub vault_name: String,
    pub object_name: String,
    pub object_version: Option<String>,
}

impl std::str::FromStr for KeyVaultCertificate {
    type Err = KeyVaultUriError;

    /// Parses `https://<vault>.<dns-suffix>/<type>/<name>[/<version>]`.
    fn from_str(uri: &str) -> std::result::Result<Self, Self::Err> {
        let url = Url::parse(uri.trim()).map_err(|e| KeyVaultUriError::Malformed(e.to_string()))?;
        if url.scheme() != "https" {
            return Err(KeyVaultUriError::NotHttps);
        }
        let vault_name = url
            .host_str()
            .and_then(|host| host.split('.').next())
            .filter(|name| !name.is_empty())
            .ok_or(KeyVaultUriError::MissingHost)?
            .to_string();

        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|segment| !segment.is_empty()).collect())
            .unwrap_or_default();
        match segments.as_slice() {
            [_, name] => Ok(Self {
                vault_name,
                object_name: (*name).to_string(),
                object_version: None,
            }),
            [_, name, version] => Ok(Self {
                vault_name,
                object_name: (*name).to_string(),
                object_version: Some((*version).to_string()),
            }),
            [] | [_] => Err(KeyVaultUriError::TooFewSegments),
            _ => Err(KeyVaultUriError::TooManySegments),
        }
    }
}

/// Identity the CSI driver authenticates to Key Vault with.
#[derive(Clone, Debug, Default)]
pub struct SpcIdentity {
    pub tenant_id: String,
    pub client_id: String,
}

/// Objects that can own a SecretProviderClass.
#[derive(Clone, Copy, Debug)]
pub enum SpcOwner<'a> {
    Ingress(&'a Ingress),
    NginxIngressController(&'a NginxIngressController),
}

impl SpcOwner<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            SpcOwner::Ingress(_) => "Ingress",
            SpcOwner::NginxIngressController(_) => "NginxIngressController",
        }
    }

    pub fn name(&self) -> String {
        match self {
            SpcOwner::Ingress(ingress) => ingress.name_any(),
            SpcOwner::NginxIngressController(nic) => nic.name_any(),
        }
    }

    /// Reference events about this owner attach to.
    pub fn object_ref(&self) -> ObjectReference {
        match self {
            SpcOwner::Ingress(ingress) => ingress.object_ref(&()),
            SpcOwner::NginxIngressController(nic) => nic.object_ref(&()),
        }
    }

    /// Name of the SecretProviderClass and of the Secret it syncs.
    pub fn spc_name(&self) -> String {
        match self {
            SpcOwner::Ingress(ingress) => format!("keyvault-{}", ingress.name_any()),
            SpcOwner::NginxIngressController(nic) => format!("keyvault-nginx-{}", nic.name_any()),
        }
    }

    /// Namespace the SecretProviderClass lives in.
    pub fn namespace(&self, operator_namespace: &str) -> String {
        match self {
            SpcOwner::Ingress(ingress) => ingress
                .namespace()
                .unwrap_or_else(|| "default".to_string()),
            SpcOwner::NginxIngressController(_) => operator_namespace.to_string(),
        }
    }

    /// Requested certificate URI, if any.
    pub fn certificate_uri(&self) -> Option<&str> {
        match self {
            SpcOwner::Ingress(ingress) => ingress
                .annotations()
                .get(KEYVAULT_URI_ANNOTATION)
                .map(String::as_str)
                .filter(|uri| !uri.trim().is_empty()),
            SpcOwner::NginxIngressController(nic) => nic.default_certificate_uri(),
        }
    }

    pub fn owner_reference(&self) -> OwnerReference {
        match self {
            SpcOwner::Ingress(ingress) => owner_reference(*ingress),
            SpcOwner::NginxIngressController(nic) => owner_reference(*nic),
        }
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        standard_labels(&self.spc_name(), COMPONENT)
    }
}

/// Whether an Ingress uses one of the given ingress classes.
pub fn ingress_uses_class(ingress: &Ingress, classes: &[String]) -> bool {
    ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.ingress_class_name.as_ref())
        .is_some_and(|class| classes.iter().any(|c| c == class))
}

/// Build the SecretProviderClass for `owner`.
pub fn build_secret_provider_class(
    owner: &SpcOwner<'_>,
    certificate: &KeyVaultCertificate,
    operator_namespace: &str,
    identity: &SpcIdentity,
) -> Result<ManagedObject> {
    let name = owner.spc_name();
    let namespace = owner.namespace(operator_namespace);
    let objects = format!(
        "array:\n  - |\n    objectName: {}\n    objectType: secret\n    objectVersion: {}\n",
        certificate.object_name,
        certificate.object_version.as_deref().unwrap_or_default()
    );

    let mut object = DynamicObject::new(&name, &spc_resource().api_resource()).within(&namespace);
    object.metadata = managed_meta(
        &name,
        Some(&namespace),
        owner.labels(),
        Some(owner.owner_reference()),
    );
    object.data = json!({
        "spec": {
            "provider": "azure",
            "parameters": {
                "keyvaultName": certificate.vault_name,
                "objects": objects,
                "tenantId": identity.tenant_id,
                "useVMManagedIdentity": "true",
                "userAssignedIdentityID": identity.client_id,
            },
            "secretObjects": [{
                "secretName": name,
                "type": "kubernetes.io/tls",
                "data": [
                    { "objectName": certificate.object_name, "key": "tls.key" },
                    { "objectName": certificate.object_name, "key": "tls.crt" },
                ],
            }],
        }
    });
    Ok(ManagedObject::from_dynamic(spc_resource(), object))
}

/// Result of converging one owner's SecretProviderClass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SpcOutcome {
    /// The SecretProviderClass was upserted.
    Applied(ObjectKey),
    /// A previously created SecretProviderClass was deleted.
    Removed,
    /// No SecretProviderClass is wanted and none exists.
    Absent,
    /// The owner's certificate reference is unusable; nothing was changed.
    InvalidInput(String),
}

/// Converge the SecretProviderClass of `owner`.
///
/// `eligible` is false when the owner is outside App Routing's control (for
/// example an Ingress of a foreign class), in which case any existing
/// SecretProviderClass is removed.
pub async fn reconcile_spc(
    store: &dyn ObjectStore,
    owner: &SpcOwner<'_>,
    eligible: bool,
    operator_namespace: &str,
    identity: &SpcIdentity,
) -> Result<SpcOutcome> {
    let uri = match owner.certificate_uri() {
        Some(uri) if eligible => uri,
        _ => return remove_spc(store, owner, operator_namespace).await,
    };

    let certificate: KeyVaultCertificate = match uri.parse() {
        Ok(certificate) => certificate,
        Err(e) => {
            let message = format!("invalid Key Vault certificate URI {uri:?}: {e}");
            debug!(kind = owner.kind(), name = %owner.name(), error = %e, "Rejecting certificate URI");
            return Ok(SpcOutcome::InvalidInput(message));
        }
    };

    let spc = build_secret_provider_class(owner, &certificate, operator_namespace, identity)?;
    upsert(store, &spc).await?;
    info!(kind = owner.kind(), name = %owner.name(), spc = %spc.key(), "Applied SecretProviderClass");
    Ok(SpcOutcome::Applied(spc.key()))
}

async fn remove_spc(
    store: &dyn ObjectStore,
    owner: &SpcOwner<'_>,
    operator_namespace: &str,
) -> Result<SpcOutcome> {
    let resource = spc_resource();
    let namespace = owner.namespace(operator_namespace);
    let existing = store
        .get(&resource, Some(&namespace), &owner.spc_name())
        .await?;
    match existing {
        Some(object) if delete_if_managed(store, &resource, &object).await? => {
            info!(kind = owner.kind(), name = %owner.name(), "Removed SecretProviderClass");
            Ok(SpcOutcome::Removed)
        }
        _ => Ok(SpcOutcome::Absent),
    }
}
