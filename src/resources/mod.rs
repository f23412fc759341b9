//! Resource generation and lifecycle module.
//!
//! ## Resources Generated
//!
//! | Module | Objects |
//! |----------|---------|
//! | `nginx` | IngressClass, RBAC, Deployment, Service, PDB per NginxIngressController |
//! | `keyvault` | SecretProviderClass per certificate-requesting owner |
//! | `external_dns` | Namespace, RBAC, ConfigMap, Deployment per DNS zone kind |
//!
//! `store`, `lifecycle` and `retriever` converge those objects against the
//! cluster and garbage collect the ones no longer wanted.

pub mod common;
pub mod external_dns;
pub mod keyvault;
pub mod lifecycle;
pub mod nginx;
pub mod retriever;
pub mod store;

// Re-export commonly used items from common
pub use common::{owner_reference, standard_labels};
