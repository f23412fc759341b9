//! Controller module for app-routing-operator.
//!
//! Contains the reconcilers, the runnable host, error handling and status
//! management.
//!
//! Event-triggered reconcilers run under kube-runtime controllers:
//! - NginxIngressController (nginx_reconciler)
//! - Key Vault SecretProviderClasses (keyvault_reconciler)
//!
//! Interval-triggered and one-shot work runs as manager runnables:
//! - external DNS (dns_reconciler)
//! - default controller creation and legacy cleanup (startup)

// Shared modules
pub mod common;
pub mod context;
pub mod error;
pub mod manager;
pub mod status;

// Reconcilers
pub mod dns_reconciler;
pub mod keyvault_reconciler;
pub mod nginx_reconciler;
pub mod startup;
