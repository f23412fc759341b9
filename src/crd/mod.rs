//! Custom Resource Definitions (CRDs) for the app routing operator.
//!
//! - `NginxIngressController`: one managed NGINX ingress controller per IngressClass

mod nginx_ingress_controller;

pub use nginx_ingress_controller::*;
