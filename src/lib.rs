//! app-routing-operator library crate
//!
//! This module exports the controllers, the NginxIngressController CRD, the
//! managed-resource lifecycle, the concurrency watchdog and the wiring that
//! turns them into manager runnables.

pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;
pub mod watchdog;

pub use health::HealthState;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::controller::{Action, Error as ControllerError};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::utils::Predicate;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{Controller, PredicateConfig, WatchStreamExt, metadata_watcher, predicates, reflector, watcher};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use config::Config;
use controller::context::Context;
use controller::dns_reconciler::{self, DnsReconciler};
use controller::error::{Error, Result};
use controller::keyvault_reconciler;
use controller::manager::{Manager, Periodic, Runnable};
use controller::nginx_reconciler;
use controller::startup::{DefaultNginxController, LegacyCleanup};
use crd::NginxIngressController;
use health::run_health_server;
use resources::retriever::TypeMapper;
use resources::store::ObjectStore;
use watchdog::scrape::NginxScraper;
use watchdog::{KubePodClient, NginxTargets, Watchdog};

/// Create the default watcher configuration for all controllers.
///
/// This ensures consistent behavior across all controllers:
/// - `any_semantic()`: More reliable resource discovery in test environments
fn default_watcher_config() -> WatcherConfig {
    WatcherConfig::default().any_semantic()
}

/// Create a filtered stream for a resource type with standard optimizations.
///
/// This creates a reflector-backed stream that:
/// - Maintains an in-memory cache via reflector
/// - Uses automatic retry with exponential backoff on errors
/// - Converts watch events to objects (Added/Modified only)
/// - Drops events the predicate considers unchanged
///
/// Returns the reflector store (for cache lookups) and the filtered stream.
fn create_filtered_stream<K, P>(
    api: Api<K>,
    watcher_config: WatcherConfig,
    predicate: P,
) -> (
    reflector::Store<K>,
    impl Stream<Item = std::result::Result<K, watcher::Error>>,
)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
    P: Predicate<K> + Send + 'static,
{
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher_config))
        .default_backoff()
        .applied_objects()
        .predicate_filter(predicate, PredicateConfig::default());
    (reader, stream)
}

/// Log the outcome of one controller reconciliation.
///
/// ObjectNotFound/NotFound errors are expected after deletion when related
/// watch events trigger reconciliation for a deleted object, so they are
/// logged at debug level.
fn log_reconcile_result<K>(
    controller: &str,
    result: std::result::Result<(ObjectRef<K>, Action), ControllerError<Error, watcher::Error>>,
) where
    K: Resource,
    K::DynamicType: Debug,
{
    match result {
        Ok((obj, _action)) => {
            debug!(controller = controller, name = %obj.name, "Reconciled");
        }
        Err(e) => {
            let is_not_found = match &e {
                ControllerError::ObjectNotFound(_) => true,
                ControllerError::ReconcilerFailed(err, _) => err.is_not_found(),
                _ => false,
            };
            if is_not_found {
                debug!(controller = controller, "Object no longer exists (likely deleted): {:?}", e);
            } else {
                error!(controller = controller, "Reconciliation error: {:?}", e);
            }
        }
    }
}

/// Run the NginxIngressController controller until `shutdown` fires.
///
/// Deployments are watched in full; Services only through metadata since
/// nothing reads their status.
pub async fn run_nginx_controller(ctx: Arc<Context>, shutdown: CancellationToken) {
    info!("Starting controller for NginxIngressController resources");
    let client = ctx.client.clone();
    let namespace = ctx.config.namespace.clone();

    let nics: Api<NginxIngressController> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), &namespace);
    let services: Api<Service> = Api::namespaced(client, &namespace);

    let watcher_config = default_watcher_config();
    let (reader, stream) =
        create_filtered_stream(nics, watcher_config.clone(), predicates::generation);

    Controller::for_stream(stream, reader)
        .owns(deployments, watcher_config.clone())
        .owns_stream(metadata_watcher(services, watcher_config).touched_objects())
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(
            nginx_reconciler::reconcile,
            nginx_reconciler::error_policy,
            ctx,
        )
        .for_each(|result| async move {
            log_reconcile_result(nginx_reconciler::CONTROLLER_NAME, result);
        })
        .await;
}

/// Run the Ingress SecretProviderClass controller until `shutdown` fires.
///
/// The certificate reference lives in an annotation, so annotation changes
/// trigger reconciles alongside spec changes.
pub async fn run_keyvault_ingress_controller(ctx: Arc<Context>, shutdown: CancellationToken) {
    info!("Starting controller for Ingress SecretProviderClasses");
    let ingresses: Api<Ingress> = Api::all(ctx.client.clone());
    let (reader, stream) = create_filtered_stream(
        ingresses,
        default_watcher_config(),
        predicates::generation.combine(predicates::annotations),
    );

    Controller::for_stream(stream, reader)
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(
            keyvault_reconciler::reconcile_ingress,
            keyvault_reconciler::ingress_error_policy,
            ctx,
        )
        .for_each(|result| async move {
            log_reconcile_result(keyvault_reconciler::INGRESS_CONTROLLER_NAME, result);
        })
        .await;
}

/// Run the NginxIngressController SecretProviderClass controller until
/// `shutdown` fires.
pub async fn run_keyvault_nginx_controller(ctx: Arc<Context>, shutdown: CancellationToken) {
    info!("Starting controller for NginxIngressController SecretProviderClasses");
    let nics: Api<NginxIngressController> = Api::all(ctx.client.clone());
    let (reader, stream) =
        create_filtered_stream(nics, default_watcher_config(), predicates::generation);

    Controller::for_stream(stream, reader)
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(
            keyvault_reconciler::reconcile_nginx,
            keyvault_reconciler::nginx_error_policy,
            ctx,
        )
        .for_each(|result| async move {
            log_reconcile_result(keyvault_reconciler::NGINX_CONTROLLER_NAME, result);
        })
        .await;
}

/// The kube-runtime controllers the operator hosts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchedController {
    NginxIngressController,
    KeyVaultIngress,
    KeyVaultNginx,
}

impl WatchedController {
    pub fn name(self) -> &'static str {
        match self {
            WatchedController::NginxIngressController => nginx_reconciler::CONTROLLER_NAME,
            WatchedController::KeyVaultIngress => keyvault_reconciler::INGRESS_CONTROLLER_NAME,
            WatchedController::KeyVaultNginx => keyvault_reconciler::NGINX_CONTROLLER_NAME,
        }
    }
}

/// A kube-runtime controller as a [`Runnable`].
pub struct ControllerRunnable {
    controller: WatchedController,
    ctx: Arc<Context>,
}

impl ControllerRunnable {
    pub fn new(controller: WatchedController, ctx: Arc<Context>) -> Self {
        Self { controller, ctx }
    }
}

#[async_trait]
impl Runnable for ControllerRunnable {
    fn name(&self) -> &str {
        self.controller.name()
    }

    async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let ctx = self.ctx.clone();
        match self.controller {
            WatchedController::NginxIngressController => {
                run_nginx_controller(ctx, shutdown.clone()).await
            }
            WatchedController::KeyVaultIngress => {
                run_keyvault_ingress_controller(ctx, shutdown.clone()).await
            }
            WatchedController::KeyVaultNginx => {
                run_keyvault_nginx_controller(ctx, shutdown.clone()).await
            }
        }
        if shutdown.is_cancelled() {
            return Err(Error::Cancelled);
        }
        // This should never happen in normal operation
        Err(Error::Transient(format!(
            "controller {} stream ended unexpectedly",
            self.controller.name()
        )))
    }
}

/// The health server as a [`Runnable`]. Probes must answer on every replica,
/// leader or not.
pub struct HealthServer {
    state: Arc<HealthState>,
    port: u16,
}

impl HealthServer {
    pub fn new(state: Arc<HealthState>, port: u16) -> Self {
        Self { state, port }
    }
}

#[async_trait]
impl Runnable for HealthServer {
    fn name(&self) -> &str {
        "health-server"
    }

    async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        tokio::select! {
            result = run_health_server(self.state.clone(), self.port) => {
                result.map_err(|e| Error::Transient(format!("health server: {e}")))
            }
            _ = shutdown.cancelled() => Err(Error::Cancelled),
        }
    }

    fn need_leader_election(&self) -> bool {
        false
    }
}

/// Register every runnable the configuration asks for.
pub fn build_manager(
    client: Client,
    store: Arc<dyn ObjectStore>,
    mapper: Arc<dyn TypeMapper>,
    config: Arc<Config>,
    health_state: Arc<HealthState>,
) -> Result<Manager> {
    let mut manager = Manager::new();
    manager.add(Arc::new(HealthServer::new(
        health_state.clone(),
        config.health_port,
    )));

    let ctx = Arc::new(Context::new(
        client.clone(),
        store.clone(),
        mapper.clone(),
        config.clone(),
        Some(health_state.clone()),
    ));
    for controller in [
        WatchedController::NginxIngressController,
        WatchedController::KeyVaultIngress,
        WatchedController::KeyVaultNginx,
    ] {
        manager.add(Arc::new(ControllerRunnable::new(controller, ctx.clone())));
    }

    manager.add(Arc::new(Periodic::new(
        dns_reconciler::CONTROLLER_NAME,
        config.dns_reconcile_interval(),
        DnsReconciler::new(store.clone(), mapper.clone(), config.clone()),
        Some(health_state.clone()),
    )));

    if config.disable_default_nginx_controller {
        info!("Default NginxIngressController creation disabled");
    } else {
        manager.add(Arc::new(DefaultNginxController::new(store.clone())));
    }

    if config.disable_legacy_cleanup {
        info!("Legacy cleanup disabled");
    } else {
        manager.add(Arc::new(LegacyCleanup::new(store.clone(), mapper)));
    }

    if config.disable_watchdog {
        info!("Concurrency watchdog disabled");
    } else {
        let watchdog_config = config.watchdog();
        let scraper = Arc::new(NginxScraper::new(watchdog_config.metrics_port)?);
        let interval = watchdog_config.interval;
        let watchdog = Watchdog::new(
            watchdog_config,
            Arc::new(NginxTargets::new(store, scraper)),
            Arc::new(KubePodClient::new(client)),
            Some(health_state.clone()),
        );
        manager.add(Arc::new(Periodic::new(
            watchdog::CONTROLLER_NAME,
            interval,
            watchdog,
            Some(health_state),
        )));
    }

    Ok(manager)
}
