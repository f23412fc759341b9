//! app-routing-operator - manages ingress, DNS and certificate infrastructure
//! for the AKS App Routing add-on.
//!
//! This is the main entry point that:
//! - Initializes structured logging
//! - Parses and validates configuration
//! - Creates the Kubernetes client, object store and type mapper
//! - Runs leader election (required for HA deployments)
//! - Hands every runnable to the manager and waits for shutdown

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use app_routing_operator::build_manager;
use app_routing_operator::config::Config;
use app_routing_operator::health::HealthState;
use app_routing_operator::resources::retriever::DiscoveryTypeMapper;
use app_routing_operator::resources::store::KubeStore;

/// Lease configuration
const LEASE_TTL_SECS: u64 = 15;
const LEASE_RENEW_INTERVAL_SECS: u64 = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("app_routing_operator=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .json()
        .init();

    info!("Starting app-routing-operator");

    let mut config = Config::parse();
    config.validate().context("invalid configuration")?;

    // Get pod identity for leader election and event reporting
    let pod_name = config.pod_name.clone().unwrap_or_else(|| {
        warn!("POD_NAME not set, using hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    });
    config.pod_name = Some(pod_name.clone());
    let config = Arc::new(config);

    // Create Kubernetes client
    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    let mapper = DiscoveryTypeMapper::run(client.clone())
        .await
        .context("API discovery failed")?;
    let store = Arc::new(KubeStore::new(client.clone()));
    let health_state = Arc::new(HealthState::new());

    let manager = build_manager(
        client.clone(),
        store,
        Arc::new(mapper),
        config.clone(),
        health_state.clone(),
    )
    .context("failed to build manager")?;
    info!(runnables = ?manager.names(), "Runnables registered");

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        let health_state = health_state.clone();
        tokio::spawn(async move {
            if let Err(e) = shutdown_signal().await {
                error!("Failed to install signal handlers: {}", e);
            } else {
                info!("Received shutdown signal, initiating graceful shutdown...");
            }
            // Mark as not ready to stop receiving new work
            health_state.set_ready(false).await;
            shutdown.cancel();
        });
    }

    info!(
        holder_id = %pod_name,
        namespace = %config.namespace,
        lease_name = %config.lease_name,
        "Initializing leader election"
    );
    let elected = acquire_leadership(
        lease_lock(&client, &config, &pod_name),
        health_state,
        shutdown.clone(),
    );

    manager.run(shutdown, elected).await?;
    info!("Operator stopped");
    Ok(())
}

fn lease_lock(client: &Client, config: &Config, holder_id: &str) -> LeaseLock {
    LeaseLock::new(
        client.clone(),
        &config.namespace,
        LeaseLockParams {
            holder_id: holder_id.to_string(),
            lease_name: config.lease_name.clone(),
            lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
        },
    )
}

/// Resolves once this replica holds the lease, then keeps renewing it in the
/// background. Losing the lease exits the process so Kubernetes restarts us
/// and we re-enter election.
async fn acquire_leadership(
    lease_lock: LeaseLock,
    health_state: Arc<HealthState>,
    shutdown: CancellationToken,
) {
    info!("Waiting to acquire leadership...");
    loop {
        match lease_lock.try_acquire_or_renew().await {
            Ok(result) if matches!(result, LeaseLockResult::Acquired(_)) => {
                info!("Acquired leadership");
                break;
            }
            Ok(_) => info!("Another instance is leader, waiting..."),
            Err(e) => warn!("Failed to acquire lease: {}, retrying...", e),
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)) => {}
            _ = shutdown.cancelled() => return,
        }
    }
    health_state.set_ready(true).await;

    #[allow(clippy::exit)]
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)) => {}
                _ = shutdown.cancelled() => return,
            }
            match lease_lock.try_acquire_or_renew().await {
                Ok(result) if matches!(result, LeaseLockResult::Acquired(_)) => {}
                Ok(_) => {
                    error!("Lost leadership! Shutting down...");
                    std::process::exit(1);
                }
                Err(e) => {
                    error!("Failed to renew lease: {}. Shutting down...", e);
                    std::process::exit(1);
                }
            }
        }
    });
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await
    }
}
