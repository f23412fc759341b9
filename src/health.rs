//! Health server for Kubernetes probes and Prometheus metrics.
//!
//! Provides:
//! - `/healthz` - Liveness probe (always returns 200 if server is running)
//! - `/readyz` - Readiness probe (returns 200 when ready to serve traffic)
//! - `/metrics` - Prometheus metrics endpoint

use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tracing::info;

/// Result of a single reconcile
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Error => "error",
        }
    }
}

/// Labels for reconcile outcome metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ReconcileLabels {
    pub controller: String,
    pub outcome: Outcome,
}

impl EncodeLabelSet for ReconcileLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("controller", self.controller.as_str()).encode(encoder.encode_label())?;
        ("outcome", self.outcome.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels carrying only the controller name
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ControllerLabels {
    pub controller: String,
}

impl EncodeLabelSet for ControllerLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("controller", self.controller.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for watchdog metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct TargetLabels {
    pub target: String,
}

impl EncodeLabelSet for TargetLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("target", self.target.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics for the operator
pub struct Metrics {
    /// Reconciles by controller and outcome
    pub reconcile_total: Family<ReconcileLabels, Counter>,
    /// Failed reconciles by controller
    pub reconcile_errors_total: Family<ControllerLabels, Counter>,
    /// Reconcile duration histogram
    pub reconcile_duration_seconds: Family<ControllerLabels, Histogram>,
    /// Votes cast by the concurrency watchdog
    pub watchdog_votes_total: Family<TargetLabels, Counter>,
    /// Evictions issued by the concurrency watchdog
    pub watchdog_evictions_total: Family<TargetLabels, Counter>,
    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics instance with registered metrics
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let reconcile_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "app_routing_reconcile",
            "Total number of reconciles by controller and outcome",
            reconcile_total.clone(),
        );

        let reconcile_errors_total = Family::<ControllerLabels, Counter>::default();
        registry.register(
            "app_routing_reconcile_errors",
            "Total number of reconcile errors by controller",
            reconcile_errors_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<ControllerLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "app_routing_reconcile_duration_seconds",
            "Duration of reconciles in seconds",
            reconcile_duration_seconds.clone(),
        );

        let watchdog_votes_total = Family::<TargetLabels, Counter>::default();
        registry.register(
            "app_routing_watchdog_votes",
            "Votes cast against overloaded ingress controller pods",
            watchdog_votes_total.clone(),
        );

        let watchdog_evictions_total = Family::<TargetLabels, Counter>::default();
        registry.register(
            "app_routing_watchdog_evictions",
            "Ingress controller pods evicted by the watchdog",
            watchdog_evictions_total.clone(),
        );

        Self {
            reconcile_total,
            reconcile_errors_total,
            reconcile_duration_seconds,
            watchdog_votes_total,
            watchdog_evictions_total,
            registry,
        }
    }

    /// Record the outcome of one reconcile
    pub fn record_reconcile(&self, controller: &str, outcome: Outcome, duration_secs: f64) {
        self.reconcile_total
            .get_or_create(&ReconcileLabels {
                controller: controller.to_string(),
                outcome,
            })
            .inc();
        let labels = ControllerLabels {
            controller: controller.to_string(),
        };
        if outcome == Outcome::Error {
            self.reconcile_errors_total.get_or_create(&labels).inc();
        }
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Number of reconciles recorded for a controller and outcome
    pub fn reconcile_count(&self, controller: &str, outcome: Outcome) -> u64 {
        self.reconcile_total
            .get_or_create(&ReconcileLabels {
                controller: controller.to_string(),
                outcome,
            })
            .get()
    }

    /// Number of reconcile errors recorded for a controller
    pub fn error_count(&self, controller: &str) -> u64 {
        self.reconcile_errors_total
            .get_or_create(&ControllerLabels {
                controller: controller.to_string(),
            })
            .get()
    }

    pub fn record_vote(&self, target: &str) {
        self.watchdog_votes_total
            .get_or_create(&TargetLabels {
                target: target.to_string(),
            })
            .inc();
    }

    pub fn record_eviction(&self, target: &str) {
        self.watchdog_evictions_total
            .get_or_create(&TargetLabels {
                target: target.to_string(),
            })
            .inc();
    }

    /// Encode metrics to Prometheus text format
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the operator is ready (acquired leadership and running controllers)
    ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
    /// Last successful reconcile timestamp (Unix epoch seconds)
    pub last_reconcile: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (starts as not ready)
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
            last_reconcile: AtomicU64::new(0),
        }
    }

    /// Mark the operator as ready or not ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the operator is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

/// Liveness probe handler
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 503 Service Unavailable until the controllers are running.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Run the health server on `0.0.0.0:port`.
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!(port = port, "Starting health server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
