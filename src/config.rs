//! Operator configuration.
//!
//! Every flag has an environment-variable twin so the operator can be
//! configured from its Deployment manifest alone.

use std::time::Duration;

use clap::Parser;
use regex::Regex;

use crate::controller::error::{Error, Result};
use crate::resources::common::DEFAULT_OPERATOR_NAMESPACE;

/// Command-line and environment configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "app-routing-operator", version, about, long_about = None)]
pub struct Config {
    /// Namespace the operator and its shared components run in
    #[arg(long, env = "POD_NAMESPACE", default_value = DEFAULT_OPERATOR_NAMESPACE)]
    pub namespace: String,

    /// Identity used for leader election and event reporting
    #[arg(long, env = "POD_NAME")]
    pub pod_name: Option<String>,

    /// Azure DNS zone resource IDs (public or private), comma separated
    #[arg(long, env = "DNS_ZONE_IDS", value_delimiter = ',')]
    pub dns_zone_ids: Vec<String>,

    /// Azure tenant that owns the DNS zones
    #[arg(long, env = "AZURE_TENANT_ID", default_value = "")]
    pub tenant_id: String,

    /// Client ID of the managed identity external-dns authenticates as
    #[arg(long, env = "MSI_CLIENT_ID", default_value = "")]
    pub msi_client_id: String,

    /// Azure cloud name written into the external-dns config
    #[arg(long, env = "AZURE_CLOUD", default_value = "AzurePublicCloud")]
    pub cloud: String,

    /// Seconds between DNS reconciliation passes
    #[arg(long, env = "DNS_RECONCILE_INTERVAL_SECS", default_value_t = 60)]
    pub dns_reconcile_interval_secs: u64,

    /// Do not create the default NginxIngressController
    #[arg(long, env = "DISABLE_DEFAULT_NGINX_CONTROLLER")]
    pub disable_default_nginx_controller: bool,

    /// Do not purge resources shipped by earlier operator versions
    #[arg(long, env = "DISABLE_LEGACY_CLEANUP")]
    pub disable_legacy_cleanup: bool,

    /// Disable the concurrency watchdog
    #[arg(long, env = "DISABLE_WATCHDOG")]
    pub disable_watchdog: bool,

    /// Seconds between watchdog ticks
    #[arg(long, env = "WATCHDOG_INTERVAL_SECS", default_value_t = 60)]
    pub watchdog_interval_secs: u64,

    /// Seconds a watchdog vote stays live
    #[arg(long, env = "WATCHDOG_VOTE_TTL_SECS", default_value_t = 600)]
    pub watchdog_vote_ttl_secs: u64,

    /// Minimum pod age in seconds before a pod can be voted against
    #[arg(long, env = "WATCHDOG_MIN_POD_AGE_SECS", default_value_t = 300)]
    pub watchdog_min_pod_age_secs: u64,

    /// Live votes needed before a pod is evicted
    #[arg(long, env = "WATCHDOG_MIN_VOTES", default_value_t = 3)]
    pub watchdog_min_votes: usize,

    /// Load relative to the average, in percent, that earns a vote
    #[arg(long, env = "WATCHDOG_MIN_PERCENT_OVER_AVG", default_value_t = 200.0)]
    pub watchdog_min_percent_over_avg: f64,

    /// Port of the ingress controller's Prometheus endpoint
    #[arg(long, env = "WATCHDOG_METRICS_PORT", default_value_t = 10254)]
    pub watchdog_metrics_port: u16,

    /// Port for /healthz, /readyz and /metrics
    #[arg(long, env = "HEALTH_PORT", default_value_t = 8080)]
    pub health_port: u16,

    /// Name of the leader election Lease
    #[arg(long, env = "LEASE_NAME", default_value = "aks-app-routing-operator-leader")]
    pub lease_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_OPERATOR_NAMESPACE.to_string(),
            pod_name: None,
            dns_zone_ids: Vec::new(),
            tenant_id: String::new(),
            msi_client_id: String::new(),
            cloud: "AzurePublicCloud".to_string(),
            dns_reconcile_interval_secs: 60,
            disable_default_nginx_controller: false,
            disable_legacy_cleanup: false,
            disable_watchdog: false,
            watchdog_interval_secs: 60,
            watchdog_vote_ttl_secs: 600,
            watchdog_min_pod_age_secs: 300,
            watchdog_min_votes: 3,
            watchdog_min_percent_over_avg: 200.0,
            watchdog_metrics_port: 10254,
            health_port: 8080,
            lease_name: "aks-app-routing-operator-leader".to_string(),
        }
    }
}

/// Whether a DNS zone is publicly resolvable or attached to a VNet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DnsZoneKind {
    Public,
    Private,
}

/// A parsed Azure DNS zone resource ID.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DnsZoneId {
    pub subscription: String,
    pub resource_group: String,
    pub name: String,
    pub kind: DnsZoneKind,
    /// The ID as configured
    pub raw: String,
}

impl std::str::FromStr for DnsZoneId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let re = Regex::new(
            r"(?i)^/subscriptions/([^/]+)/resourcegroups/([^/]+)/providers/microsoft\.network/(dnszones|privatednszones)/([^/]+)$",
        )
        .map_err(|e| Error::Validation(e.to_string()))?;
        let caps = re
            .captures(s.trim())
            .ok_or_else(|| Error::Validation(format!("invalid DNS zone ID: {s}")))?;
        let group = |i: usize| caps.get(i).map(|m| m.as_str().to_string()).unwrap_or_default();
        let kind = if group(3).eq_ignore_ascii_case("privatednszones") {
            DnsZoneKind::Private
        } else {
            DnsZoneKind::Public
        };
        Ok(Self {
            subscription: group(1),
            resource_group: group(2),
            name: group(4).to_lowercase(),
            kind,
            raw: s.trim().to_string(),
        })
    }
}

/// Tunables of the concurrency watchdog.
#[derive(Clone, Debug)]
pub struct WatchdogConfig {
    pub namespace: String,
    pub interval: Duration,
    pub vote_ttl: Duration,
    pub min_pod_age: Duration,
    pub min_votes_before_eviction: usize,
    pub min_percent_over_avg_before_vote: f64,
    pub metrics_port: u16,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Config::default().watchdog()
    }
}

impl Config {
    /// Parsed zone IDs split by kind. Rejects malformed IDs and zones of one
    /// kind spread across subscriptions or resource groups.
    pub fn dns_zones(&self) -> Result<(Vec<DnsZoneId>, Vec<DnsZoneId>)> {
        let mut public = Vec::new();
        let mut private = Vec::new();
        for raw in self.dns_zone_ids.iter().filter(|id| !id.trim().is_empty()) {
            let zone: DnsZoneId = raw.parse()?;
            match zone.kind {
                DnsZoneKind::Public => public.push(zone),
                DnsZoneKind::Private => private.push(zone),
            }
        }
        for zones in [&public, &private] {
            if let Some(first) = zones.first()
                && zones.iter().any(|z| {
                    !z.subscription.eq_ignore_ascii_case(&first.subscription)
                        || !z.resource_group.eq_ignore_ascii_case(&first.resource_group)
                })
            {
                return Err(Error::Validation(
                    "DNS zones of one kind must share a subscription and resource group"
                        .to_string(),
                ));
            }
        }
        Ok((public, private))
    }

    /// Check everything that can be checked before talking to the cluster.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::Validation("namespace must not be empty".to_string()));
        }
        if self.watchdog_min_votes == 0 {
            return Err(Error::Validation(
                "watchdog minimum votes must be at least 1".to_string(),
            ));
        }
        if self.dns_reconcile_interval_secs == 0 || self.watchdog_interval_secs == 0 {
            return Err(Error::Validation(
                "reconcile intervals must be at least one second".to_string(),
            ));
        }
        if self.watchdog_min_percent_over_avg <= 100.0 {
            return Err(Error::Validation(
                "watchdog threshold must be above 100 percent".to_string(),
            ));
        }
        self.dns_zones().map(|_| ())
    }

    pub fn dns_reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.dns_reconcile_interval_secs)
    }

    pub fn watchdog(&self) -> WatchdogConfig {
        WatchdogConfig {
            namespace: self.namespace.clone(),
            interval: Duration::from_secs(self.watchdog_interval_secs),
            vote_ttl: Duration::from_secs(self.watchdog_vote_ttl_secs),
            min_pod_age: Duration::from_secs(self.watchdog_min_pod_age_secs),
            min_votes_before_eviction: self.watchdog_min_votes,
            min_percent_over_avg_before_vote: self.watchdog_min_percent_over_avg,
            metrics_port: self.watchdog_metrics_port,
        }
    }
}
