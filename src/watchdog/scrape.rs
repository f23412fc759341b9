//! Prometheus text exposition scraping.
//!
//! Only the subset of the text format the watchdog needs is parsed: `# TYPE`
//! comments and sample lines with optional labels and timestamp.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use regex::Regex;
use thiserror::Error;

use crate::controller::error::{Error, Result};

/// Gauge family reporting NGINX connection counts by state
pub const NGINX_CONNECTIONS_METRIC: &str = "nginx_ingress_controller_nginx_process_connections";

const SCRAPE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur while parsing an exposition.
#[derive(Error, Debug, PartialEq)]
pub enum ParseError {
    #[error("Failed to compile regex: {0}")]
    RegexCompilation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Metric family {0} is not a gauge")]
    NotAGauge(String),

    #[error("No sample of {family} with {label}")]
    MissingSample { family: String, label: String },
}

fn parse_labels(raw: &str) -> std::result::Result<BTreeMap<String, String>, ParseError> {
    let label_regex = Regex::new(r#"([a-zA-Z_][a-zA-Z0-9_]*)\s*=\s*"((?:[^"\\]|\\.)*)""#)
        .map_err(|e| ParseError::RegexCompilation(e.to_string()))?;
    Ok(label_regex
        .captures_iter(raw)
        .filter_map(|caps| match (caps.get(1), caps.get(2)) {
            (Some(k), Some(v)) => Some((k.as_str().to_string(), v.as_str().replace("\\\"", "\""))),
            _ => None,
        })
        .collect())
}

/// Value of the sample of gauge `family` whose label `key` equals `value`.
///
/// # Example
/// ```
/// use app_routing_operator::watchdog::scrape::parse_gauge;
///
/// let body = "# TYPE conns gauge\nconns{state=\"active\"} 12\nconns{state=\"idle\"} 3\n";
/// assert_eq!(parse_gauge(body, "conns", ("state", "active")).unwrap(), 12.0);
/// ```
pub fn parse_gauge(
    body: &str,
    family: &str,
    (key, value): (&str, &str),
) -> std::result::Result<f64, ParseError> {
    let sample_regex = Regex::new(r"^([a-zA-Z_:][a-zA-Z0-9_:]*)(?:\{(.*)\})?\s+(\S+)(?:\s+-?\d+)?$")
        .map_err(|e| ParseError::RegexCompilation(e.to_string()))?;
    let type_regex = Regex::new(r"^#\s*TYPE\s+([a-zA-Z_:][a-zA-Z0-9_:]*)\s+(\w+)$")
        .map_err(|e| ParseError::RegexCompilation(e.to_string()))?;

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with('#') {
            if let Some(caps) = type_regex.captures(line)
                && caps.get(1).is_some_and(|m| m.as_str() == family)
                && caps.get(2).is_some_and(|m| m.as_str() != "gauge")
            {
                return Err(ParseError::NotAGauge(family.to_string()));
            }
            continue;
        }

        let Some(caps) = sample_regex.captures(line) else {
            continue;
        };
        if caps.get(1).is_none_or(|m| m.as_str() != family) {
            continue;
        }
        let labels = parse_labels(caps.get(2).map_or("", |m| m.as_str()))?;
        if labels.get(key).map(String::as_str) != Some(value) {
            continue;
        }
        let raw = caps.get(3).map_or("", |m| m.as_str());
        return raw
            .parse::<f64>()
            .map_err(|e| ParseError::Parse(format!("{family} value {raw:?}: {e}")));
    }

    Err(ParseError::MissingSample {
        family: family.to_string(),
        label: format!("{key}=\"{value}\""),
    })
}

/// Reads the current load of one pod.
#[async_trait]
pub trait Scraper: Send + Sync {
    async fn scrape(&self, pod: &Pod) -> Result<f64>;
}

/// Scrapes active connections from the NGINX controller's metrics endpoint.
#[derive(Clone)]
pub struct NginxScraper {
    http: reqwest::Client,
    port: u16,
}

impl NginxScraper {
    pub fn new(port: u16) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(SCRAPE_TIMEOUT)
            .build()
            .map_err(|e| Error::Validation(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, port })
    }

    fn metrics_url(&self, pod: &Pod) -> Option<String> {
        let ip: IpAddr = pod.status.as_ref()?.pod_ip.as_ref()?.parse().ok()?;
        Some(match ip {
            IpAddr::V4(ip) => format!("http://{ip}:{}/metrics", self.port),
            IpAddr::V6(ip) => format!("http://[{ip}]:{}/metrics", self.port),
        })
    }
}

#[async_trait]
impl Scraper for NginxScraper {
    async fn scrape(&self, pod: &Pod) -> Result<f64> {
        let failed = |message: String| Error::Scrape {
            pod: pod.name_any(),
            message,
        };
        let url = self
            .metrics_url(pod)
            .ok_or_else(|| failed("pod has no IP".to_string()))?;
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| failed(e.to_string()))?;
        let body = response.text().await.map_err(|e| failed(e.to_string()))?;
        parse_gauge(&body, NGINX_CONNECTIONS_METRIC, ("state", "active"))
            .map_err(|e| failed(e.to_string()))
    }
}
