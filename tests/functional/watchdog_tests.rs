//! Concurrency watchdog scenarios.
//!
//! Ticks are driven with explicit timestamps one minute apart; pods are an
//! hour old unless a test says otherwise.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use jiff::{SignedDuration, Timestamp};

use app_routing_operator::config::WatchdogConfig;
use app_routing_operator::health::HealthState;
use app_routing_operator::watchdog::{StaticTargets, Watchdog, WatchdogTarget};

use crate::fake_cluster::{FakePods, FakeScraper, pod};

const TARGET: &str = "default";

fn start() -> Timestamp {
    "2026-01-01T12:00:00Z".parse().unwrap()
}

fn minutes(n: i64) -> Timestamp {
    start() + SignedDuration::from_mins(n)
}

fn config(min_votes: usize, threshold: f64) -> WatchdogConfig {
    WatchdogConfig {
        namespace: "app-routing-system".to_string(),
        interval: Duration::from_secs(60),
        vote_ttl: Duration::from_secs(600),
        min_pod_age: Duration::from_secs(300),
        min_votes_before_eviction: min_votes,
        min_percent_over_avg_before_vote: threshold,
        metrics_port: 10254,
    }
}

struct Harness {
    watchdog: Watchdog,
    pods: Arc<FakePods>,
    scraper: Arc<FakeScraper>,
    health: Arc<HealthState>,
}

fn harness(config: WatchdogConfig, ready: &[bool]) -> Harness {
    let created = start() - SignedDuration::from_hours(1);
    let pods = Arc::new(FakePods::new(
        ready
            .iter()
            .enumerate()
            .map(|(i, ready)| pod(&format!("pod-{}", i + 1), *ready, created))
            .collect(),
    ));
    let scraper = Arc::new(FakeScraper::new());
    let targets = StaticTargets(vec![WatchdogTarget {
        name: TARGET.to_string(),
        scraper: scraper.clone(),
        pod_selector: BTreeMap::from([("app".to_string(), "nginx".to_string())]),
    }]);
    let health = Arc::new(HealthState::new());
    let watchdog = Watchdog::new(
        config,
        Arc::new(targets),
        pods.clone(),
        Some(health.clone()),
    );
    Harness {
        watchdog,
        pods,
        scraper,
        health,
    }
}

#[tokio::test]
async fn test_watchdog_quorum() {
    let mut h = harness(config(2, 150.0), &[true; 5]);
    let schedule: [&[f64]; 4] = [
        &[10.0, 10.0, 10.0, 10.0, 10.0],
        &[10.0, 20.0, 10.0, 10.0, 10.0],
        &[10.0, 10.0, 10.0, 10.0, 10.0],
        &[10.0, 20.0, 10.0, 10.0, 10.0],
    ];

    let mut reports = Vec::new();
    for (minute, loads) in schedule.iter().enumerate() {
        h.scraper.set_loads(loads);
        reports.push(h.watchdog.tick_at(minutes(minute as i64)).await.unwrap());
    }

    // 20 over an average of 12 ranks 166%, above the 150% threshold.
    assert!(reports[0].votes.is_empty());
    assert_eq!(reports[1].votes, vec![(TARGET.to_string(), "pod-2".to_string())]);
    assert!(reports[1].evictions.is_empty());
    assert!(reports[2].votes.is_empty());
    assert!(reports[2].evictions.is_empty());
    assert_eq!(reports[3].evictions, vec![(TARGET.to_string(), "pod-2".to_string())]);
    assert_eq!(h.pods.evicted(), vec!["pod-2".to_string()]);
}

#[tokio::test]
async fn test_single_spike_votes_without_evicting() {
    let mut h = harness(config(3, 200.0), &[true; 5]);
    h.scraper.set_loads(&[10.0, 10.0, 10.0, 10.0, 30.0]);

    let report = h.watchdog.tick_at(start()).await.unwrap();

    assert_eq!(report.votes, vec![(TARGET.to_string(), "pod-5".to_string())]);
    assert!(report.evictions.is_empty());
    assert_eq!(h.watchdog.ring(TARGET).unwrap().len(), 1);
}

#[tokio::test]
async fn test_at_most_one_vote_per_tick() {
    let mut h = harness(config(1, 150.0), &[true; 5]);
    h.scraper.set_loads(&[1.0, 1.0, 1.0, 40.0, 40.0]);

    let report = h.watchdog.tick_at(start()).await.unwrap();

    // The last qualifying pod wins the vote, and with one vote needed it is
    // the only eviction.
    assert_eq!(report.votes, vec![(TARGET.to_string(), "pod-5".to_string())]);
    assert_eq!(report.evictions, vec![(TARGET.to_string(), "pod-5".to_string())]);
}

#[tokio::test]
async fn test_too_few_ready_pods_skip_voting() {
    let mut h = harness(config(1, 150.0), &[true, true, false]);
    h.scraper.set_loads(&[1.0, 100.0, 1.0]);

    let report = h.watchdog.tick_at(start()).await.unwrap();

    assert!(report.votes.is_empty());
    assert!(report.evictions.is_empty());
    assert!(h.watchdog.ring(TARGET).is_none());
}

#[tokio::test]
async fn test_unready_pods_are_excluded_from_the_average() {
    // Counting the idle unready pod would put pod-1 at 200% of the average.
    let mut h = harness(config(1, 200.0), &[true, true, true, false]);
    h.scraper.set_loads(&[50.0, 25.0, 25.0, 0.0]);

    let report = h.watchdog.tick_at(start()).await.unwrap();

    assert!(report.votes.is_empty());
}

#[tokio::test]
async fn test_scrape_failures_are_reported_but_do_not_stop_voting() {
    let mut h = harness(config(2, 150.0), &[true; 4]);
    h.scraper.set_loads(&[10.0, 10.0, 40.0, 10.0]);
    h.scraper.forget("pod-4");

    let result = h.watchdog.tick_at(start()).await;

    assert!(result.is_err());
    let votes: Vec<_> = h
        .watchdog
        .ring(TARGET)
        .unwrap()
        .votes()
        .map(|v| v.pod_name.clone())
        .collect();
    assert_eq!(votes, vec!["pod-3".to_string()]);
}

#[tokio::test]
async fn test_young_pods_are_not_voted_against() {
    let mut h = harness(config(1, 150.0), &[true; 3]);
    let mut pods: Vec<_> = ["pod-1", "pod-2"]
        .iter()
        .map(|name| pod(name, true, start() - SignedDuration::from_hours(1)))
        .collect();
    pods.push(pod("pod-3", true, start() - SignedDuration::from_mins(2)));
    h.pods.set(pods);
    h.scraper.set_loads(&[1.0, 1.0, 50.0]);

    let report = h.watchdog.tick_at(start()).await.unwrap();

    assert!(report.votes.is_empty());
}

#[tokio::test]
async fn test_votes_expire_after_ttl() {
    let mut h = harness(config(2, 150.0), &[true; 4]);
    h.scraper.set_loads(&[10.0, 10.0, 40.0, 10.0]);

    let first = h.watchdog.tick_at(start()).await.unwrap();
    assert_eq!(first.votes.len(), 1);

    // Eleven minutes later the first vote is past its ten minute TTL.
    let second = h.watchdog.tick_at(minutes(11)).await.unwrap();
    assert_eq!(second.votes.len(), 1);
    assert!(second.evictions.is_empty());

    let third = h.watchdog.tick_at(minutes(12)).await.unwrap();
    assert_eq!(third.evictions, vec![(TARGET.to_string(), "pod-3".to_string())]);
}

#[tokio::test]
async fn test_votes_for_vanished_pods_do_not_count() {
    let mut h = harness(config(2, 150.0), &[true; 4]);
    h.scraper.set_loads(&[10.0, 10.0, 40.0, 10.0]);
    h.watchdog.tick_at(start()).await.unwrap();

    // pod-3 is replaced by pod-5 which is equally hot.
    let created = start() - SignedDuration::from_hours(1);
    h.pods.set(
        ["pod-1", "pod-2", "pod-5", "pod-4"]
            .iter()
            .map(|name| pod(name, true, created))
            .collect(),
    );
    h.scraper.set_loads(&[10.0, 10.0, 0.0, 10.0, 40.0]);

    let report = h.watchdog.tick_at(minutes(1)).await.unwrap();

    assert_eq!(report.votes, vec![(TARGET.to_string(), "pod-5".to_string())]);
    assert!(report.evictions.is_empty());
}

#[tokio::test]
async fn test_failed_eviction_is_not_an_error() {
    let mut h = harness(config(1, 150.0), &[true; 3]);
    h.pods.reject_evictions();
    h.scraper.set_loads(&[1.0, 1.0, 50.0]);

    let report = h.watchdog.tick_at(start()).await.unwrap();

    assert_eq!(report.votes.len(), 1);
    assert!(report.evictions.is_empty());
    assert!(h.pods.evicted().is_empty());
}

#[tokio::test]
async fn test_idle_target_records_nothing() {
    let mut h = harness(config(1, 150.0), &[true; 3]);
    h.scraper.set_loads(&[0.0, 0.0, 0.0]);

    let report = h.watchdog.tick_at(start()).await.unwrap();

    assert_eq!(report, Default::default());
}

#[tokio::test]
async fn test_votes_and_evictions_are_counted() {
    let mut h = harness(config(1, 150.0), &[true; 3]);
    h.scraper.set_loads(&[1.0, 1.0, 50.0]);

    h.watchdog.tick_at(start()).await.unwrap();

    let metrics = h.health.metrics.encode();
    assert!(metrics.contains("app_routing_watchdog_votes_total"));
    assert!(metrics.contains("app_routing_watchdog_evictions_total"));
}
