//! Health tracking — consecutive-threshold readiness and the HTTP probe

use crate::config::HealthCheckConfig;
use crate::error::Result;
use crate::platform::{HealthProbe, ReplicaInfo};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

/// Readiness as judged by consecutive probe results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Not yet past the healthy threshold
    Pending,
    Healthy,
    Unhealthy,
}

/// Consecutive success/failure counter for one replica
#[derive(Debug, Clone)]
pub struct HealthTracker {
    healthy_threshold: u32,
    unhealthy_threshold: u32,
    grace_period: Duration,
    started_at: Instant,
    successes: u32,
    failures: u32,
    readiness: Readiness,
    total_probes: u32,
    failed_probes: u32,
}

impl HealthTracker {
    /// Tracker for a replica that started now
    pub fn new(config: &HealthCheckConfig) -> Self {
        Self {
            healthy_threshold: config.healthy_threshold.max(1),
            unhealthy_threshold: config.unhealthy_threshold.max(1),
            grace_period: Duration::from_secs(config.grace_period_secs),
            started_at: Instant::now(),
            successes: 0,
            failures: 0,
            readiness: Readiness::Pending,
            total_probes: 0,
            failed_probes: 0,
        }
    }

    /// Record one probe result and return the resulting readiness.
    ///
    /// Failures inside the startup grace period reset the success streak but
    /// are not counted toward the unhealthy threshold or the failure rate.
    pub fn record(&mut self, healthy: bool) -> Readiness {
        let in_grace = self.started_at.elapsed() < self.grace_period;
        if healthy {
            self.successes += 1;
            self.failures = 0;
            self.total_probes += 1;
            if self.successes >= self.healthy_threshold {
                self.readiness = Readiness::Healthy;
            }
        } else {
            self.successes = 0;
            if in_grace {
                return self.readiness;
            }
            self.failures += 1;
            self.total_probes += 1;
            self.failed_probes += 1;
            if self.failures >= self.unhealthy_threshold {
                self.readiness = Readiness::Unhealthy;
            }
        }
        self.readiness
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness
    }

    pub fn is_healthy(&self) -> bool {
        self.readiness == Readiness::Healthy
    }

    /// Probes counted outside the grace period, and how many failed
    pub fn probe_counts(&self) -> (u32, u32) {
        (self.total_probes, self.failed_probes)
    }
}

/// One deadline-bounded probe; errors and timeouts count as failures
pub async fn probe_with_deadline(
    probe: &dyn HealthProbe,
    replica: &ReplicaInfo,
    health: &HealthCheckConfig,
) -> bool {
    let deadline = Duration::from_secs(health.timeout_secs.max(1));
    match tokio::time::timeout(deadline, probe.probe(replica, health)).await {
        Ok(Ok(healthy)) => healthy,
        Ok(Err(e)) => {
            tracing::debug!(replica = replica.id, error = %e, "Health probe error");
            false
        }
        Err(_) => false,
    }
}

/// HTTP readiness probe: GET `http://<address><path>` and compare the status
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Probe URL for a replica address and health path
    pub fn probe_url(address: &str, path: &str) -> String {
        let address = address.trim_end_matches('/');
        if address.starts_with("http://") || address.starts_with("https://") {
            format!("{}{}", address, path)
        } else {
            format!("http://{}{}", address, path)
        }
    }
}

impl Default for HttpHealthProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, replica: &ReplicaInfo, health_check: &HealthCheckConfig) -> Result<bool> {
        let url = Self::probe_url(&replica.address, &health_check.path);
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(health_check.timeout_secs))
            .send()
            .await;
        match response {
            Ok(resp) => Ok(resp.status().as_u16() == health_check.expected_status),
            Err(e) => {
                tracing::debug!(replica = replica.id, url = url, error = %e, "Health probe failed");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(healthy: u32, unhealthy: u32, grace: u64) -> HealthCheckConfig {
        HealthCheckConfig {
            healthy_threshold: healthy,
            unhealthy_threshold: unhealthy,
            grace_period_secs: grace,
            ..HealthCheckConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_after_threshold() {
        let mut tracker = HealthTracker::new(&config(3, 2, 0));
        assert_eq!(tracker.record(true), Readiness::Pending);
        assert_eq!(tracker.record(true), Readiness::Pending);
        assert_eq!(tracker.record(true), Readiness::Healthy);
        assert!(tracker.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_resets_streak() {
        let mut tracker = HealthTracker::new(&config(2, 3, 0));
        tracker.record(true);
        tracker.record(false);
        assert_eq!(tracker.record(true), Readiness::Pending);
        assert_eq!(tracker.record(true), Readiness::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_after_threshold() {
        let mut tracker = HealthTracker::new(&config(2, 2, 0));
        tracker.record(true);
        tracker.record(true);
        assert_eq!(tracker.record(false), Readiness::Healthy);
        assert_eq!(tracker.record(false), Readiness::Unhealthy);
        assert_eq!(tracker.probe_counts(), (4, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period_ignores_failures() {
        let mut tracker = HealthTracker::new(&config(2, 1, 60));
        assert_eq!(tracker.record(false), Readiness::Pending);
        assert_eq!(tracker.probe_counts(), (0, 0));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(tracker.record(false), Readiness::Unhealthy);
        assert_eq!(tracker.probe_counts(), (1, 1));
    }

    #[test]
    fn test_probe_url() {
        assert_eq!(
            HttpHealthProbe::probe_url("10.0.0.1:8000", "/health"),
            "http://10.0.0.1:8000/health"
        );
        assert_eq!(
            HttpHealthProbe::probe_url("https://svc.internal/", "/health"),
            "https://svc.internal/health"
        );
    }

    #[tokio::test]
    async fn test_http_probe_unreachable_is_unhealthy() {
        let probe = HttpHealthProbe::new();
        let replica = ReplicaInfo {
            id: "r".into(),
            address: "127.0.0.1:1".into(),
            generation: 1,
            status: crate::platform::ReplicaStatus::Running,
        };
        let hc = HealthCheckConfig {
            timeout_secs: 1,
            ..HealthCheckConfig::default()
        };
        assert!(!probe.probe(&replica, &hc).await.unwrap());
    }
}
