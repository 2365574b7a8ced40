//! Topology metrics — lightweight control-plane counters
//!
//! In-process counters for provisioning, routing, scaling, rollouts, and
//! delegation. Exported as a JSON snapshot or Prometheus text format.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

/// Metrics snapshot — a point-in-time view of all metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// External placement attempts, retries included
    pub provision_attempts: u64,
    /// Attempts that were retries of a transient failure
    pub provision_retries: u64,
    pub routes_registered: u64,
    pub route_conflicts: u64,
    /// Delegations resolved through the trust broker
    pub delegations_resolved: u64,
    /// Delegation lookups served from a still-valid credential
    pub delegation_cache_hits: u64,
    /// Per-service scale actions taken
    pub scale_decisions: BTreeMap<String, u64>,
    /// Rollout terminal states (healthy, rolled_back, failed)
    pub rollout_outcomes: BTreeMap<String, u64>,
}

/// Control-plane metrics collector
pub struct TopologyMetrics {
    provision_attempts: AtomicU64,
    provision_retries: AtomicU64,
    routes_registered: AtomicU64,
    route_conflicts: AtomicU64,
    delegations_resolved: AtomicU64,
    delegation_cache_hits: AtomicU64,
    scale_decisions: RwLock<BTreeMap<String, u64>>,
    rollout_outcomes: RwLock<BTreeMap<String, u64>>,
}

impl TopologyMetrics {
    pub fn new() -> Self {
        Self {
            provision_attempts: AtomicU64::new(0),
            provision_retries: AtomicU64::new(0),
            routes_registered: AtomicU64::new(0),
            route_conflicts: AtomicU64::new(0),
            delegations_resolved: AtomicU64::new(0),
            delegation_cache_hits: AtomicU64::new(0),
            scale_decisions: RwLock::new(BTreeMap::new()),
            rollout_outcomes: RwLock::new(BTreeMap::new()),
        }
    }

    /// Record an external call attempt; `retry` marks attempts after the first
    pub fn record_provision_attempt(&self, retry: bool) {
        self.provision_attempts.fetch_add(1, Ordering::Relaxed);
        if retry {
            self.provision_retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_route_registered(&self) {
        self.routes_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_route_conflict(&self) {
        self.route_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delegation_resolved(&self) {
        self.delegations_resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delegation_cache_hit(&self) {
        self.delegation_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scale_decision(&self, service: &str) {
        let mut map = self
            .scale_decisions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *map.entry(service.to_string()).or_insert(0) += 1;
    }

    pub fn record_rollout_outcome(&self, outcome: &str) {
        let mut map = self
            .rollout_outcomes
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *map.entry(outcome.to_string()).or_insert(0) += 1;
    }

    /// Take a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            provision_attempts: self.provision_attempts.load(Ordering::Relaxed),
            provision_retries: self.provision_retries.load(Ordering::Relaxed),
            routes_registered: self.routes_registered.load(Ordering::Relaxed),
            route_conflicts: self.route_conflicts.load(Ordering::Relaxed),
            delegations_resolved: self.delegations_resolved.load(Ordering::Relaxed),
            delegation_cache_hits: self.delegation_cache_hits.load(Ordering::Relaxed),
            scale_decisions: self
                .scale_decisions
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            rollout_outcomes: self
                .rollout_outcomes
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    /// Render metrics in Prometheus text exposition format
    pub fn render_prometheus(&self) -> String {
        let snap = self.snapshot();
        let mut output = String::new();

        let counters = [
            (
                "topology_provision_attempts_total",
                "External placement attempts",
                snap.provision_attempts,
            ),
            (
                "topology_provision_retries_total",
                "Placement retries after transient failures",
                snap.provision_retries,
            ),
            (
                "topology_routes_registered_total",
                "Routing rules registered",
                snap.routes_registered,
            ),
            (
                "topology_route_conflicts_total",
                "Rejected routing registrations",
                snap.route_conflicts,
            ),
            (
                "topology_delegations_resolved_total",
                "Delegated credentials obtained from the trust broker",
                snap.delegations_resolved,
            ),
            (
                "topology_delegation_cache_hits_total",
                "Delegated credentials served from cache",
                snap.delegation_cache_hits,
            ),
        ];
        for (name, help, value) in counters {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!("{} {}\n", name, value));
        }

        if !snap.scale_decisions.is_empty() {
            output.push_str("# HELP topology_scale_decisions_total Scale actions per service\n");
            output.push_str("# TYPE topology_scale_decisions_total counter\n");
            for (service, count) in &snap.scale_decisions {
                output.push_str(&format!(
                    "topology_scale_decisions_total{{service=\"{}\"}} {}\n",
                    service, count
                ));
            }
        }

        if !snap.rollout_outcomes.is_empty() {
            output.push_str("# HELP topology_rollouts_total Rollouts by terminal state\n");
            output.push_str("# TYPE topology_rollouts_total counter\n");
            for (outcome, count) in &snap.rollout_outcomes {
                output.push_str(&format!(
                    "topology_rollouts_total{{outcome=\"{}\"}} {}\n",
                    outcome, count
                ));
            }
        }

        output
    }
}

impl Default for TopologyMetrics {
    fn default() -> Self {
        Self::new()
    }
}
