//! Configuration types for A3S Topology
//!
//! Declarative model of an environment, its shared listener, and the
//! services placed behind it. Uses HCL (HashiCorp Configuration Language)
//! as the configuration format.

pub mod environment;
pub mod router;
pub mod scaling;
pub mod security;
pub mod service;
pub mod substrate;

pub use environment::{Architecture, EnvironmentProfile, RateLimitDefaults};
pub use router::{ListenerConfig, RoutingRule};
pub use scaling::{AutoscalingSettings, RolloutConfig, ScalingPolicy, ScalingPolicyKind};
pub use security::{CrossAccountDelegation, PermissionGrant};
pub use service::{
    ContainerSpec, HealthCheckConfig, HostMount, ReplicaCounts, ServiceSpec, ServiceSpecBuilder,
};
pub use substrate::{CapacityStrategy, ComputeSubstrate, SubstrateKind};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TopologyError};

/// Top-level topology configuration
///
/// # HCL Example
///
/// ```hcl
/// environment {
///   region = "us-east-1"
/// }
///
/// listener {
///   port = 80
/// }
///
/// services "proxy" {
///   containers = [{ name = "proxy", image = "registry/proxy:1.0", port = 8000 }]
///   replicas { desired = 2 }
///   substrate = { kind = "serverless" }
///   routes = [{ patterns = ["/v1/*"], priority = 10 }]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Environment profile every service is planned against
    pub environment: EnvironmentProfile,

    /// Shared listener
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Backoff and deadline policy for external calls
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Rollout tuning applied when a service block omits `rollout`
    #[serde(default)]
    pub rollout_defaults: Option<RolloutConfig>,

    /// Autoscaling controller settings
    #[serde(default)]
    pub autoscaling: AutoscalingSettings,

    /// Services keyed by name
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSpec>,
}

/// Exponential backoff policy for transient control-plane failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts per external call, including the first (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay in milliseconds (default: 200)
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Backoff ceiling in milliseconds (default: 10000)
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Deadline for a single external call in seconds (default: 30)
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Bounded wait for placed replicas to start in seconds (default: 300)
    #[serde(default = "default_placement_wait")]
    pub placement_wait_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            call_timeout_secs: default_call_timeout(),
            placement_wait_secs: default_placement_wait(),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the given retry (1-based), capped at `max_backoff_ms`
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        let ms = self.initial_backoff_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn placement_wait(&self) -> Duration {
        Duration::from_secs(self.placement_wait_secs)
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> u64 {
    200
}

fn default_max_backoff() -> u64 {
    10_000
}

fn default_call_timeout() -> u64 {
    30
}

fn default_placement_wait() -> u64 {
    300
}

impl TopologyConfig {
    /// Defaults for every block and no services
    pub fn for_environment(environment: EnvironmentProfile) -> Self {
        Self {
            environment,
            listener: ListenerConfig::default(),
            retry: RetryPolicy::default(),
            rollout_defaults: None,
            autoscaling: AutoscalingSettings::default(),
            services: BTreeMap::new(),
        }
    }

    /// Load configuration from an HCL file.
    ///
    /// The file must contain valid HCL content regardless of extension.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            TopologyError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_hcl(&content)
    }

    /// Parse configuration from an HCL string
    pub fn from_hcl(content: &str) -> Result<Self> {
        let mut config: Self = hcl::from_str(content)
            .map_err(|e| TopologyError::Config(format!("Failed to parse HCL config: {}", e)))?;

        let defaults = config.rollout_defaults.clone();
        for (label, spec) in config.services.iter_mut() {
            if spec.name.is_empty() {
                spec.name = label.clone();
            }
            if let Some(defaults) = &defaults {
                if spec.rollout == RolloutConfig::default() {
                    spec.rollout = defaults.clone();
                }
            }
        }
        Ok(config)
    }

    /// Validate every service and the cross-service constraints.
    ///
    /// Runs entirely locally; nothing reaches the control plane.
    pub fn validate(&self) -> Result<()> {
        if self.environment.region.trim().is_empty() {
            return Err(TopologyError::Config(
                "environment.region must not be empty".to_string(),
            ));
        }
        if self.listener.affinity_cookie.trim().is_empty() {
            return Err(TopologyError::Config(
                "listener.affinity_cookie must not be empty".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 || self.retry.call_timeout_secs == 0 {
            return Err(TopologyError::Config(
                "retry.max_attempts and retry.call_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.autoscaling.evaluation_period_secs == 0 {
            return Err(TopologyError::Config(
                "autoscaling.evaluation_period_secs must be at least 1".to_string(),
            ));
        }

        for (label, spec) in &self.services {
            if spec.name != *label {
                return Err(TopologyError::Config(format!(
                    "Service block '{}' declares a different name '{}'",
                    label, spec.name
                )));
            }
            crate::planner::TopologyPlanner::validate(spec, &self.environment)?;
        }

        // Priorities are unique per listener, not per service
        let mut owners: HashMap<u32, &str> = HashMap::new();
        for spec in self.services.values() {
            for rule in &spec.routes {
                if let Some(owner) = owners.insert(rule.priority, &spec.name) {
                    return Err(TopologyError::RoutingConflict(format!(
                        "priority {} is declared by both '{}' and '{}'",
                        rule.priority, owner, spec.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Service specs in name order
    pub fn service_specs(&self) -> impl Iterator<Item = &ServiceSpec> {
        self.services.values()
    }
}
