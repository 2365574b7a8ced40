//! Service configuration — the declarative service spec submitted by operators

use super::router::{RoutingRule, MAX_PRIORITY, MAX_STICKINESS_SECS, MIN_PRIORITY};
use super::scaling::{check_scaling, RolloutConfig, ScalingPolicy};
use super::security::{CrossAccountDelegation, PermissionGrant};
use super::substrate::ComputeSubstrate;
use crate::error::{Result, TopologyError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// A host path bound into a container (node pool only)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostMount {
    /// Named volume for the mount
    pub name: String,
    /// Absolute path on the host (e.g., "/var/run/docker.sock")
    pub host_path: String,
    /// Absolute path inside the container
    pub container_path: String,
    /// Bind read-only (default: false, mounts are read-write)
    #[serde(default)]
    pub read_only: bool,
}

/// A single container in a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Container name, unique within the service
    pub name: String,

    /// Image reference
    pub image: String,

    /// TCP listening port
    pub port: u16,

    /// CPU units requested (1024 = one vCPU, default: 512)
    #[serde(default = "default_cpu")]
    pub cpu: u32,

    /// Memory requested in MiB (default: 1024)
    #[serde(default = "default_memory")]
    pub memory_mib: u32,

    /// Host mounts (device sockets)
    #[serde(default)]
    pub host_mounts: Vec<HostMount>,

    /// Secret references: environment variable name → external secret id
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
}

impl ContainerSpec {
    /// Container with default resources and no mounts or secrets
    pub fn new(name: impl Into<String>, image: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            port,
            cpu: default_cpu(),
            memory_mib: default_memory(),
            host_mounts: Vec::new(),
            secrets: BTreeMap::new(),
        }
    }
}

/// Desired/min/max replica counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaCounts {
    /// Replicas the service should run after a rollout
    pub desired: u32,
    /// Lower autoscaling bound (default: 1)
    #[serde(default = "default_min_replicas")]
    pub min: u32,
    /// Upper autoscaling bound (default: 10)
    #[serde(default = "default_max_replicas")]
    pub max: u32,
}

impl ReplicaCounts {
    /// Replica counts with explicit bounds
    pub fn new(desired: u32, min: u32, max: u32) -> Self {
        Self { desired, min, max }
    }
}

/// Health check configuration — the container's readiness contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// HTTP path to probe (default: "/health")
    #[serde(default = "default_health_path")]
    pub path: String,

    /// Status code that means ready (default: 200)
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,

    /// Seconds between probes (default: 30)
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Seconds before a probe counts as failed (default: 5)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Consecutive successes before a replica is routable (default: 2)
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,

    /// Consecutive failures before a replica is marked unhealthy (default: 3)
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    /// Seconds after start during which failures are not counted (default: 60)
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            expected_status: default_expected_status(),
            interval_secs: default_interval(),
            timeout_secs: default_timeout(),
            healthy_threshold: default_healthy_threshold(),
            unhealthy_threshold: default_unhealthy_threshold(),
            grace_period_secs: default_grace_period(),
        }
    }
}

/// Service specification — immutable once submitted to a rollout
///
/// # HCL Example
///
/// ```hcl
/// services "proxy" {
///   containers = [
///     { name = "proxy", image = "registry/proxy:1.4.0", port = 8000, cpu = 1024, memory_mib = 2048 }
///   ]
///   replicas { desired = 2, min = 1, max = 10 }
///   substrate = { kind = "serverless" }
///   routes = [{ patterns = ["/v1/*"], priority = 10 }]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Service name (filled from the HCL block label when omitted)
    #[serde(default)]
    pub name: String,

    /// Containers in the service
    pub containers: Vec<ContainerSpec>,

    /// Replica counts
    pub replicas: ReplicaCounts,

    /// Target compute substrate
    pub substrate: ComputeSubstrate,

    /// Health check descriptor
    #[serde(default)]
    pub health_check: HealthCheckConfig,

    /// Extra environment variables passed to every container
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Routing rules on the shared listener
    #[serde(default)]
    pub routes: Vec<RoutingRule>,

    /// Autoscaling policies
    #[serde(default)]
    pub scaling: Vec<ScalingPolicy>,

    /// Resource grants for the workload identity
    #[serde(default)]
    pub grants: Vec<PermissionGrant>,

    /// Optional cross-account delegation
    #[serde(default)]
    pub delegation: Option<CrossAccountDelegation>,

    /// Backend session idle timeout in seconds; bounds route stickiness
    #[serde(default)]
    pub session_idle_timeout_secs: Option<u64>,

    /// Rollout tuning
    #[serde(default)]
    pub rollout: RolloutConfig,
}

impl ServiceSpec {
    /// Start assembling a spec
    pub fn builder(name: impl Into<String>) -> ServiceSpecBuilder {
        ServiceSpecBuilder::new(name)
    }

    /// Resolve the container port a rule targets
    pub fn rule_port(&self, rule: &RoutingRule) -> Option<u16> {
        match rule.target_port {
            Some(port) => Some(port),
            None if self.containers.len() == 1 => Some(self.containers[0].port),
            None => None,
        }
    }

    /// Target group name a rule binds to
    pub fn target_name(&self, rule: &RoutingRule) -> Option<String> {
        if let Some(name) = &rule.target_group {
            return Some(name.clone());
        }
        self.rule_port(rule)
            .map(|port| format!("{}-{}", self.name, port))
    }

    /// Whether any container requests a host mount
    pub fn has_host_mounts(&self) -> bool {
        self.containers.iter().any(|c| !c.host_mounts.is_empty())
    }

    /// Total CPU units across containers
    pub fn total_cpu(&self) -> u32 {
        self.containers.iter().map(|c| c.cpu).sum()
    }

    /// Total memory across containers in MiB
    pub fn total_memory_mib(&self) -> u32 {
        self.containers.iter().map(|c| c.memory_mib).sum()
    }

    /// Substrate-independent structural validation.
    ///
    /// Fully local: never touches the control plane.
    pub fn check(&self) -> Result<()> {
        let fail = |msg: String| Err(TopologyError::validation(&self.name, msg));

        if !is_valid_name(&self.name) {
            return fail(format!(
                "service name '{}' must be 1-32 lowercase alphanumerics or '-'",
                self.name
            ));
        }
        if self.containers.is_empty() {
            return fail("at least one container is required".to_string());
        }

        let mut names = HashSet::new();
        let mut ports = HashSet::new();
        for container in &self.containers {
            if container.image.trim().is_empty() {
                return fail(format!("container '{}' has no image", container.name));
            }
            if !names.insert(container.name.as_str()) {
                return fail(format!("duplicate container name '{}'", container.name));
            }
            if container.port == 0 {
                return fail(format!("container '{}' has no listening port", container.name));
            }
            if !ports.insert(container.port) {
                return fail(format!("port {} is used by two containers", container.port));
            }
            if container.cpu == 0 || container.memory_mib == 0 {
                return fail(format!(
                    "container '{}' must request cpu and memory",
                    container.name
                ));
            }
            for mount in &container.host_mounts {
                if mount.name.trim().is_empty() {
                    return fail(format!(
                        "container '{}' has a host mount without a volume name",
                        container.name
                    ));
                }
                if !mount.host_path.starts_with('/') || !mount.container_path.starts_with('/') {
                    return fail(format!(
                        "host mount '{}' must use absolute host and container paths",
                        mount.name
                    ));
                }
            }
        }

        let r = self.replicas;
        if !(r.min <= r.desired && r.desired <= r.max) {
            return fail(format!(
                "replica counts must satisfy min ({}) <= desired ({}) <= max ({})",
                r.min, r.desired, r.max
            ));
        }
        if r.max == 0 {
            return fail("max replicas must be at least 1".to_string());
        }

        if let ComputeSubstrate::NodePool(strategy) = &self.substrate {
            strategy.check().or_else(fail)?;
        }

        self.check_health_check()?;
        self.check_routes()?;
        check_scaling(&self.scaling, &self.rollout).or_else(fail)?;

        if let Some(delegation) = &self.delegation {
            delegation.check().or_else(fail)?;
        }
        for grant in &self.grants {
            if grant.action.trim().is_empty() || grant.resource.trim().is_empty() {
                return fail("permission grants need an action and a resource".to_string());
            }
        }

        Ok(())
    }

    fn check_health_check(&self) -> Result<()> {
        let hc = &self.health_check;
        let fail = |msg: String| Err(TopologyError::validation(&self.name, msg));
        if !hc.path.starts_with('/') {
            return fail(format!("health check path '{}' must start with '/'", hc.path));
        }
        if hc.timeout_secs == 0 || hc.timeout_secs >= hc.interval_secs {
            return fail(format!(
                "health check timeout ({}s) must be positive and shorter than the interval ({}s)",
                hc.timeout_secs, hc.interval_secs
            ));
        }
        if hc.healthy_threshold == 0 || hc.unhealthy_threshold == 0 {
            return fail("health check thresholds must be at least 1".to_string());
        }
        if !(100..600).contains(&hc.expected_status) {
            return fail(format!(
                "health check expected_status ({}) is not an HTTP status",
                hc.expected_status
            ));
        }
        Ok(())
    }

    fn check_routes(&self) -> Result<()> {
        let fail = |msg: String| Err(TopologyError::validation(&self.name, msg));
        let mut priorities = HashSet::new();
        let mut port_targets: BTreeMap<u16, String> = BTreeMap::new();

        for rule in &self.routes {
            if rule.patterns.is_empty() {
                return fail(format!("route at priority {} has no patterns", rule.priority));
            }
            for pattern in &rule.patterns {
                crate::router::PathPattern::parse(pattern)
                    .map_err(|e| TopologyError::validation(&self.name, e))?;
            }
            if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&rule.priority) {
                return fail(format!(
                    "route priority {} must be in {}..={}",
                    rule.priority, MIN_PRIORITY, MAX_PRIORITY
                ));
            }
            if !priorities.insert(rule.priority) {
                return fail(format!("route priority {} is used twice", rule.priority));
            }

            let port = match self.rule_port(rule) {
                Some(port) => port,
                None => {
                    return fail(format!(
                        "route at priority {} must set target_port when the service has several containers",
                        rule.priority
                    ))
                }
            };
            if !self.containers.iter().any(|c| c.port == port) {
                return fail(format!(
                    "route at priority {} targets port {} which no container listens on",
                    rule.priority, port
                ));
            }

            let target = self.target_name(rule).unwrap_or_default();
            match port_targets.get(&port) {
                Some(existing) if *existing != target => {
                    return fail(format!(
                        "port {} maps to two targets ('{}' and '{}')",
                        port, existing, target
                    ));
                }
                _ => {
                    port_targets.insert(port, target);
                }
            }

            if let Some(stickiness) = rule.stickiness_secs {
                if stickiness == 0 || stickiness > MAX_STICKINESS_SECS {
                    return fail(format!(
                        "stickiness ({}s) must be in 1..={}",
                        stickiness, MAX_STICKINESS_SECS
                    ));
                }
                if let Some(idle) = self.session_idle_timeout_secs {
                    if stickiness > idle {
                        return fail(format!(
                            "stickiness ({}s) exceeds the backend session idle timeout ({}s)",
                            stickiness, idle
                        ));
                    }
                }
            }
        }

        if !self.routes.is_empty() {
            for container in &self.containers {
                if !port_targets.contains_key(&container.port) {
                    return fail(format!(
                        "container '{}' port {} has no routing rule",
                        container.name, container.port
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Pure data builder for a [`ServiceSpec`]
pub struct ServiceSpecBuilder {
    spec: ServiceSpec,
}

impl ServiceSpecBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            spec: ServiceSpec {
                name: name.into(),
                containers: Vec::new(),
                replicas: ReplicaCounts::new(1, default_min_replicas(), default_max_replicas()),
                substrate: ComputeSubstrate::Serverless,
                health_check: HealthCheckConfig::default(),
                environment: BTreeMap::new(),
                routes: Vec::new(),
                scaling: Vec::new(),
                grants: Vec::new(),
                delegation: None,
                session_idle_timeout_secs: None,
                rollout: RolloutConfig::default(),
            },
        }
    }

    pub fn container(mut self, container: ContainerSpec) -> Self {
        self.spec.containers.push(container);
        self
    }

    pub fn replicas(mut self, desired: u32, min: u32, max: u32) -> Self {
        self.spec.replicas = ReplicaCounts::new(desired, min, max);
        self
    }

    pub fn substrate(mut self, substrate: ComputeSubstrate) -> Self {
        self.spec.substrate = substrate;
        self
    }

    pub fn health_check(mut self, health_check: HealthCheckConfig) -> Self {
        self.spec.health_check = health_check;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.environment.insert(key.into(), value.into());
        self
    }

    pub fn route(mut self, rule: RoutingRule) -> Self {
        self.spec.routes.push(rule);
        self
    }

    pub fn policy(mut self, policy: ScalingPolicy) -> Self {
        self.spec.scaling.push(policy);
        self
    }

    pub fn grant(mut self, grant: PermissionGrant) -> Self {
        self.spec.grants.push(grant);
        self
    }

    pub fn delegation(mut self, delegation: CrossAccountDelegation) -> Self {
        self.spec.delegation = Some(delegation);
        self
    }

    pub fn session_idle_timeout(mut self, secs: u64) -> Self {
        self.spec.session_idle_timeout_secs = Some(secs);
        self
    }

    pub fn rollout(mut self, rollout: RolloutConfig) -> Self {
        self.spec.rollout = rollout;
        self
    }

    /// Finish and run structural validation
    pub fn build(self) -> Result<ServiceSpec> {
        self.spec.check()?;
        Ok(self.spec)
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 32
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn default_cpu() -> u32 {
    512
}

fn default_memory() -> u32 {
    1024
}

fn default_min_replicas() -> u32 {
    1
}

fn default_max_replicas() -> u32 {
    10
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_expected_status() -> u16 {
    200
}

fn default_interval() -> u64 {
    30
}

fn default_timeout() -> u64 {
    5
}

fn default_healthy_threshold() -> u32 {
    2
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_grace_period() -> u64 {
    60
}
