//! Platform seams — async traits over the external, eventually consistent control plane
//!
//! Every provider call the topology makes goes through one of these traits.
//! [`simulated::SimulatedPlatform`] implements all of them in memory.

pub mod simulated;

use crate::config::{
    Architecture, CrossAccountDelegation, HealthCheckConfig, PermissionGrant, ScalingPolicyKind,
    SubstrateKind,
};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A container entry in a task definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerDefinition {
    pub name: String,
    pub image: String,
    pub port: u16,
    pub cpu: u32,
    pub memory_mib: u32,
    /// Resolved environment, contract variables included
    pub environment: BTreeMap<String, String>,
    /// Environment variable name → external secret id
    pub secrets: BTreeMap<String, String>,
    /// Volume name → container path
    pub mount_points: Vec<MountPoint>,
}

/// A volume mounted into a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPoint {
    pub volume: String,
    pub container_path: String,
    pub read_only: bool,
}

/// A named volume backed by a host path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub host_path: String,
}

/// Task definition registered with the managed scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Family name, stable per service
    pub family: String,
    pub substrate: SubstrateKind,
    pub architecture: Architecture,
    /// Task-level CPU units
    pub cpu: u32,
    /// Task-level memory in MiB
    pub memory_mib: u32,
    pub execution_role: String,
    pub task_role: String,
    pub containers: Vec<ContainerDefinition>,
    pub volumes: Vec<Volume>,
    pub health_check: HealthCheckConfig,
}

impl TaskDefinition {
    /// Host paths the definition binds
    pub fn host_paths(&self) -> impl Iterator<Item = &str> {
        self.volumes.iter().map(|v| v.host_path.as_str())
    }

    /// Images referenced by the definition
    pub fn images(&self) -> impl Iterator<Item = &str> {
        self.containers.iter().map(|c| c.image.as_str())
    }
}

/// Capacity pool request derived from a capacity strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityPoolRequest {
    /// Pool name, the idempotency key
    pub name: String,
    pub instance_class: String,
    pub architecture: Architecture,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub desired_nodes: u32,
    pub root_volume_gib: u32,
    /// Interruptible capacity terms, when spot eligible
    pub spot: Option<SpotTerms>,
}

/// Terms for interruptible capacity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotTerms {
    /// Hourly price ceiling; `None` means the on-demand price
    pub price_ceiling: Option<f64>,
}

/// Where replicas are placed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum LaunchTarget {
    /// Managed scheduler, no intermediate capacity
    Serverless,
    /// A capacity pool behind a capacity provider
    CapacityPool { pool: String, interruptible: bool },
}

/// Request to place replicas of a registered task definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementRequest {
    pub service: String,
    pub generation: u64,
    /// Registered task definition reference (`family:revision`)
    pub task_definition: String,
    pub replicas: u32,
    pub launch: LaunchTarget,
}

/// Lifecycle status of one replica as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaStatus {
    /// Waiting for capacity
    Pending,
    Running,
    Stopped,
    /// Reclaimed interruptible capacity; the platform reschedules a replacement
    Interrupted,
}

/// One replica as reported by the platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub id: String,
    /// `host:port` the replica listens on
    pub address: String,
    pub generation: u64,
    pub status: ReplicaStatus,
}

impl ReplicaInfo {
    pub fn is_running(&self) -> bool {
        self.status == ReplicaStatus::Running
    }
}

/// Scope of a minted identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityScope {
    /// Used by the platform agent to pull images and write logs
    ExecutionIdentity,
    /// Assumed by the workload itself
    WorkloadIdentity,
}

impl IdentityScope {
    /// Short tag used in identity names
    pub fn tag(&self) -> &'static str {
        match self {
            Self::ExecutionIdentity => "exec",
            Self::WorkloadIdentity => "task",
        }
    }
}

impl std::fmt::Display for IdentityScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExecutionIdentity => write!(f, "execution"),
            Self::WorkloadIdentity => write!(f, "workload"),
        }
    }
}

/// A role document: name, trust principals, and grants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub scope: IdentityScope,
    pub trust_principals: BTreeSet<String>,
    pub grants: BTreeSet<PermissionGrant>,
}

/// Short-lived credential material issued by a trust broker
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiration: DateTime<Utc>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("expiration", &self.expiration)
            .finish()
    }
}

/// Managed scheduler and capacity operations
#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// Register a task definition, returning `family:revision`
    async fn register_task_definition(&self, definition: &TaskDefinition) -> Result<String>;

    /// Create the capacity pool if absent; idempotent on the request name
    async fn ensure_capacity_pool(&self, request: &CapacityPoolRequest) -> Result<String>;

    /// Attach a capacity provider with managed scaling at the target utilization
    async fn attach_capacity_provider(&self, pool: &str, target_capacity_percent: u32) -> Result<()>;

    /// Host paths the pool's nodes expose
    async fn host_capabilities(&self, pool: &str) -> Result<BTreeSet<String>>;

    /// Place replicas, returning a placement reference
    async fn place(&self, request: &PlacementRequest) -> Result<String>;

    async fn set_replica_count(&self, placement: &str, count: u32) -> Result<()>;

    async fn describe_replicas(&self, placement: &str) -> Result<Vec<ReplicaInfo>>;

    /// Stop a single replica (the placement's desired count drops by one)
    async fn stop_replica(&self, placement: &str, replica: &str) -> Result<()>;

    /// Remove a placement; `false` when it was already gone
    async fn delete_placement(&self, placement: &str) -> Result<bool>;

    /// Remove a capacity pool; `false` when it was already gone
    async fn delete_capacity_pool(&self, pool: &str) -> Result<bool>;
}

/// Role storage
#[async_trait]
pub trait IdentityApi: Send + Sync {
    /// Create or replace a role by name
    async fn put_role(&self, role: &Role) -> Result<()>;

    /// Delete a role; `false` when it was already gone
    async fn delete_role(&self, name: &str) -> Result<bool>;
}

/// Cross-boundary credential issuer
#[async_trait]
pub trait TrustBroker: Send + Sync {
    async fn assume_role(
        &self,
        delegation: &CrossAccountDelegation,
        session_name: &str,
    ) -> Result<Credentials>;
}

/// Observed scaling metrics
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Latest observation for a service, `None` when no datapoint exists yet
    async fn sample(&self, service: &str, kind: ScalingPolicyKind) -> Result<Option<f64>>;
}

/// Readiness probe against a single replica
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, replica: &ReplicaInfo, health_check: &HealthCheckConfig) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_redacts_secrets() {
        let creds = Credentials {
            access_key_id: "ASIAEXAMPLE".into(),
            secret_access_key: "very-secret".into(),
            session_token: "token".into(),
            expiration: Utc::now(),
        };
        let debug = format!("{:?}", creds);
        assert!(debug.contains("ASIAEXAMPLE"));
        assert!(!debug.contains("very-secret"));
        assert!(!debug.contains("\"token\""));
    }

    #[test]
    fn test_scope_tags() {
        assert_eq!(IdentityScope::ExecutionIdentity.tag(), "exec");
        assert_eq!(IdentityScope::WorkloadIdentity.tag(), "task");
        assert_eq!(IdentityScope::WorkloadIdentity.to_string(), "workload");
    }

    #[test]
    fn test_launch_target_serde() {
        let json = serde_json::to_string(&LaunchTarget::CapacityPool {
            pool: "sandbox-pool".into(),
            interruptible: true,
        })
        .unwrap();
        assert!(json.contains("\"kind\":\"capacity-pool\""));
        let back: LaunchTarget = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, LaunchTarget::CapacityPool { interruptible: true, .. }));
    }
}
