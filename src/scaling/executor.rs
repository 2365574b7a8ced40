//! Scale executor — trait and implementations for executing scaling decisions
//!
//! Provides the `ScaleExecutor` async trait with two implementations:
//! - `ComputeScaleExecutor` — sets the replica count of a service's current
//!   placement, then reconciles routing membership
//! - `MockScaleExecutor` — records decisions in memory (tests only)

use crate::compute::{ComputeProvisioner, PlacementRef};
use crate::error::{Result, TopologyError};
use crate::platform::ReplicaStatus;
use crate::service::MembershipReconciler;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Direction of a scaling operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleDirection {
    Up,
    Down,
}

impl std::fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// A scaling decision emitted by the autoscaler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleDecision {
    /// Service being scaled
    pub service: String,
    /// Direction of scaling
    pub direction: ScaleDirection,
    /// Current replica count
    pub current_replicas: u32,
    /// Desired replica count
    pub desired_replicas: u32,
    /// Human-readable reason for the decision
    pub reason: String,
}

/// Result of executing a scaling decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleResult {
    /// Whether the executor accepted the decision
    pub accepted: bool,
    /// Replica count requested from the platform
    pub actual_replicas: u32,
    /// Optional message from the executor
    pub message: String,
}

/// Async trait for executing scaling decisions against the platform
#[async_trait]
pub trait ScaleExecutor: Send + Sync {
    /// Execute a scaling decision
    async fn execute(&self, decision: &ScaleDecision) -> Result<ScaleResult>;

    /// Query the current replica count for a service
    async fn current_replicas(&self, service: &str) -> Result<u32>;

    /// Executor name (for logging)
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// ComputeScaleExecutor — scales the placement bound to each service
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Binding {
    provisioner: Arc<dyn ComputeProvisioner>,
    placement: PlacementRef,
}

/// Scale executor backed by the compute provisioners
#[derive(Default)]
pub struct ComputeScaleExecutor {
    bindings: RwLock<HashMap<String, Binding>>,
    membership: Option<Arc<MembershipReconciler>>,
}

impl ComputeScaleExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Executor that runs a membership pass after every scale
    pub fn with_membership(membership: Arc<MembershipReconciler>) -> Self {
        Self {
            bindings: RwLock::default(),
            membership: Some(membership),
        }
    }

    /// Point a service's scaling at a placement, replacing any previous one
    pub fn bind(&self, provisioner: Arc<dyn ComputeProvisioner>, placement: PlacementRef) {
        self.bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                placement.service.clone(),
                Binding {
                    provisioner,
                    placement,
                },
            );
    }

    pub fn unbind(&self, service: &str) -> bool {
        self.bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(service)
            .is_some()
    }

    /// Placement currently bound for a service
    pub fn placement(&self, service: &str) -> Option<PlacementRef> {
        self.binding(service).ok().map(|b| b.placement)
    }

    fn binding(&self, service: &str) -> Result<Binding> {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .cloned()
            .ok_or_else(|| {
                TopologyError::Other(format!("service '{}' has no placement bound for scaling", service))
            })
    }
}

#[async_trait]
impl ScaleExecutor for ComputeScaleExecutor {
    async fn execute(&self, decision: &ScaleDecision) -> Result<ScaleResult> {
        let binding = self.binding(&decision.service)?;
        binding
            .provisioner
            .scale(&binding.placement, decision.desired_replicas)
            .await?;
        if let Some(membership) = &self.membership {
            // New replicas join on later passes once ready; stopped ones leave now
            if let Err(e) = membership.reconcile(&decision.service).await {
                tracing::warn!(service = decision.service, error = %e, "Membership pass after scaling failed");
            }
        }
        Ok(ScaleResult {
            accepted: true,
            actual_replicas: decision.desired_replicas,
            message: format!(
                "placement '{}' set to {} replicas",
                binding.placement.id, decision.desired_replicas
            ),
        })
    }

    async fn current_replicas(&self, service: &str) -> Result<u32> {
        let binding = self.binding(service)?;
        let replicas = binding.provisioner.replicas(&binding.placement).await?;
        Ok(replicas
            .iter()
            .filter(|r| matches!(r.status, ReplicaStatus::Pending | ReplicaStatus::Running))
            .count() as u32)
    }

    fn name(&self) -> &str {
        "compute"
    }
}

// ---------------------------------------------------------------------------
// MockScaleExecutor — records decisions for testing
// ---------------------------------------------------------------------------

/// Mock scale executor that records decisions in memory
#[cfg(test)]
#[derive(Default)]
pub(crate) struct MockScaleExecutor {
    decisions: std::sync::Mutex<Vec<ScaleDecision>>,
    replicas: std::sync::Mutex<HashMap<String, u32>>,
}

#[cfg(test)]
impl MockScaleExecutor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Get all recorded decisions
    pub(crate) fn decisions(&self) -> Vec<ScaleDecision> {
        self.decisions.lock().unwrap().clone()
    }

    /// Set the simulated replica count for a service
    pub(crate) fn set_replicas(&self, service: &str, count: u32) {
        self.replicas
            .lock()
            .unwrap()
            .insert(service.to_string(), count);
    }
}

#[cfg(test)]
#[async_trait]
impl ScaleExecutor for MockScaleExecutor {
    async fn execute(&self, decision: &ScaleDecision) -> Result<ScaleResult> {
        self.decisions.lock().unwrap().push(decision.clone());
        self.replicas
            .lock()
            .unwrap()
            .insert(decision.service.clone(), decision.desired_replicas);

        Ok(ScaleResult {
            accepted: true,
            actual_replicas: decision.desired_replicas,
            message: format!(
                "Mock: scaled '{}' to {} replicas",
                decision.service, decision.desired_replicas
            ),
        })
    }

    async fn current_replicas(&self, service: &str) -> Result<u32> {
        Ok(*self.replicas.lock().unwrap().get(service).unwrap_or(&0))
    }

    fn name(&self) -> &str {
        "mock"
    }
}
