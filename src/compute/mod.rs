//! Compute provisioning — one interface, two substrates
//!
//! `ServerlessProvisioner` places tasks straight on the managed scheduler.
//! `NodePoolProvisioner` first ensures a capacity pool and capacity provider,
//! checks host capabilities, and only then places. Both go through
//! [`SchedulerClient`], which applies deadlines and retries to every call.

pub mod env;
pub mod node_pool;
pub mod retry;
pub mod serverless;

pub use node_pool::NodePoolProvisioner;
pub use serverless::ServerlessProvisioner;

use crate::config::{RetryPolicy, SubstrateKind};
use crate::error::Result;
use crate::observability::TopologyMetrics;
use crate::planner::ServicePlan;
use crate::platform::{ComputeApi, LaunchTarget, PlacementRequest, ReplicaInfo, TaskDefinition};
use crate::security::SecurityContext;
use async_trait::async_trait;
use retry::{with_deadline, with_retry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A generation's placement on the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRef {
    pub id: String,
    pub service: String,
    pub generation: u64,
    /// Capacity pool backing the placement, node-pool substrate only
    pub pool: Option<String>,
}

/// Result of provisioning one generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedCompute {
    pub placement: PlacementRef,
    /// Registered task definition (`family:revision`)
    pub task_definition: String,
    /// Replicas running when provisioning returned
    pub current_replicas: u32,
}

/// Substrate-specific provisioning behind one interface
#[async_trait]
pub trait ComputeProvisioner: Send + Sync {
    fn substrate(&self) -> SubstrateKind;

    /// Place `replicas` of a generation under the bound identities
    async fn provision(
        &self,
        plan: &ServicePlan,
        generation: u64,
        replicas: u32,
        security: &SecurityContext,
    ) -> Result<ProvisionedCompute>;

    /// Remove a placement; `false` when it was already gone
    async fn drain(&self, placement: &PlacementRef) -> Result<bool>;

    async fn replicas(&self, placement: &PlacementRef) -> Result<Vec<ReplicaInfo>>;

    async fn scale(&self, placement: &PlacementRef, count: u32) -> Result<()>;

    async fn stop_replica(&self, placement: &PlacementRef, replica: &str) -> Result<()>;

    /// Release substrate capacity owned by the service; `false` when none
    async fn release_capacity(&self, service: &str) -> Result<bool>;
}

/// Deadline- and retry-wrapped access to the compute API
#[derive(Clone)]
pub struct SchedulerClient {
    api: Arc<dyn ComputeApi>,
    retry: RetryPolicy,
    metrics: Arc<TopologyMetrics>,
}

impl SchedulerClient {
    pub fn new(api: Arc<dyn ComputeApi>, retry: RetryPolicy, metrics: Arc<TopologyMetrics>) -> Self {
        Self { api, retry, metrics }
    }

    pub fn api(&self) -> &Arc<dyn ComputeApi> {
        &self.api
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn metrics(&self) -> &TopologyMetrics {
        &self.metrics
    }

    /// Register a task definition stamped with the bound identities
    pub async fn register(
        &self,
        definition: &TaskDefinition,
        security: &SecurityContext,
    ) -> Result<String> {
        let mut definition = definition.clone();
        definition.execution_role = security.execution_identity.clone();
        definition.task_role = security.workload_identity.clone();
        let definition = &definition;
        with_retry(&self.retry, "register_task_definition", &self.metrics, || {
            self.api.register_task_definition(definition)
        })
        .await
    }

    pub async fn place(
        &self,
        plan: &ServicePlan,
        generation: u64,
        replicas: u32,
        task_definition: &str,
        launch: LaunchTarget,
    ) -> Result<String> {
        let request = PlacementRequest {
            service: plan.service.clone(),
            generation,
            task_definition: task_definition.to_string(),
            replicas,
            launch,
        };
        let request = &request;
        let placement = with_retry(&self.retry, "place", &self.metrics, || {
            self.api.place(request)
        })
        .await?;
        tracing::info!(
            service = plan.service,
            generation = generation,
            placement = placement,
            replicas = replicas,
            "Replicas placed"
        );
        Ok(placement)
    }

    pub async fn describe(&self, placement: &PlacementRef) -> Result<Vec<ReplicaInfo>> {
        with_deadline(
            &self.retry,
            "describe_replicas",
            self.api.describe_replicas(&placement.id),
        )
        .await
    }

    pub async fn set_count(&self, placement: &PlacementRef, count: u32) -> Result<()> {
        with_retry(&self.retry, "set_replica_count", &self.metrics, || {
            self.api.set_replica_count(&placement.id, count)
        })
        .await
    }

    pub async fn stop(&self, placement: &PlacementRef, replica: &str) -> Result<()> {
        with_retry(&self.retry, "stop_replica", &self.metrics, || {
            self.api.stop_replica(&placement.id, replica)
        })
        .await
    }

    /// Delete a placement, tolerating one that is already gone
    pub async fn remove(&self, placement: &PlacementRef) -> Result<bool> {
        let removed = with_retry(&self.retry, "delete_placement", &self.metrics, || {
            self.api.delete_placement(&placement.id)
        })
        .await?;
        if removed {
            tracing::info!(
                service = placement.service,
                generation = placement.generation,
                placement = placement.id,
                "Placement drained"
            );
        } else {
            tracing::debug!(placement = placement.id, "Placement already removed");
        }
        Ok(removed)
    }
}

/// One provisioner per substrate, selected by a plan's substrate kind
#[derive(Clone)]
pub struct ProvisionerSet {
    serverless: Arc<dyn ComputeProvisioner>,
    node_pool: Arc<dyn ComputeProvisioner>,
}

impl ProvisionerSet {
    pub fn new(serverless: Arc<dyn ComputeProvisioner>, node_pool: Arc<dyn ComputeProvisioner>) -> Self {
        Self {
            serverless,
            node_pool,
        }
    }

    /// Both substrates over one scheduler client
    pub fn from_client(client: SchedulerClient) -> Self {
        Self::new(
            Arc::new(ServerlessProvisioner::new(client.clone())),
            Arc::new(NodePoolProvisioner::new(client)),
        )
    }

    pub fn get(&self, substrate: SubstrateKind) -> Arc<dyn ComputeProvisioner> {
        match substrate {
            SubstrateKind::Serverless => self.serverless.clone(),
            SubstrateKind::NodePool => self.node_pool.clone(),
        }
    }
}

/// Running replicas of a placement
pub fn running_count(replicas: &[ReplicaInfo]) -> u32 {
    replicas.iter().filter(|r| r.is_running()).count() as u32
}
