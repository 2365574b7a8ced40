//! Serverless provisioner — managed tasks, no intermediate capacity layer
//!
//! Scale bounds apply at the replica-count level only. Tasks get no host
//! access; the planner rejects host mounts before this runs.

use super::{running_count, ComputeProvisioner, PlacementRef, ProvisionedCompute, SchedulerClient};
use crate::config::SubstrateKind;
use crate::error::{Result, TopologyError};
use crate::planner::ServicePlan;
use crate::platform::{LaunchTarget, ReplicaInfo};
use crate::security::SecurityContext;
use async_trait::async_trait;

pub struct ServerlessProvisioner {
    client: SchedulerClient,
}

impl ServerlessProvisioner {
    pub fn new(client: SchedulerClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ComputeProvisioner for ServerlessProvisioner {
    fn substrate(&self) -> SubstrateKind {
        SubstrateKind::Serverless
    }

    async fn provision(
        &self,
        plan: &ServicePlan,
        generation: u64,
        replicas: u32,
        security: &SecurityContext,
    ) -> Result<ProvisionedCompute> {
        if plan.substrate != SubstrateKind::Serverless {
            return Err(TopologyError::UnsupportedCapability {
                substrate: SubstrateKind::Serverless.to_string(),
                message: format!("service '{}' is planned for {}", plan.service, plan.substrate),
            });
        }
        if !plan.task_definition.volumes.is_empty() {
            return Err(TopologyError::UnsupportedCapability {
                substrate: SubstrateKind::Serverless.to_string(),
                message: format!("service '{}' binds host volumes", plan.service),
            });
        }

        let task_definition = self.client.register(&plan.task_definition, security).await?;
        let id = self
            .client
            .place(plan, generation, replicas, &task_definition, LaunchTarget::Serverless)
            .await?;
        let placement = PlacementRef {
            id,
            service: plan.service.clone(),
            generation,
            pool: None,
        };
        let current = running_count(&self.client.describe(&placement).await?);

        Ok(ProvisionedCompute {
            placement,
            task_definition,
            current_replicas: current,
        })
    }

    async fn drain(&self, placement: &PlacementRef) -> Result<bool> {
        self.client.remove(placement).await
    }

    async fn replicas(&self, placement: &PlacementRef) -> Result<Vec<ReplicaInfo>> {
        self.client.describe(placement).await
    }

    async fn scale(&self, placement: &PlacementRef, count: u32) -> Result<()> {
        self.client.set_count(placement, count).await
    }

    async fn stop_replica(&self, placement: &PlacementRef, replica: &str) -> Result<()> {
        self.client.stop(placement, replica).await
    }

    async fn release_capacity(&self, _service: &str) -> Result<bool> {
        Ok(false)
    }
}
