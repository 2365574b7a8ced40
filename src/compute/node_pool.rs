//! Node-pool provisioner — long-lived hosts behind a capacity provider
//!
//! Order of operations per generation:
//! 1. ensure the capacity pool (idempotent on name)
//! 2. attach the capacity provider at the strategy's target utilization
//! 3. check every host mount against the pool's exposed host paths
//! 4. register and place, tagged interruptible when spot eligible
//! 5. wait a bounded time for the replicas to find capacity
//!
//! Interrupted spot replicas are rescheduled by the platform and are not
//! treated as failures here.

use super::{running_count, ComputeProvisioner, PlacementRef, ProvisionedCompute, SchedulerClient};
use super::retry::with_retry;
use crate::config::SubstrateKind;
use crate::error::{Result, TopologyError};
use crate::planner::{pool_name, CapacityPlan, ServicePlan};
use crate::platform::{LaunchTarget, ReplicaInfo};
use crate::security::SecurityContext;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

/// Interval between capacity checks while replicas are pending
const PLACEMENT_POLL: Duration = Duration::from_secs(2);

pub struct NodePoolProvisioner {
    client: SchedulerClient,
}

impl NodePoolProvisioner {
    pub fn new(client: SchedulerClient) -> Self {
        Self { client }
    }

    /// Create the pool and couple it to the scheduler
    async fn ensure_pool(&self, capacity: &CapacityPlan) -> Result<String> {
        let api = self.client.api();
        let policy = self.client.policy();
        let metrics = self.client.metrics();
        let request = &capacity.request;

        let pool = with_retry(policy, "ensure_capacity_pool", metrics, || {
            api.ensure_capacity_pool(request)
        })
        .await?;
        with_retry(policy, "attach_capacity_provider", metrics, || {
            api.attach_capacity_provider(&pool, capacity.target_capacity_percent)
        })
        .await?;

        tracing::info!(
            pool = pool,
            instance_class = request.instance_class,
            min = request.min_nodes,
            max = request.max_nodes,
            interruptible = capacity.interruptible(),
            "Capacity pool ready"
        );
        Ok(pool)
    }

    /// Fail before placement when a mount needs a path the hosts don't expose
    async fn check_host_capabilities(&self, plan: &ServicePlan, pool: &str) -> Result<()> {
        if plan.task_definition.volumes.is_empty() {
            return Ok(());
        }
        let api = self.client.api();
        let exposed = with_retry(
            self.client.policy(),
            "host_capabilities",
            self.client.metrics(),
            || api.host_capabilities(pool),
        )
        .await?;
        for path in plan.task_definition.host_paths() {
            if !exposed.contains(path) {
                return Err(TopologyError::HostCapabilityUnavailable {
                    pool: pool.to_string(),
                    path: path.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Poll until `wanted` replicas run or the placement wait elapses
    async fn await_capacity(&self, placement: &PlacementRef, wanted: u32) -> Result<u32> {
        let deadline = Instant::now() + self.client.policy().placement_wait();
        loop {
            let running = running_count(&self.client.describe(placement).await?);
            if running >= wanted {
                return Ok(running);
            }
            if Instant::now() >= deadline {
                return Err(TopologyError::CapacityExhausted {
                    pool: placement.pool.clone().unwrap_or_default(),
                    message: format!(
                        "{} of {} replicas running after {}s",
                        running,
                        wanted,
                        self.client.policy().placement_wait_secs
                    ),
                });
            }
            tokio::time::sleep(PLACEMENT_POLL).await;
        }
    }
}

#[async_trait]
impl ComputeProvisioner for NodePoolProvisioner {
    fn substrate(&self) -> SubstrateKind {
        SubstrateKind::NodePool
    }

    async fn provision(
        &self,
        plan: &ServicePlan,
        generation: u64,
        replicas: u32,
        security: &SecurityContext,
    ) -> Result<ProvisionedCompute> {
        let Some(capacity) = &plan.capacity else {
            return Err(TopologyError::validation(
                &plan.service,
                "node-pool substrate requires a capacity strategy",
            ));
        };

        let pool = self.ensure_pool(capacity).await?;
        self.check_host_capabilities(plan, &pool).await?;

        let task_definition = self.client.register(&plan.task_definition, security).await?;
        let launch = LaunchTarget::CapacityPool {
            pool: pool.clone(),
            interruptible: capacity.interruptible(),
        };
        let id = self
            .client
            .place(plan, generation, replicas, &task_definition, launch)
            .await?;
        let placement = PlacementRef {
            id,
            service: plan.service.clone(),
            generation,
            pool: Some(pool),
        };

        match self.await_capacity(&placement, replicas).await {
            Ok(current) => Ok(ProvisionedCompute {
                placement,
                task_definition,
                current_replicas: current,
            }),
            Err(e) => {
                tracing::warn!(
                    service = plan.service,
                    generation = generation,
                    error = %e,
                    "Releasing placement that could not find capacity"
                );
                if let Err(cleanup) = self.client.remove(&placement).await {
                    tracing::error!(placement = placement.id, error = %cleanup, "Placement cleanup failed");
                }
                Err(e)
            }
        }
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

    async fn release_capacity(&self, service: &str) -> Result<bool> {
        let api = self.client.api();
        let pool = pool_name(service);
        let removed = with_retry(
            self.client.policy(),
            "delete_capacity_pool",
            self.client.metrics(),
            || api.delete_capacity_pool(&pool),
        )
        .await?;
        if removed {
            tracing::info!(service = service, pool = pool, "Capacity pool released");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        CapacityStrategy, ComputeSubstrate, ContainerSpec, EnvironmentProfile, HostMount,
        RetryPolicy, ServiceSpec,
    };
    use crate::observability::TopologyMetrics;
    use crate::planner::TopologyPlanner;
    use crate::platform::simulated::SimulatedPlatform;
    use std::sync::Arc;

    fn plan(spot: bool) -> ServicePlan {
        let mut container = ContainerSpec::new("sandbox", "sandbox:1", 9000);
        container.host_mounts.push(HostMount {
            name: "docker-sock".into(),
            host_path: "/var/run/docker.sock".into(),
            container_path: "/var/run/docker.sock".into(),
            read_only: false,
        });
        let mut strategy = CapacityStrategy::new("m5.large");
        strategy.min_nodes = 1;
        strategy.max_nodes = 3;
        strategy.desired_nodes = 1;
        strategy.spot_eligible = spot;
        let spec = ServiceSpec::builder("sandbox")
            .container(container)
            .replicas(1, 1, 3)
            .substrate(ComputeSubstrate::NodePool(strategy))
            .build()
            .unwrap();
        TopologyPlanner::plan(&spec, &EnvironmentProfile::for_region("us-east-1")).unwrap()
    }

    fn security(plan: &ServicePlan) -> SecurityContext {
        SecurityContext {
            execution_identity: plan.execution_role.name.clone(),
            workload_identity: plan.workload_role.name.clone(),
            delegation: None,
        }
    }

    fn provisioner(platform: &Arc<SimulatedPlatform>) -> NodePoolProvisioner {
        let retry = RetryPolicy {
            placement_wait_secs: 10,
            ..RetryPolicy::default()
        };
        NodePoolProvisioner::new(SchedulerClient::new(
            platform.clone(),
            retry,
            Arc::new(TopologyMetrics::new()),
        ))
    }

    fn position(journal: &[String], prefix: &str) -> usize {
        journal
            .iter()
            .position(|op| op.starts_with(prefix))
            .unwrap_or_else(|| panic!("no '{}' in journal {:?}", prefix, journal))
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_created_before_placement() {
        let platform = Arc::new(SimulatedPlatform::new());
        let plan = plan(true);
        let compute = provisioner(&platform)
            .provision(&plan, 1, 1, &security(&plan))
            .await
            .unwrap();
        assert_eq!(compute.current_replicas, 1);
        assert_eq!(compute.placement.pool.as_deref(), Some("sandbox-pool"));

        let journal = platform.journal();
        let ensure = position(&journal, "ensure_capacity_pool");
        let attach = position(&journal, "attach_capacity_provider");
        let place = position(&journal, "place ");
        assert!(ensure < attach && attach < place);

        let (request, pct) = platform.pool("sandbox-pool").unwrap();
        assert!(request.spot.is_some());
        assert_eq!(pct, Some(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_host_path_fails_before_placement() {
        let platform = Arc::new(SimulatedPlatform::new());
        platform.hide_host_path("/var/run/docker.sock");
        let plan = plan(false);
        let err = provisioner(&platform)
            .provision(&plan, 1, 1, &security(&plan))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TopologyError::HostCapabilityUnavailable { ref path, .. } if path == "/var/run/docker.sock"
        ));
        assert!(platform.pools().contains(&"sandbox-pool".to_string()));
        assert!(!platform.journal().iter().any(|op| op.starts_with("place ")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_reused_across_generations() {
        let platform = Arc::new(SimulatedPlatform::new());
        let plan = plan(false);
        let provisioner = provisioner(&platform);
        provisioner.provision(&plan, 1, 1, &security(&plan)).await.unwrap();
        provisioner.provision(&plan, 2, 1, &security(&plan)).await.unwrap();
        let creates = platform
            .journal()
            .iter()
            .filter(|op| op.starts_with("ensure_capacity_pool"))
            .count();
        assert_eq!(creates, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_exhausted_after_bounded_wait() {
        let platform = Arc::new(SimulatedPlatform::new());
        platform.set_pool_slots("sandbox-pool", 1);
        let plan = plan(false);
        let err = provisioner(&platform)
            .provision(&plan, 1, 3, &security(&plan))
            .await
            .unwrap_err();
        assert!(matches!(err, TopologyError::CapacityExhausted { .. }));
        // the half-placed generation is released
        assert!(platform.placements_for("sandbox").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_capacity_twice() {
        let platform = Arc::new(SimulatedPlatform::new());
        let plan = plan(false);
        let provisioner = provisioner(&platform);
        let compute = provisioner.provision(&plan, 1, 1, &security(&plan)).await.unwrap();
        provisioner.drain(&compute.placement).await.unwrap();
        assert!(provisioner.release_capacity("sandbox").await.unwrap());
        assert!(!provisioner.release_capacity("sandbox").await.unwrap());
    }
}
