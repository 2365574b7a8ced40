//! Topology planner — stateless validation and plan resolution
//!
//! `validate` runs every local check before anything reaches the platform.
//! `plan` turns a validated spec into descriptors: identities, the task
//! definition, the capacity pool request, route bindings, and scaling
//! policies. Both are pure; planning the same spec twice yields equal plans.

use crate::compute::env::{build_environment, check_reserved};
use crate::config::{
    CapacityStrategy, ComputeSubstrate, CrossAccountDelegation, EnvironmentProfile,
    HealthCheckConfig, ReplicaCounts, RolloutConfig, RoutingRule, ScalingPolicy, ServiceSpec,
    SubstrateKind,
};
use crate::error::{Result, TopologyError};
use crate::platform::{
    CapacityPoolRequest, ContainerDefinition, MountPoint, Role, SpotTerms, TaskDefinition, Volume,
};
use crate::router::RouteTarget;
use crate::security::{execution_role, workload_role};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A routing rule with its resolved target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedRoute {
    pub rule: RoutingRule,
    pub target: RouteTarget,
}

/// Capacity pool and provider settings for a node-pool service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityPlan {
    pub request: CapacityPoolRequest,
    pub target_capacity_percent: u32,
}

impl CapacityPlan {
    pub fn interruptible(&self) -> bool {
        self.request.spot.is_some()
    }
}

/// Fully resolved descriptors for one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicePlan {
    pub service: String,
    pub substrate: SubstrateKind,
    pub execution_role: Role,
    pub workload_role: Role,
    pub task_definition: TaskDefinition,
    pub capacity: Option<CapacityPlan>,
    pub routes: Vec<PlannedRoute>,
    pub scaling: Vec<ScalingPolicy>,
    pub replicas: ReplicaCounts,
    pub health_check: HealthCheckConfig,
    pub rollout: RolloutConfig,
    pub delegation: Option<CrossAccountDelegation>,
}

impl ServicePlan {
    /// Target group names the service binds
    pub fn target_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.iter().map(|r| r.target.name.clone()).collect();
        names.dedup();
        names
    }
}

/// Entry point that turns specs into plans
pub struct TopologyPlanner;

impl TopologyPlanner {
    /// Every local check: structure, substrate capabilities, task sizing,
    /// and the environment contract
    pub fn validate(spec: &ServiceSpec, env: &EnvironmentProfile) -> Result<()> {
        spec.check()?;
        check_reserved(spec)?;
        if env.region.trim().is_empty() {
            return Err(TopologyError::validation(
                &spec.name,
                "environment region is empty",
            ));
        }

        if spec.substrate.kind() == SubstrateKind::Serverless {
            if let Some(mount) = spec.containers.iter().flat_map(|c| c.host_mounts.iter()).next() {
                return Err(TopologyError::UnsupportedCapability {
                    substrate: SubstrateKind::Serverless.to_string(),
                    message: format!(
                        "service '{}' requests host mount '{}' ({}); host mounts need the node-pool substrate",
                        spec.name, mount.name, mount.host_path
                    ),
                });
            }
            let (cpu, memory) = (spec.total_cpu(), spec.total_memory_mib());
            if !is_valid_serverless_size(cpu, memory) {
                return Err(TopologyError::UnsupportedCapability {
                    substrate: SubstrateKind::Serverless.to_string(),
                    message: format!(
                        "service '{}' requests {} CPU units / {} MiB, which is not a managed task size",
                        spec.name, cpu, memory
                    ),
                });
            }
        }
        Ok(())
    }

    /// Resolve a spec into its plan, validating first
    pub fn plan(spec: &ServiceSpec, env: &EnvironmentProfile) -> Result<ServicePlan> {
        Self::validate(spec, env)?;

        let execution = execution_role(spec, env);
        let workload = workload_role(spec, env);
        let task_definition = task_definition(spec, env, &execution.name, &workload.name);
        let capacity = match &spec.substrate {
            ComputeSubstrate::Serverless => None,
            ComputeSubstrate::NodePool(strategy) => Some(capacity_plan(spec, env, strategy)),
        };

        let mut routes = Vec::with_capacity(spec.routes.len());
        for rule in &spec.routes {
            let (Some(port), Some(name)) = (spec.rule_port(rule), spec.target_name(rule)) else {
                return Err(TopologyError::validation(
                    &spec.name,
                    format!("route at priority {} has no resolvable target", rule.priority),
                ));
            };
            routes.push(PlannedRoute {
                rule: rule.clone(),
                target: RouteTarget {
                    service: spec.name.clone(),
                    name,
                    port,
                    aggregate: rule.aggregate,
                },
            });
        }

        Ok(ServicePlan {
            service: spec.name.clone(),
            substrate: spec.substrate.kind(),
            execution_role: execution,
            workload_role: workload,
            task_definition,
            capacity,
            routes,
            scaling: spec.scaling.clone(),
            replicas: spec.replicas,
            health_check: spec.health_check.clone(),
            rollout: spec.rollout.clone(),
            delegation: spec.delegation.clone(),
        })
    }
}

/// Capacity pool name for a service
pub fn pool_name(service: &str) -> String {
    format!("{}-pool", service)
}

fn capacity_plan(
    spec: &ServiceSpec,
    env: &EnvironmentProfile,
    strategy: &CapacityStrategy,
) -> CapacityPlan {
    CapacityPlan {
        request: CapacityPoolRequest {
            name: pool_name(&spec.name),
            instance_class: strategy.instance_class.clone(),
            architecture: env.architecture,
            min_nodes: strategy.min_nodes,
            max_nodes: strategy.max_nodes,
            desired_nodes: strategy.desired_nodes,
            root_volume_gib: strategy.root_volume_gib,
            spot: strategy.spot_eligible.then(|| SpotTerms {
                price_ceiling: strategy.spot_price_ceiling,
            }),
        },
        target_capacity_percent: strategy.target_capacity_percent,
    }
}

fn task_definition(
    spec: &ServiceSpec,
    env: &EnvironmentProfile,
    execution_role: &str,
    task_role: &str,
) -> TaskDefinition {
    // One named volume per distinct host path
    let mut volumes: BTreeMap<String, Volume> = BTreeMap::new();
    let containers = spec
        .containers
        .iter()
        .map(|container| {
            let mount_points = container
                .host_mounts
                .iter()
                .map(|mount| {
                    let volume = volumes
                        .entry(mount.host_path.clone())
                        .or_insert_with(|| Volume {
                            name: mount.name.clone(),
                            host_path: mount.host_path.clone(),
                        });
                    MountPoint {
                        volume: volume.name.clone(),
                        container_path: mount.container_path.clone(),
                        read_only: mount.read_only,
                    }
                })
                .collect();
            ContainerDefinition {
                name: container.name.clone(),
                image: container.image.clone(),
                port: container.port,
                cpu: container.cpu,
                memory_mib: container.memory_mib,
                environment: build_environment(spec, container, env),
                secrets: container.secrets.clone(),
                mount_points,
            }
        })
        .collect();

    TaskDefinition {
        family: spec.name.clone(),
        substrate: spec.substrate.kind(),
        architecture: env.architecture,
        cpu: spec.total_cpu(),
        memory_mib: spec.total_memory_mib(),
        execution_role: execution_role.to_string(),
        task_role: task_role.to_string(),
        containers,
        volumes: volumes.into_values().collect(),
        health_check: spec.health_check.clone(),
    }
}

/// Managed task sizes: CPU units → allowed memory (MiB)
fn is_valid_serverless_size(cpu: u32, memory: u32) -> bool {
    let stepped = |min: u32, max: u32, step: u32| {
        memory >= min && memory <= max && (memory - min) % step == 0
    };
    match cpu {
        256 => matches!(memory, 512 | 1024 | 2048),
        512 => stepped(1024, 4096, 1024),
        1024 => stepped(2048, 8192, 1024),
        2048 => stepped(4096, 16384, 1024),
        4096 => stepped(8192, 30720, 1024),
        8192 => stepped(16384, 61440, 4096),
        16384 => stepped(32768, 122880, 8192),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContainerSpec, HostMount};

    fn env() -> EnvironmentProfile {
        EnvironmentProfile::for_region("us-east-1")
    }

    fn serverless() -> ServiceSpec {
        ServiceSpec::builder("proxy")
            .container(ContainerSpec::new("proxy", "proxy:1", 8000))
            .replicas(2, 1, 4)
            .route(RoutingRule::new(&["/v1/*"], 10))
            .build()
            .unwrap()
    }

    fn docker_mount() -> HostMount {
        HostMount {
            name: "docker-sock".into(),
            host_path: "/var/run/docker.sock".into(),
            container_path: "/var/run/docker.sock".into(),
            read_only: false,
        }
    }

    #[test]
    fn test_plan_is_deterministic() {
        let a = TopologyPlanner::plan(&serverless(), &env()).unwrap();
        let b = TopologyPlanner::plan(&serverless(), &env()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.execution_role.name, b.execution_role.name);
    }

    #[test]
    fn test_plan_serverless() {
        let plan = TopologyPlanner::plan(&serverless(), &env()).unwrap();
        assert_eq!(plan.substrate, SubstrateKind::Serverless);
        assert!(plan.capacity.is_none());
        assert_eq!(plan.routes.len(), 1);
        assert_eq!(plan.routes[0].target.name, "proxy-8000");
        assert_eq!(plan.routes[0].target.port, 8000);
        assert_eq!(plan.task_definition.cpu, 512);
        assert_eq!(plan.task_definition.execution_role, plan.execution_role.name);
        assert_eq!(
            plan.task_definition.containers[0].environment["AWS_REGION"],
            "us-east-1"
        );
    }

    #[test]
    fn test_serverless_host_mount_unsupported() {
        let mut container = ContainerSpec::new("sandbox", "sandbox:1", 9000);
        container.host_mounts.push(docker_mount());
        let spec = ServiceSpec::builder("sandbox").container(container).build().unwrap();
        let err = TopologyPlanner::validate(&spec, &env()).unwrap_err();
        assert!(matches!(err, TopologyError::UnsupportedCapability { .. }));
    }

    #[test]
    fn test_node_pool_plan() {
        let mut container = ContainerSpec::new("sandbox", "sandbox:1", 9000);
        container.host_mounts.push(docker_mount());
        let mut strategy = CapacityStrategy::new("m5.large");
        strategy.spot_eligible = true;
        strategy.spot_price_ceiling = Some(0.05);
        let spec = ServiceSpec::builder("sandbox")
            .container(container)
            .substrate(ComputeSubstrate::NodePool(strategy))
            .build()
            .unwrap();
        let plan = TopologyPlanner::plan(&spec, &env()).unwrap();
        let capacity = plan.capacity.unwrap();
        assert_eq!(capacity.request.name, "sandbox-pool");
        assert!(capacity.interruptible());
        assert_eq!(capacity.request.spot.unwrap().price_ceiling, Some(0.05));
        assert_eq!(plan.task_definition.volumes.len(), 1);
        assert_eq!(plan.task_definition.volumes[0].host_path, "/var/run/docker.sock");
        assert_eq!(
            plan.task_definition.containers[0].mount_points[0].volume,
            "docker-sock"
        );
    }

    #[test]
    fn test_invalid_serverless_size() {
        let mut container = ContainerSpec::new("proxy", "proxy:1", 8000);
        container.cpu = 256;
        container.memory_mib = 4096;
        let spec = ServiceSpec::builder("proxy").container(container).build().unwrap();
        assert!(matches!(
            TopologyPlanner::validate(&spec, &env()).unwrap_err(),
            TopologyError::UnsupportedCapability { .. }
        ));
    }

    #[test]
    fn test_node_pool_ignores_size_table() {
        let mut container = ContainerSpec::new("worker", "worker:1", 8000);
        container.cpu = 300;
        container.memory_mib = 700;
        let spec = ServiceSpec::builder("worker")
            .container(container)
            .substrate(ComputeSubstrate::NodePool(CapacityStrategy::new("c5.xlarge")))
            .build()
            .unwrap();
        assert!(TopologyPlanner::validate(&spec, &env()).is_ok());
    }

    #[test]
    fn test_reserved_env_rejected() {
        let spec = ServiceSpec::builder("proxy")
            .container(ContainerSpec::new("proxy", "proxy:1", 8000))
            .env("PORT", "9999")
            .build()
            .unwrap();
        assert!(matches!(
            TopologyPlanner::validate(&spec, &env()).unwrap_err(),
            TopologyError::Validation { .. }
        ));
    }

    #[test]
    fn test_serverless_size_table() {
        assert!(is_valid_serverless_size(256, 512));
        assert!(!is_valid_serverless_size(256, 3072));
        assert!(is_valid_serverless_size(1024, 3072));
        assert!(is_valid_serverless_size(8192, 20480));
        assert!(!is_valid_serverless_size(8192, 18432));
        assert!(!is_valid_serverless_size(300, 1024));
    }
}
