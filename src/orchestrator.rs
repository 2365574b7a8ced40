//! Orchestrator — the operator surface over every topology component
//!
//! Sequences a deploy: plan → routes → identities → rollout → scaling.
//! One rollout may be in flight per service; different services deploy in
//! parallel and share only the routing fabric's serialized rule table.

use crate::compute::{ComputeProvisioner, PlacementRef, ProvisionerSet, SchedulerClient};
use crate::config::{EnvironmentProfile, ScalingPolicy, ServiceSpec, SubstrateKind, TopologyConfig};
use crate::error::{Result, TopologyError};
use crate::observability::TopologyMetrics;
use crate::planner::{pool_name, ServicePlan, TopologyPlanner};
use crate::platform::simulated::SimulatedPlatform;
use crate::platform::{ComputeApi, HealthProbe, IdentityApi, MetricsSource, TrustBroker};
use crate::router::{RouteHandle, RoutingFabric};
use crate::scaling::{
    AutoscalingController, ComputeScaleExecutor, Generation, RolloutController, RolloutReport,
    RolloutRequest, RolloutState, ScaleTarget,
};
use crate::security::{DelegatedCredential, SecurityBinder, SecurityContext};
use crate::service::{HttpHealthProbe, MembershipReconciler, MembershipTarget};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// Clients for every external collaborator
#[derive(Clone)]
pub struct PlatformClients {
    pub compute: Arc<dyn ComputeApi>,
    pub identity: Arc<dyn IdentityApi>,
    pub broker: Arc<dyn TrustBroker>,
    pub metrics: Arc<dyn MetricsSource>,
    pub probe: Arc<dyn HealthProbe>,
}

impl PlatformClients {
    /// Platform clients with readiness judged by HTTP probes against each
    /// replica's address
    pub fn new(
        compute: Arc<dyn ComputeApi>,
        identity: Arc<dyn IdentityApi>,
        broker: Arc<dyn TrustBroker>,
        metrics: Arc<dyn MetricsSource>,
    ) -> Self {
        Self {
            compute,
            identity,
            broker,
            metrics,
            probe: Arc::new(HttpHealthProbe::new()),
        }
    }

    /// Every client backed by one in-memory platform
    pub fn simulated(platform: Arc<SimulatedPlatform>) -> Self {
        Self {
            compute: platform.clone(),
            identity: platform.clone(),
            broker: platform.clone(),
            metrics: platform.clone(),
            probe: platform,
        }
    }
}

/// Current state of one service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    pub service: String,
    pub substrate: SubstrateKind,
    /// Generation serving traffic
    pub generation: Option<u64>,
    pub placement: Option<PlacementRef>,
    pub running_replicas: u32,
    pub routes: Vec<RouteHandle>,
    pub security: Option<SecurityContext>,
    pub scaling: Vec<ScalingPolicy>,
    pub scaling_attached: bool,
    /// State of the latest rollout
    pub rollout_state: Option<RolloutState>,
}

/// One decommission step, in execution order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum DecommissionStep {
    RoutesRemoved { routes: Vec<RouteHandle> },
    ScalingDetached { attached: bool },
    ComputeDrained { placement: Option<String>, removed: bool },
    CapacityReleased { pool: Option<String>, released: bool },
    RolesRevoked { roles: Vec<String> },
}

impl DecommissionStep {
    /// Whether the step changed anything
    pub fn changed(&self) -> bool {
        match self {
            Self::RoutesRemoved { routes } => !routes.is_empty(),
            Self::ScalingDetached { attached } => *attached,
            Self::ComputeDrained { removed, .. } => *removed,
            Self::CapacityReleased { released, .. } => *released,
            Self::RolesRevoked { roles } => !roles.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecommissionReport {
    pub service: String,
    pub steps: Vec<DecommissionStep>,
}

impl DecommissionReport {
    /// True when the service was already gone
    pub fn is_noop(&self) -> bool {
        !self.steps.iter().any(DecommissionStep::changed)
    }
}

#[derive(Default)]
struct ServiceRecord {
    spec: Option<ServiceSpec>,
    current: Option<Generation>,
    last_generation: u64,
    routes: Vec<RouteHandle>,
    security: Option<SecurityContext>,
    /// Identities of the latest bind, whatever its rollout's outcome
    bound: Option<SecurityContext>,
    last_report: Option<RolloutReport>,
}

struct ServiceSlot {
    /// Held for the whole of a rollout or decommission
    busy: tokio::sync::Mutex<()>,
    abort: watch::Sender<bool>,
    record: Mutex<ServiceRecord>,
}

impl ServiceSlot {
    fn new() -> Self {
        let (abort, _) = watch::channel(false);
        Self {
            busy: tokio::sync::Mutex::new(()),
            abort,
            record: Mutex::new(ServiceRecord::default()),
        }
    }

    fn record(&self) -> MutexGuard<'_, ServiceRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn delegation(&self) -> Option<crate::config::CrossAccountDelegation> {
        let record = self.record();
        let delegation = record.spec.as_ref().and_then(|s| s.delegation.clone());
        delegation
    }
}

/// Coordinates planning, security, routing, compute, rollouts, and scaling
pub struct Orchestrator {
    config: TopologyConfig,
    metrics: Arc<TopologyMetrics>,
    fabric: Arc<RoutingFabric>,
    security: SecurityBinder,
    provisioners: ProvisionerSet,
    membership: Arc<MembershipReconciler>,
    executor: Arc<ComputeScaleExecutor>,
    autoscaler: Arc<AutoscalingController>,
    rollouts: RolloutController,
    services: Mutex<HashMap<String, Arc<ServiceSlot>>>,
}

impl Orchestrator {
    /// Build every component from a validated configuration
    pub fn new(config: TopologyConfig, clients: PlatformClients) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(TopologyMetrics::new());
        let fabric = Arc::new(RoutingFabric::new(config.listener.clone(), metrics.clone()));
        let scheduler = SchedulerClient::new(clients.compute.clone(), config.retry.clone(), metrics.clone());
        let membership = Arc::new(MembershipReconciler::new(fabric.clone(), clients.probe.clone()));
        let executor = Arc::new(ComputeScaleExecutor::with_membership(membership.clone()));
        let autoscaler = Arc::new(AutoscalingController::new(
            executor.clone(),
            clients.metrics.clone(),
            metrics.clone(),
            config.autoscaling.clone(),
        ));

        Ok(Self {
            security: SecurityBinder::new(
                clients.identity.clone(),
                clients.broker.clone(),
                metrics.clone(),
                config.retry.clone(),
            ),
            provisioners: ProvisionerSet::from_client(scheduler),
            membership,
            rollouts: RolloutController::new(fabric.clone(), clients.probe.clone(), metrics.clone()),
            executor,
            autoscaler,
            fabric,
            metrics,
            config,
            services: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    pub fn environment(&self) -> &EnvironmentProfile {
        &self.config.environment
    }

    pub fn metrics(&self) -> &Arc<TopologyMetrics> {
        &self.metrics
    }

    pub fn fabric(&self) -> &Arc<RoutingFabric> {
        &self.fabric
    }

    pub fn autoscaler(&self) -> &Arc<AutoscalingController> {
        &self.autoscaler
    }

    fn slot(&self, service: &str) -> Arc<ServiceSlot> {
        self.services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(ServiceSlot::new()))
            .clone()
    }

    fn existing_slot(&self, service: &str) -> Option<Arc<ServiceSlot>> {
        self.services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .cloned()
    }

    fn provisioner(&self, substrate: SubstrateKind) -> Arc<dyn ComputeProvisioner> {
        self.provisioners.get(substrate)
    }

    pub fn membership(&self) -> &Arc<MembershipReconciler> {
        &self.membership
    }

    /// Validate and resolve a spec without touching the platform
    pub fn plan(&self, spec: &ServiceSpec) -> Result<ServicePlan> {
        TopologyPlanner::plan(spec, &self.config.environment)
    }

    /// Deploy every configured service, in parallel
    pub async fn apply(self: &Arc<Self>) -> Vec<(String, Result<RolloutReport>)> {
        let mut set = tokio::task::JoinSet::new();
        for spec in self.config.service_specs().cloned() {
            let orchestrator = self.clone();
            set.spawn(async move {
                let name = spec.name.clone();
                (name, orchestrator.deploy(spec).await)
            });
        }
        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => tracing::error!(error = %e, "Deploy task failed to complete"),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    /// Roll a service to a new generation.
    ///
    /// Returns the rollout report for every rollout that ran, whatever its
    /// terminal state; errors mean nothing was rolled out.
    pub async fn deploy(&self, spec: ServiceSpec) -> Result<RolloutReport> {
        let plan = self.plan(&spec)?;
        let slot = self.slot(&spec.name);
        let _busy = slot
            .busy
            .try_lock()
            .map_err(|_| TopologyError::RolloutInProgress(spec.name.clone()))?;
        slot.abort.send_replace(false);

        let (previous_routes, previous, generation) = {
            let mut record = slot.record();
            record.last_generation += 1;
            (record.routes.clone(), record.current.clone(), record.last_generation)
        };

        let routes = self.register_routes(&plan, &previous_routes)?;
        let security = match self.security.bind(&spec, &self.config.environment).await {
            Ok(security) => security,
            Err(e) => {
                self.remove_routes(&routes, &previous_routes);
                return Err(e);
            }
        };
        slot.record().bound = Some(security.clone());

        // The rollout owns routing membership until it settles
        self.autoscaler.detach(&spec.name).await;
        self.membership.detach(&spec.name).await;
        tracing::info!(
            service = spec.name,
            generation = generation,
            substrate = %plan.substrate,
            "Deploying"
        );

        let report = self
            .rollouts
            .run(RolloutRequest {
                plan: plan.clone(),
                generation,
                security: security.clone(),
                provisioners: self.provisioners.clone(),
                previous: previous.clone(),
                abort: slot.abort.subscribe(),
            })
            .await;

        let serving = {
            let mut record = slot.record();
            match report.state {
                RolloutState::Healthy => {
                    self.remove_routes(&previous_routes, &routes);
                    record.routes = routes;
                    record.spec = Some(spec);
                    record.security = Some(security);
                    if let Some(placement) = report.placement.clone() {
                        record.current = Some(Generation {
                            generation,
                            placement,
                            replicas: plan.replicas.desired,
                            plan,
                        });
                    }
                }
                RolloutState::RolledBack => {
                    self.remove_routes(&routes, &previous_routes);
                    match (&mut record.current, report.placement.clone()) {
                        (Some(current), Some(placement)) => current.placement = placement,
                        _ => record.current = None,
                    }
                    if record.current.is_none() {
                        record.routes.clear();
                    }
                }
                _ => {
                    tracing::error!(
                        service = spec.name,
                        generation = generation,
                        "Rollout failed; previous generation could not be restored"
                    );
                    // Kept so decommission can still drain whatever remains
                    record.routes = self.fabric.routes_for(&spec.name);
                }
            }
            record.last_report = Some(report.clone());
            match report.state {
                RolloutState::Failed => None,
                _ => record.current.clone(),
            }
        };

        match serving {
            Some(current) => self.attach_scaling(&current).await,
            None => {
                self.executor.unbind(&report.service);
            }
        }
        Ok(report)
    }

    /// Register a plan's routes; on conflict, drop the ones this call added
    fn register_routes(&self, plan: &ServicePlan, keep: &[RouteHandle]) -> Result<Vec<RouteHandle>> {
        let mut handles = Vec::with_capacity(plan.routes.len());
        for route in &plan.routes {
            match self.fabric.register_route(&route.rule, route.target.clone()) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    self.remove_routes(&handles, keep);
                    return Err(e);
                }
            }
        }
        Ok(handles)
    }

    /// Deregister `routes` except those also in `keep`
    fn remove_routes(&self, routes: &[RouteHandle], keep: &[RouteHandle]) {
        for handle in routes.iter().filter(|h| !keep.contains(h)) {
            self.fabric.deregister_route(handle);
        }
    }

    /// Hand the serving generation to the membership reconciler and the
    /// autoscaler, on that generation's own substrate
    async fn attach_scaling(&self, current: &Generation) {
        let provisioner = self.provisioner(current.plan.substrate);
        self.membership
            .attach(MembershipTarget {
                service: current.plan.service.clone(),
                generation: current.generation,
                placement: current.placement.clone(),
                provisioner: provisioner.clone(),
                targets: current.plan.target_names(),
                health: current.plan.health_check.clone(),
            })
            .await;
        self.executor.bind(provisioner, current.placement.clone());
        let target = ScaleTarget {
            service: current.plan.service.clone(),
            min: current.plan.replicas.min,
            max: current.plan.replicas.max,
        };
        self.autoscaler.attach(target, current.plan.scaling.clone()).await;
    }

    /// Signal an in-flight rollout to roll back.
    ///
    /// `false` when no rollout was running for the service.
    pub fn abort(&self, service: &str) -> bool {
        let Some(slot) = self.existing_slot(service) else {
            return false;
        };
        if slot.busy.try_lock().is_ok() {
            return false;
        }
        tracing::warn!(service = service, "Rollout abort requested");
        slot.abort.send_replace(true);
        true
    }

    /// Remove a service: routes, scaling, compute, capacity, identities.
    ///
    /// Routes go first. If a later step fails the routes stay removed and the
    /// remaining resources are left for the next call. Calling again after
    /// success is a no-op.
    pub async fn decommission(&self, service: &str) -> Result<DecommissionReport> {
        let slot = self.slot(service);
        let _busy = slot
            .busy
            .try_lock()
            .map_err(|_| TopologyError::RolloutInProgress(service.to_string()))?;

        let mut steps = Vec::with_capacity(5);
        let routes = self.fabric.deregister_service(service);
        tracing::info!(service = service, routes = routes.len(), "Routes removed");
        slot.record().routes.clear();
        steps.push(DecommissionStep::RoutesRemoved { routes });

        let attached = self.autoscaler.detach(service).await;
        self.membership.detach(service).await;
        self.executor.unbind(service);
        steps.push(DecommissionStep::ScalingDetached { attached });

        let (spec, current, bound) = {
            let record = slot.record();
            (record.spec.clone(), record.current.clone(), record.bound.clone())
        };

        let substrate = current
            .as_ref()
            .map(|c| c.plan.substrate)
            .or_else(|| spec.as_ref().map(|s| s.substrate.kind()));
        let provisioner = substrate.map(|s| self.provisioner(s));

        match (&current, &provisioner) {
            (Some(current), Some(provisioner)) => {
                let removed = provisioner.drain(&current.placement).await?;
                slot.record().current = None;
                steps.push(DecommissionStep::ComputeDrained {
                    placement: Some(current.placement.id.clone()),
                    removed,
                });
            }
            _ => steps.push(DecommissionStep::ComputeDrained {
                placement: None,
                removed: false,
            }),
        }

        match (substrate, &provisioner) {
            (Some(SubstrateKind::NodePool), Some(provisioner)) => {
                let released = provisioner.release_capacity(service).await?;
                steps.push(DecommissionStep::CapacityReleased {
                    pool: Some(pool_name(service)),
                    released,
                });
            }
            _ => steps.push(DecommissionStep::CapacityReleased {
                pool: None,
                released: false,
            }),
        }

        // Revoked by name: a deploy that never went healthy still bound identities
        let delegation = bound
            .as_ref()
            .and_then(|b| b.delegation.clone())
            .or_else(|| spec.as_ref().and_then(|s| s.delegation.clone()));
        let roles = self
            .security
            .revoke(service, &self.config.environment, delegation.as_ref())
            .await?;
        steps.push(DecommissionStep::RolesRevoked { roles });

        {
            let mut record = slot.record();
            record.spec = None;
            record.security = None;
            record.bound = None;
        }
        let report = DecommissionReport {
            service: service.to_string(),
            steps,
        };
        tracing::info!(service = service, noop = report.is_noop(), "Service decommissioned");
        Ok(report)
    }

    /// Delegated credential for a deployed service's declared delegation
    pub async fn delegated_credential(&self, service: &str) -> Result<Arc<DelegatedCredential>> {
        let delegation = self
            .existing_slot(service)
            .and_then(|slot| slot.delegation())
            .ok_or_else(|| {
                TopologyError::Other(format!("service '{}' declares no delegation", service))
            })?;
        self.security.resolve_delegation(&delegation).await
    }

    /// Latest rollout report for a service
    pub fn last_rollout(&self, service: &str) -> Option<RolloutReport> {
        let slot = self.existing_slot(service)?;
        let report = slot.record().last_report.clone();
        report
    }

    /// Current topology of a service; `None` when it was never deployed or
    /// has been decommissioned
    pub async fn topology(&self, service: &str) -> Option<Topology> {
        let slot = self.existing_slot(service)?;
        let (spec, current, routes, security, state) = {
            let record = slot.record();
            (
                record.spec.clone(),
                record.current.clone(),
                record.routes.clone(),
                record.security.clone(),
                record.last_report.as_ref().map(|r| r.state),
            )
        };
        if spec.is_none() && current.is_none() {
            return None;
        }

        let substrate = current
            .as_ref()
            .map(|c| c.plan.substrate)
            .or_else(|| spec.as_ref().map(|s| s.substrate.kind()))
            .unwrap_or(SubstrateKind::Serverless);
        let running_replicas = match &current {
            Some(current) => match self.provisioner(substrate).replicas(&current.placement).await {
                Ok(replicas) => crate::compute::running_count(&replicas),
                Err(e) => {
                    tracing::warn!(service = service, error = %e, "Could not describe replicas");
                    0
                }
            },
            None => 0,
        };

        Some(Topology {
            service: service.to_string(),
            substrate,
            generation: current.as_ref().map(|c| c.generation),
            placement: current.as_ref().map(|c| c.placement.clone()),
            running_replicas,
            routes,
            security,
            scaling: spec.map(|s| s.scaling).unwrap_or_default(),
            scaling_attached: self.autoscaler.is_attached(service),
            rollout_state: state,
        })
    }

    /// Topologies of every known service, in name order
    pub async fn topologies(&self) -> Vec<Topology> {
        let mut names: Vec<String> = self
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        let mut topologies = Vec::with_capacity(names.len());
        for name in names {
            if let Some(topology) = self.topology(&name).await {
                topologies.push(topology);
            }
        }
        topologies
    }
}
