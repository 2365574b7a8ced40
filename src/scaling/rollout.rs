//! Rollout controller — bounded-risk generation replacement with rollback
//!
//! `Provisioning → Stabilizing → Healthy`, or `→ RollingBack → RolledBack`,
//! or `→ Failed` once rollback attempts are exhausted.
//!
//! While stabilizing, a new replica joins its routing targets only after
//! `healthy_threshold` consecutive passing probes. Old replicas leave one at
//! a time, and only while the healthy count stays at or above
//! `min_healthy_percent × desired` afterwards. Every routing change is
//! journaled; rollback replays the journal in reverse. The previous
//! generation's compute keeps running until the rollout is declared healthy.

use crate::compute::{ComputeProvisioner, PlacementRef, ProvisionerSet};
use crate::config::{HealthCheckConfig, RolloutConfig, SubstrateKind};
use crate::error::{Result, TopologyError};
use crate::observability::TopologyMetrics;
use crate::planner::ServicePlan;
use crate::platform::{HealthProbe, ReplicaInfo, ReplicaStatus};
use crate::router::RoutingFabric;
use crate::security::SecurityContext;
use crate::service::health_check::{probe_with_deadline, Readiness};
use crate::service::{HealthTracker, Replica};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// State of a rollout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutState {
    Provisioning,
    Stabilizing,
    Healthy,
    RollingBack,
    RolledBack,
    Failed,
}

impl RolloutState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Healthy | Self::RolledBack | Self::Failed)
    }
}

impl std::fmt::Display for RolloutState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provisioning => write!(f, "provisioning"),
            Self::Stabilizing => write!(f, "stabilizing"),
            Self::Healthy => write!(f, "healthy"),
            Self::RollingBack => write!(f, "rolling_back"),
            Self::RolledBack => write!(f, "rolled_back"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One recorded state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: RolloutState,
    pub to: RolloutState,
    /// Milliseconds since the rollout started
    pub after_ms: u64,
    pub reason: Option<String>,
}

/// Outcome of one rollout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutReport {
    pub service: String,
    pub generation: u64,
    pub previous_generation: Option<u64>,
    pub state: RolloutState,
    pub transitions: Vec<Transition>,
    /// Placement serving traffic when the rollout ended
    pub placement: Option<PlacementRef>,
    /// Ready replicas of the serving generation
    pub ready_replicas: u32,
    pub min_healthy_required: u32,
    /// Lowest healthy count sampled while replacing a previous generation
    pub min_healthy_observed: Option<u32>,
    pub rollback_reason: Option<String>,
    pub rollback_attempts: u32,
}

impl RolloutReport {
    /// Visited states in order, starting with `Provisioning`
    pub fn states(&self) -> Vec<RolloutState> {
        let mut states = vec![RolloutState::Provisioning];
        states.extend(self.transitions.iter().map(|t| t.to));
        states
    }

    /// `Ok` only when the new generation is serving
    pub fn ensure_healthy(self) -> Result<Self> {
        if self.state == RolloutState::Healthy {
            return Ok(self);
        }
        Err(TopologyError::RollbackTriggered {
            service: self.service.clone(),
            reason: match &self.rollback_reason {
                Some(reason) => format!("{} ({})", reason, self.state),
                None => self.state.to_string(),
            },
        })
    }
}

/// A generation known to have served successfully
#[derive(Debug, Clone)]
pub struct Generation {
    pub generation: u64,
    pub plan: ServicePlan,
    pub placement: PlacementRef,
    /// Replica count it served with
    pub replicas: u32,
}

/// Everything one rollout needs
pub struct RolloutRequest {
    pub plan: ServicePlan,
    pub generation: u64,
    pub security: SecurityContext,
    /// The new generation uses its plan's substrate; restoring and retiring
    /// the previous generation use the previous plan's substrate
    pub provisioners: ProvisionerSet,
    pub previous: Option<Generation>,
    /// Flips to `true` when the platform reports the deployment failed or
    /// an operator aborts
    pub abort: watch::Receiver<bool>,
}

enum RoutingAction {
    Registered(Arc<Replica>),
    Drained(Arc<Replica>),
}

/// Drives rollouts against the routing fabric
pub struct RolloutController {
    fabric: Arc<RoutingFabric>,
    probe: Arc<dyn HealthProbe>,
    metrics: Arc<TopologyMetrics>,
}

impl RolloutController {
    pub fn new(
        fabric: Arc<RoutingFabric>,
        probe: Arc<dyn HealthProbe>,
        metrics: Arc<TopologyMetrics>,
    ) -> Self {
        Self {
            fabric,
            probe,
            metrics,
        }
    }

    /// Run a rollout to a terminal state
    pub async fn run(&self, request: RolloutRequest) -> RolloutReport {
        let mut run = Run::new(self, request);
        run.execute().await;
        let report = run.report;
        self.metrics.record_rollout_outcome(&report.state.to_string());
        report
    }

    async fn probe_once(&self, replica: &ReplicaInfo, health: &HealthCheckConfig) -> bool {
        probe_with_deadline(self.probe.as_ref(), replica, health).await
    }
}

struct Run<'c> {
    ctl: &'c RolloutController,
    req: RolloutRequest,
    report: RolloutReport,
    started: Instant,
    targets: Vec<String>,
    serving_old: Vec<Arc<Replica>>,
    serving_new: Vec<Arc<Replica>>,
    journal: Vec<RoutingAction>,
    trackers: HashMap<String, HealthTracker>,
    placement: Option<PlacementRef>,
}

impl<'c> Run<'c> {
    fn new(ctl: &'c RolloutController, req: RolloutRequest) -> Self {
        let targets = req
            .plan
            .target_names()
            .into_iter()
            .filter(|name| ctl.fabric.target(name).is_some())
            .collect();
        let report = RolloutReport {
            service: req.plan.service.clone(),
            generation: req.generation,
            previous_generation: req.previous.as_ref().map(|p| p.generation),
            state: RolloutState::Provisioning,
            transitions: Vec::new(),
            placement: None,
            ready_replicas: 0,
            min_healthy_required: req.plan.rollout.min_healthy_replicas(req.plan.replicas.desired),
            min_healthy_observed: None,
            rollback_reason: None,
            rollback_attempts: 0,
        };
        Self {
            ctl,
            req,
            report,
            started: Instant::now(),
            targets,
            serving_old: Vec::new(),
            serving_new: Vec::new(),
            journal: Vec::new(),
            trackers: HashMap::new(),
            placement: None,
        }
    }

    fn rollout(&self) -> &RolloutConfig {
        &self.req.plan.rollout
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.rollout().poll_interval_ms)
    }

    fn compute(&self) -> Arc<dyn ComputeProvisioner> {
        self.req.provisioners.get(self.req.plan.substrate)
    }

    fn compute_for(&self, generation: &Generation) -> Arc<dyn ComputeProvisioner> {
        self.req.provisioners.get(generation.plan.substrate)
    }

    fn drain_from_targets(&self, replica_id: &str) {
        for name in &self.targets {
            self.ctl.fabric.drain_replica(name, replica_id);
        }
    }

    fn transition(&mut self, to: RolloutState, reason: Option<String>) {
        let from = self.report.state;
        tracing::info!(
            service = self.report.service,
            generation = self.report.generation,
            from = %from,
            to = %to,
            reason = reason.as_deref().unwrap_or(""),
            "Rollout transition"
        );
        self.report.transitions.push(Transition {
            from,
            to,
            after_ms: self.started.elapsed().as_millis() as u64,
            reason,
        });
        self.report.state = to;
    }

    async fn execute(&mut self) {
        tracing::info!(
            service = self.report.service,
            generation = self.report.generation,
            previous = ?self.report.previous_generation,
            desired = self.req.plan.replicas.desired,
            "Rollout started"
        );
        self.collect_previous().await;

        let desired = self.req.plan.replicas.desired;
        let provisioned = self
            .compute()
            .provision(&self.req.plan, self.req.generation, desired, &self.req.security)
            .await;
        match provisioned {
            Ok(compute) => self.placement = Some(compute.placement),
            Err(e) => {
                self.rollback(format!("provisioning failed: {}", e)).await;
                return;
            }
        }

        self.transition(RolloutState::Stabilizing, None);
        match self.stabilize().await {
            Ok(()) => {
                self.retire_previous().await;
                self.report.placement = self.placement.clone();
                self.report.ready_replicas = ready(&self.serving_new);
                self.transition(RolloutState::Healthy, None);
            }
            Err(reason) => self.rollback(reason).await,
        }
    }

    /// Replicas of the previous generation currently serving
    async fn collect_previous(&mut self) {
        let Some(previous) = self.req.previous.clone() else {
            return;
        };
        let infos = match self.compute_for(&previous).replicas(&previous.placement).await {
            Ok(infos) => infos,
            Err(e) => {
                tracing::warn!(
                    service = self.report.service,
                    error = %e,
                    "Previous generation could not be described"
                );
                // Whatever is still routed for it counts as serving until restore settles it
                let mut routed: Vec<Arc<Replica>> = Vec::new();
                for target in self.targets.iter().filter_map(|name| self.ctl.fabric.target(name)) {
                    for replica in target.generation_replicas(previous.generation) {
                        if !routed.iter().any(|r| r.id == replica.id) {
                            routed.push(replica);
                        }
                    }
                }
                self.serving_old = routed;
                return;
            }
        };
        for info in infos.iter().filter(|r| r.is_running()) {
            if self.targets.is_empty() {
                self.serving_old
                    .push(Arc::new(Replica::new(&info.id, &info.address, info.generation)));
            } else if let Some(existing) = self.registered(&info.id) {
                self.serving_old.push(existing);
            }
        }
    }

    fn registered(&self, id: &str) -> Option<Arc<Replica>> {
        self.targets.iter().find_map(|name| {
            self.ctl
                .fabric
                .target(name)
                .and_then(|t| t.replicas().into_iter().find(|r| r.id == id))
        })
    }

    /// Healthy replicas behind the service's targets right now
    fn healthy_now(&self) -> u32 {
        if self.targets.is_empty() {
            return ready(&self.serving_old) + ready(&self.serving_new);
        }
        self.targets
            .iter()
            .filter_map(|name| self.ctl.fabric.target(name))
            .map(|t| t.healthy_count() as u32)
            .min()
            .unwrap_or(0)
    }

    fn sample_healthy(&mut self) {
        if self.req.previous.is_none() {
            return;
        }
        let healthy = self.healthy_now();
        self.report.min_healthy_observed = Some(
            self.report
                .min_healthy_observed
                .map_or(healthy, |m| m.min(healthy)),
        );
    }

    async fn stabilize(&mut self) -> std::result::Result<(), String> {
        let timeout = Duration::from_secs(self.rollout().stabilization_timeout_secs);
        let deadline = Instant::now() + timeout;
        let desired = self.req.plan.replicas.desired;
        let poll = self.poll_interval();
        self.sample_healthy();

        loop {
            if *self.req.abort.borrow() {
                return Err("abort signal received".to_string());
            }
            if Instant::now() >= deadline {
                return Err(format!(
                    "stabilization timer expired after {}s with {} of {} replicas ready",
                    timeout.as_secs(),
                    ready(&self.serving_new),
                    desired
                ));
            }

            self.probe_new().await;
            if let Some(rate) = self.failure_rate() {
                if rate > self.rollout().failure_rate_threshold {
                    return Err(format!(
                        "health-check failure rate {:.0}% above {:.0}%",
                        rate * 100.0,
                        self.rollout().failure_rate_threshold * 100.0
                    ));
                }
            }
            self.drain_previous();

            if ready(&self.serving_new) >= desired && self.serving_old.is_empty() {
                return Ok(());
            }

            let abort = &mut self.req.abort;
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                changed = abort.changed() => {
                    if changed.is_err() {
                        tokio::time::sleep(poll).await;
                    }
                }
            }
        }
    }

    /// Probe every running replica of the new generation once
    async fn probe_new(&mut self) {
        let Some(placement) = self.placement.clone() else {
            return;
        };
        let infos = match self.compute().replicas(&placement).await {
            Ok(infos) => infos,
            Err(e) => {
                tracing::warn!(placement = placement.id, error = %e, "Describe failed during rollout");
                return;
            }
        };
        let health = self.req.plan.health_check.clone();
        let generation = self.req.generation;

        for info in infos.iter().filter(|r| r.generation == generation) {
            match info.status {
                ReplicaStatus::Running => {}
                ReplicaStatus::Pending => continue,
                ReplicaStatus::Interrupted | ReplicaStatus::Stopped => {
                    self.forget_new(&info.id, info.status);
                    continue;
                }
            }

            let healthy = self.ctl.probe_once(info, &health).await;
            let readiness = self
                .trackers
                .entry(info.id.clone())
                .or_insert_with(|| HealthTracker::new(&health))
                .record(healthy);
            let registered = self.serving_new.iter().find(|r| r.id == info.id).cloned();
            match (readiness, registered) {
                (Readiness::Healthy, None) => self.register_new(info),
                (Readiness::Healthy, Some(replica)) => replica.set_healthy(true),
                (Readiness::Unhealthy, Some(replica)) => {
                    replica.set_healthy(false);
                    self.sample_healthy();
                }
                _ => {}
            }
        }
    }

    fn register_new(&mut self, info: &ReplicaInfo) {
        let replica = Arc::new(Replica::new(&info.id, &info.address, info.generation));
        for name in &self.targets {
            self.ctl.fabric.register_replica(name, replica.clone());
        }
        tracing::debug!(
            service = self.report.service,
            replica = info.id,
            "Replica passed readiness, now routable"
        );
        self.serving_new.push(replica.clone());
        self.journal.push(RoutingAction::Registered(replica));
        self.sample_healthy();
    }

    /// Drop a replica the platform stopped or reclaimed; not a probe failure
    fn forget_new(&mut self, id: &str, status: ReplicaStatus) {
        if self.trackers.remove(id).is_none() && !self.serving_new.iter().any(|r| r.id == id) {
            return;
        }
        self.drain_from_targets(id);
        self.serving_new.retain(|r| r.id != id);
        tracing::info!(
            service = self.report.service,
            replica = id,
            status = ?status,
            "Replica left the rollout"
        );
        self.sample_healthy();
    }

    fn failure_rate(&self) -> Option<f64> {
        let (total, failed) = self
            .trackers
            .values()
            .map(|t| t.probe_counts())
            .fold((0u32, 0u32), |(t, f), (a, b)| (t + a, f + b));
        if total == 0 || total < self.rollout().min_probe_samples {
            return None;
        }
        Some(failed as f64 / total as f64)
    }

    /// Remove old replicas one at a time while the floor allows
    fn drain_previous(&mut self) {
        let floor = self.report.min_healthy_required;
        while !self.serving_old.is_empty() && self.healthy_now() > floor {
            let replica = self.serving_old.remove(0);
            self.drain_from_targets(&replica.id);
            tracing::debug!(
                service = self.report.service,
                replica = replica.id,
                generation = replica.generation,
                "Previous replica drained"
            );
            self.journal.push(RoutingAction::Drained(replica));
            self.sample_healthy();
        }
    }

    /// Release the previous generation's compute once the new one serves.
    ///
    /// Leaving the node-pool substrate also releases the service's pool.
    async fn retire_previous(&mut self) {
        let Some(previous) = self.req.previous.clone() else {
            return;
        };
        let compute = self.compute_for(&previous);
        if let Err(e) = compute.drain(&previous.placement).await {
            tracing::warn!(
                placement = previous.placement.id,
                error = %e,
                "Previous generation could not be drained"
            );
            return;
        }
        if previous.plan.substrate == SubstrateKind::NodePool
            && self.req.plan.substrate != SubstrateKind::NodePool
        {
            if let Err(e) = compute.release_capacity(&previous.plan.service).await {
                tracing::warn!(
                    service = self.report.service,
                    error = %e,
                    "Capacity pool of the previous substrate could not be released"
                );
            }
        }
    }

    async fn rollback(&mut self, reason: String) {
        tracing::warn!(
            service = self.report.service,
            generation = self.report.generation,
            reason = reason,
            "Rolling back"
        );
        self.report.rollback_reason = Some(reason.clone());
        self.transition(RolloutState::RollingBack, Some(reason));

        while let Some(action) = self.journal.pop() {
            match action {
                RoutingAction::Registered(replica) => {
                    self.drain_from_targets(&replica.id);
                    self.serving_new.retain(|r| r.id != replica.id);
                }
                RoutingAction::Drained(replica) => {
                    for name in &self.targets {
                        self.ctl.fabric.register_replica(name, replica.clone());
                    }
                    self.serving_old.push(replica);
                }
            }
        }
        if let Some(placement) = self.placement.take() {
            if let Err(e) = self.compute().drain(&placement).await {
                tracing::warn!(placement = placement.id, error = %e, "New generation could not be drained");
            }
        }

        let Some(previous) = self.req.previous.clone() else {
            self.transition(
                RolloutState::RolledBack,
                Some("no previous generation to restore".to_string()),
            );
            return;
        };

        let attempts = self.rollout().max_rollback_attempts.max(1);
        for attempt in 1..=attempts {
            self.report.rollback_attempts = attempt;
            match self.restore(&previous).await {
                Ok(placement) => {
                    self.report.placement = Some(placement);
                    self.report.ready_replicas = ready(&self.serving_old);
                    self.transition(RolloutState::RolledBack, None);
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        service = self.report.service,
                        generation = previous.generation,
                        attempt = attempt,
                        error = %e,
                        "Restoring previous generation failed"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.poll_interval()).await;
                    }
                }
            }
        }
        self.transition(
            RolloutState::Failed,
            Some(format!(
                "previous generation {} could not be restored after {} attempts",
                previous.generation, attempts
            )),
        );
    }

    /// Bring the previous generation back to its replica count.
    ///
    /// A placement created by a failed attempt is drained before returning.
    async fn restore(&mut self, previous: &Generation) -> Result<PlacementRef> {
        let compute = self.compute_for(previous);
        let running = compute
            .replicas(&previous.placement)
            .await
            .ok()
            .map(|infos| infos.iter().filter(|r| r.is_running()).count() as u32);

        let (placement, created) = match running {
            Some(n) if n >= previous.replicas => (previous.placement.clone(), false),
            Some(_) if compute.scale(&previous.placement, previous.replicas).await.is_ok() => {
                (previous.placement.clone(), false)
            }
            _ => {
                tracing::info!(
                    service = self.report.service,
                    generation = previous.generation,
                    substrate = %previous.plan.substrate,
                    "Re-provisioning previous generation"
                );
                let placement = compute
                    .provision(
                        &previous.plan,
                        previous.generation,
                        previous.replicas,
                        &self.req.security,
                    )
                    .await?
                    .placement;
                (placement, true)
            }
        };

        let serving_before: HashSet<String> = self.serving_old.iter().map(|r| r.id.clone()).collect();
        if let Err(e) = self.await_previous(&placement, previous).await {
            if created {
                let joined: Vec<Arc<Replica>> = self
                    .serving_old
                    .iter()
                    .filter(|r| !serving_before.contains(&r.id))
                    .cloned()
                    .collect();
                for replica in joined {
                    self.drain_from_targets(&replica.id);
                    self.serving_old.retain(|r| r.id != replica.id);
                }
                if let Err(drain) = compute.drain(&placement).await {
                    tracing::warn!(placement = placement.id, error = %drain, "Failed restore attempt could not be drained");
                }
            }
            return Err(e);
        }
        Ok(placement)
    }

    /// Wait until the previous generation's replicas are ready and routable
    async fn await_previous(&mut self, placement: &PlacementRef, previous: &Generation) -> Result<()> {
        let health = previous.plan.health_check.clone();
        let deadline = Instant::now() + Duration::from_secs(self.rollout().stabilization_timeout_secs);
        let mut trackers: HashMap<String, HealthTracker> = HashMap::new();

        loop {
            let running: Vec<ReplicaInfo> = self
                .compute_for(previous)
                .replicas(placement)
                .await?
                .into_iter()
                .filter(|r| r.is_running())
                .collect();

            let gone: Vec<Arc<Replica>> = self
                .serving_old
                .iter()
                .filter(|r| !running.iter().any(|i| i.id == r.id))
                .cloned()
                .collect();
            for replica in gone {
                self.drain_from_targets(&replica.id);
                self.serving_old.retain(|r| r.id != replica.id);
            }

            for info in &running {
                if self.serving_old.iter().any(|r| r.id == info.id) {
                    continue;
                }
                let healthy = self.ctl.probe_once(info, &health).await;
                let readiness = trackers
                    .entry(info.id.clone())
                    .or_insert_with(|| HealthTracker::new(&health))
                    .record(healthy);
                if readiness == Readiness::Healthy {
                    let replica = Arc::new(Replica::new(&info.id, &info.address, info.generation));
                    for name in &self.targets {
                        self.ctl.fabric.register_replica(name, replica.clone());
                    }
                    self.serving_old.push(replica);
                }
            }

            let restored = ready(&self.serving_old);
            if restored >= previous.replicas {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TopologyError::permanent(format!(
                    "previous generation reached {} of {} healthy replicas",
                    restored, previous.replicas
                )));
            }
            tokio::time::sleep(self.poll_interval()).await;
        }
    }
}

fn ready(replicas: &[Arc<Replica>]) -> u32 {
    replicas.iter().filter(|r| r.is_healthy()).count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::SchedulerClient;
    use crate::config::{
        ContainerSpec, EnvironmentProfile, ListenerConfig, RetryPolicy, RoutingRule, ServiceSpec,
    };
    use crate::planner::TopologyPlanner;
    use crate::platform::simulated::SimulatedPlatform;
    use crate::platform::ComputeApi;

    struct Harness {
        platform: Arc<SimulatedPlatform>,
        fabric: Arc<RoutingFabric>,
        controller: RolloutController,
        provisioners: ProvisionerSet,
        abort: watch::Sender<bool>,
    }

    impl Harness {
        fn new() -> Self {
            let platform = Arc::new(SimulatedPlatform::new());
            let metrics = Arc::new(TopologyMetrics::new());
            let fabric = Arc::new(RoutingFabric::new(ListenerConfig::default(), metrics.clone()));
            let provisioners = ProvisionerSet::from_client(SchedulerClient::new(
                platform.clone(),
                RetryPolicy::default(),
                metrics.clone(),
            ));
            let controller = RolloutController::new(fabric.clone(), platform.clone(), metrics);
            let (abort, _) = watch::channel(false);
            Self {
                platform,
                fabric,
                controller,
                provisioners,
                abort,
            }
        }

        fn plan(&self, image: &str, rollout: RolloutConfig, health: HealthCheckConfig) -> ServicePlan {
            let spec = ServiceSpec::builder("proxy")
                .container(ContainerSpec::new("proxy", image, 8000))
                .replicas(3, 1, 6)
                .route(RoutingRule::new(&["/v1/*"], 10))
                .health_check(health)
                .rollout(rollout)
                .build()
                .unwrap();
            let plan = TopologyPlanner::plan(&spec, &EnvironmentProfile::for_region("us-east-1")).unwrap();
            let route = &plan.routes[0];
            self.fabric.register_route(&route.rule, route.target.clone()).unwrap();
            plan
        }

        fn request(&self, plan: &ServicePlan, generation: u64, previous: Option<Generation>) -> RolloutRequest {
            RolloutRequest {
                plan: plan.clone(),
                generation,
                security: SecurityContext {
                    execution_identity: plan.execution_role.name.clone(),
                    workload_identity: plan.workload_role.name.clone(),
                    delegation: None,
                },
                provisioners: self.provisioners.clone(),
                previous,
                abort: self.abort.subscribe(),
            }
        }

        fn healthy(&self) -> usize {
            self.fabric.target("proxy-8000").unwrap().healthy_count()
        }

        async fn first(&self, plan: &ServicePlan) -> Generation {
            let report = self.controller.run(self.request(plan, 1, None)).await;
            assert_eq!(report.state, RolloutState::Healthy);
            Generation {
                generation: 1,
                plan: plan.clone(),
                placement: report.placement.unwrap(),
                replicas: plan.replicas.desired,
            }
        }
    }

    fn fast_rollout() -> RolloutConfig {
        RolloutConfig {
            stabilization_timeout_secs: 120,
            poll_interval_ms: 1000,
            ..RolloutConfig::default()
        }
    }

    fn health() -> HealthCheckConfig {
        HealthCheckConfig {
            grace_period_secs: 30,
            ..HealthCheckConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_rollout_reaches_healthy() {
        let h = Harness::new();
        let plan = h.plan("proxy:1", fast_rollout(), health());
        let report = h.controller.run(h.request(&plan, 1, None)).await;
        assert_eq!(
            report.states(),
            vec![
                RolloutState::Provisioning,
                RolloutState::Stabilizing,
                RolloutState::Healthy
            ]
        );
        assert_eq!(report.ready_replicas, 3);
        assert_eq!(h.healthy(), 3);
        assert!(report.ensure_healthy().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_upgrade_keeps_min_healthy() {
        let h = Harness::new();
        let v1 = h.plan("proxy:1", fast_rollout(), health());
        let previous = h.first(&v1).await;

        h.platform.set_health_latency("proxy:2", Duration::from_secs(7));
        let v2 = h.plan("proxy:2", fast_rollout(), health());
        let report = h.controller.run(h.request(&v2, 2, Some(previous.clone()))).await;

        assert_eq!(report.state, RolloutState::Healthy);
        assert_eq!(report.min_healthy_required, 3);
        assert!(report.min_healthy_observed.unwrap() >= 3);
        let target = h.fabric.target("proxy-8000").unwrap();
        assert_eq!(target.generation_replicas(2).len(), 3);
        assert!(target.generation_replicas(1).is_empty());
        // previous compute released only after the new generation served
        assert!(!h.platform.placements_for("proxy").contains(&previous.placement.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stabilization_timer_rolls_back() {
        let h = Harness::new();
        let v1 = h.plan("proxy:1", fast_rollout(), health());
        let previous = h.first(&v1).await;

        h.platform.set_health_latency("proxy:2", Duration::from_secs(3600));
        let slow = HealthCheckConfig {
            grace_period_secs: 3600,
            ..HealthCheckConfig::default()
        };
        let v2 = h.plan("proxy:2", fast_rollout(), slow);
        let report = h.controller.run(h.request(&v2, 2, Some(previous.clone()))).await;

        assert_eq!(
            report.states(),
            vec![
                RolloutState::Provisioning,
                RolloutState::Stabilizing,
                RolloutState::RollingBack,
                RolloutState::RolledBack
            ]
        );
        assert!(report.rollback_reason.as_ref().unwrap().contains("stabilization timer"));
        assert_eq!(report.placement.as_ref(), Some(&previous.placement));
        assert_eq!(h.healthy(), 3);
        assert_eq!(h.platform.running_replicas("proxy").len(), 3);
        assert!(matches!(
            report.ensure_healthy().unwrap_err(),
            TopologyError::RollbackTriggered { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_rate_rolls_back() {
        let h = Harness::new();
        let v1 = h.plan("proxy:1", fast_rollout(), health());
        let previous = h.first(&v1).await;

        h.platform.make_unhealthy("proxy:2");
        let v2 = h.plan("proxy:2", fast_rollout(), health());
        let report = h.controller.run(h.request(&v2, 2, Some(previous))).await;

        assert_eq!(report.state, RolloutState::RolledBack);
        assert!(report.rollback_reason.unwrap().contains("failure rate"));
        assert_eq!(h.healthy(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_signal_rolls_back() {
        let h = Harness::new();
        let v1 = h.plan("proxy:1", fast_rollout(), health());
        let previous = h.first(&v1).await;

        h.platform.set_health_latency("proxy:2", Duration::from_secs(3600));
        let v2 = h.plan("proxy:2", fast_rollout(), health());
        let (abort, signal) = watch::channel(false);
        let mut request = h.request(&v2, 2, Some(previous));
        request.abort = signal;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            let _ = abort.send(true);
        });
        let report = h.controller.run(request).await;

        assert_eq!(report.state, RolloutState::RolledBack);
        assert!(report.rollback_reason.unwrap().contains("abort"));
        assert_eq!(h.healthy(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrestorable_previous_fails() {
        let h = Harness::new();
        let v1 = h.plan("proxy:1", fast_rollout(), health());
        let previous = h.first(&v1).await;

        // previous placement lost and its image gone
        h.platform.delete_placement(&previous.placement.id).await.unwrap();
        h.platform.make_unresolvable("proxy:1");
        h.platform.make_unhealthy("proxy:2");

        let v2 = h.plan("proxy:2", fast_rollout(), health());
        let report = h.controller.run(h.request(&v2, 2, Some(previous))).await;
        assert_eq!(report.state, RolloutState::Failed);
        assert_eq!(report.rollback_attempts, 3);
        assert_eq!(*report.states().last().unwrap(), RolloutState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_restore_attempts_are_drained() {
        let h = Harness::new();
        let v1 = h.plan("proxy:1", fast_rollout(), health());
        let previous = h.first(&v1).await;

        // previous placement lost; its image still resolves but never passes
        h.platform.delete_placement(&previous.placement.id).await.unwrap();
        h.platform.make_unhealthy("proxy:1");
        h.platform.make_unhealthy("proxy:2");

        let v2 = h.plan("proxy:2", fast_rollout(), health());
        let report = h.controller.run(h.request(&v2, 2, Some(previous))).await;
        assert_eq!(report.state, RolloutState::Failed);
        assert_eq!(report.rollback_attempts, 3);

        assert!(h.platform.placements_for("proxy").is_empty());
        assert!(h.platform.running_replicas("proxy").is_empty());
        let target = h.fabric.target("proxy-8000").unwrap();
        assert!(target.replicas().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_rollout_failure_cleans_up() {
        let h = Harness::new();
        h.platform.make_unresolvable("proxy:1");
        let v1 = h.plan("proxy:1", fast_rollout(), health());
        let report = h.controller.run(h.request(&v1, 1, None)).await;
        assert_eq!(report.state, RolloutState::RolledBack);
        assert!(report.rollback_reason.unwrap().contains("provisioning failed"));
        assert!(h.platform.placements_for("proxy").is_empty());
    }

    #[test]
    fn test_state_display_and_terminal() {
        assert_eq!(RolloutState::RollingBack.to_string(), "rolling_back");
        assert_eq!(RolloutState::RolledBack.to_string(), "rolled_back");
        assert!(RolloutState::Failed.is_terminal());
        assert!(!RolloutState::Stabilizing.is_terminal());
        let json = serde_json::to_string(&RolloutState::RolledBack).unwrap();
        assert_eq!(json, "\"rolled_back\"");
    }
}
