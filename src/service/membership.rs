//! Membership reconciliation — keeps target groups in step with a placement
//!
//! Once a rollout settles, replicas still come and go: the autoscaler moves
//! the count, spot capacity is reclaimed, the platform replaces lost tasks.
//! Each pass describes the serving placement, drains every replica that
//! stopped running, and registers running ones after `healthy_threshold`
//! consecutive passing probes. Registered replicas keep being probed and
//! flip healthy/unhealthy on the configured thresholds.

use crate::compute::{ComputeProvisioner, PlacementRef};
use crate::config::HealthCheckConfig;
use crate::error::Result;
use crate::platform::HealthProbe;
use crate::router::RoutingFabric;
use crate::service::health_check::{probe_with_deadline, Readiness};
use crate::service::{HealthTracker, Replica, TargetGroup};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// The serving placement of one service and the targets it feeds
#[derive(Clone)]
pub struct MembershipTarget {
    pub service: String,
    pub generation: u64,
    pub placement: PlacementRef,
    pub provisioner: Arc<dyn ComputeProvisioner>,
    /// Target group names
    pub targets: Vec<String>,
    pub health: HealthCheckConfig,
}

/// Routing changes made by one pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MembershipChanges {
    pub registered: Vec<String>,
    pub drained: Vec<String>,
}

impl MembershipChanges {
    pub fn is_empty(&self) -> bool {
        self.registered.is_empty() && self.drained.is_empty()
    }
}

#[derive(Default)]
struct Tracking {
    trackers: HashMap<String, HealthTracker>,
    /// Every replica id the placement has reported
    seen: HashSet<String>,
    detached: bool,
}

struct Attachment {
    target: MembershipTarget,
    tracking: Mutex<Tracking>,
}

struct Running {
    attachment: Arc<Attachment>,
    handle: JoinHandle<()>,
}

/// Per-service reconciliation loops between placements and target groups
pub struct MembershipReconciler {
    fabric: Arc<RoutingFabric>,
    probe: Arc<dyn HealthProbe>,
    services: std::sync::Mutex<HashMap<String, Running>>,
}

impl MembershipReconciler {
    pub fn new(fabric: Arc<RoutingFabric>, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            fabric,
            probe,
            services: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Start reconciling a service every health-check interval, replacing
    /// any previous attachment
    pub async fn attach(self: &Arc<Self>, target: MembershipTarget) {
        self.detach(&target.service).await;

        let service = target.service.clone();
        let generation = target.generation;
        let placement = target.placement.id.clone();
        let period = Duration::from_secs(target.health.interval_secs.max(1));
        let attachment = Arc::new(Attachment {
            target,
            tracking: Mutex::new(Tracking::default()),
        });

        let handle = {
            let reconciler = Arc::downgrade(self);
            let attachment = Arc::clone(&attachment);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let Some(reconciler) = reconciler.upgrade() else {
                        break;
                    };
                    if let Err(e) = reconciler.pass(&attachment).await {
                        tracing::warn!(
                            service = attachment.target.service,
                            error = %e,
                            "Membership reconciliation failed"
                        );
                    }
                }
            })
        };

        tracing::info!(
            service = service,
            generation = generation,
            placement = placement,
            "Membership reconciliation attached"
        );
        self.services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(service, Running { attachment, handle });
    }

    /// Stop reconciling a service; `false` when it was not attached
    pub async fn detach(&self, service: &str) -> bool {
        let running = self
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(service);
        let Some(running) = running else {
            return false;
        };
        // Waits out an in-flight pass
        running.attachment.tracking.lock().await.detached = true;
        running.handle.abort();
        tracing::debug!(service = service, "Membership reconciliation detached");
        true
    }

    pub fn is_attached(&self, service: &str) -> bool {
        self.services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(service)
    }

    /// Run one pass now; `None` when the service is not attached
    pub async fn reconcile(&self, service: &str) -> Result<Option<MembershipChanges>> {
        let attachment = self
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .map(|r| Arc::clone(&r.attachment));
        match attachment {
            Some(attachment) => self.pass(&attachment).await.map(Some),
            None => Ok(None),
        }
    }

    async fn pass(&self, attachment: &Attachment) -> Result<MembershipChanges> {
        let mut tracking = attachment.tracking.lock().await;
        let mut changes = MembershipChanges::default();
        if tracking.detached {
            return Ok(changes);
        }
        let target = &attachment.target;
        let infos = target.provisioner.replicas(&target.placement).await?;
        let groups: Vec<Arc<TargetGroup>> = target
            .targets
            .iter()
            .filter_map(|name| self.fabric.target(name))
            .collect();
        if groups.is_empty() {
            return Ok(changes);
        }

        tracking.seen.extend(infos.iter().map(|r| r.id.clone()));
        let running: HashSet<&str> = infos
            .iter()
            .filter(|r| r.is_running())
            .map(|r| r.id.as_str())
            .collect();

        for group in &groups {
            for replica in group.replicas() {
                if !tracking.seen.contains(&replica.id) || running.contains(replica.id.as_str()) {
                    continue;
                }
                self.fabric.drain_replica(&group.name, &replica.id);
                if !changes.drained.contains(&replica.id) {
                    tracing::info!(
                        service = target.service,
                        replica = replica.id,
                        "Replica stopped running, drained from its targets"
                    );
                    changes.drained.push(replica.id.clone());
                }
            }
        }
        tracking.trackers.retain(|id, _| running.contains(id.as_str()));

        for info in infos.iter().filter(|r| r.is_running()) {
            let healthy = probe_with_deadline(self.probe.as_ref(), info, &target.health).await;
            let readiness = tracking
                .trackers
                .entry(info.id.clone())
                .or_insert_with(|| HealthTracker::new(&target.health))
                .record(healthy);
            let registered = groups
                .iter()
                .find_map(|g| g.replicas().into_iter().find(|r| r.id == info.id));

            match (readiness, registered) {
                (Readiness::Healthy, None) => {
                    let replica = Arc::new(Replica::new(&info.id, &info.address, info.generation));
                    for group in &groups {
                        group.register(replica.clone());
                    }
                    tracing::info!(
                        service = target.service,
                        replica = info.id,
                        "Replica passed readiness, now routable"
                    );
                    changes.registered.push(info.id.clone());
                }
                (Readiness::Healthy, Some(replica)) if !replica.is_healthy() => {
                    replica.set_healthy(true);
                    tracing::info!(service = target.service, replica = info.id, "Replica marked healthy");
                }
                (Readiness::Unhealthy, Some(replica)) if replica.is_healthy() => {
                    replica.set_healthy(false);
                    tracing::warn!(service = target.service, replica = info.id, "Replica marked unhealthy");
                }
                _ => {}
            }
        }
        Ok(changes)
    }
}

impl Drop for MembershipReconciler {
    fn drop(&mut self) {
        let services = self
            .services
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for running in services.values() {
            running.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{SchedulerClient, ServerlessProvisioner};
    use crate::config::{ContainerSpec, EnvironmentProfile, ListenerConfig, RetryPolicy, RoutingRule, ServiceSpec};
    use crate::observability::TopologyMetrics;
    use crate::planner::TopologyPlanner;
    use crate::platform::simulated::SimulatedPlatform;
    use crate::security::SecurityContext;

    struct Fixture {
        platform: Arc<SimulatedPlatform>,
        fabric: Arc<RoutingFabric>,
        reconciler: Arc<MembershipReconciler>,
        target: MembershipTarget,
    }

    async fn fixture(replicas: u32) -> Fixture {
        let platform = Arc::new(SimulatedPlatform::new());
        let metrics = Arc::new(TopologyMetrics::new());
        let fabric = Arc::new(RoutingFabric::new(ListenerConfig::default(), metrics.clone()));
        let spec = ServiceSpec::builder("proxy")
            .container(ContainerSpec::new("proxy", "proxy:1", 8000))
            .replicas(replicas, 1, 6)
            .route(RoutingRule::new(&["/v1/*"], 10))
            .health_check(HealthCheckConfig {
                interval_secs: 10,
                grace_period_secs: 0,
                ..HealthCheckConfig::default()
            })
            .build()
            .unwrap();
        let plan = TopologyPlanner::plan(&spec, &EnvironmentProfile::for_region("us-east-1")).unwrap();
        let route = &plan.routes[0];
        fabric.register_route(&route.rule, route.target.clone()).unwrap();

        let provisioner: Arc<dyn ComputeProvisioner> = Arc::new(ServerlessProvisioner::new(
            SchedulerClient::new(platform.clone(), RetryPolicy::default(), metrics),
        ));
        let security = SecurityContext {
            execution_identity: plan.execution_role.name.clone(),
            workload_identity: plan.workload_role.name.clone(),
            delegation: None,
        };
        let placement = provisioner
            .provision(&plan, 1, replicas, &security)
            .await
            .unwrap()
            .placement;
        let reconciler = Arc::new(MembershipReconciler::new(fabric.clone(), platform.clone()));
        let target = MembershipTarget {
            service: "proxy".into(),
            generation: 1,
            placement,
            provisioner,
            targets: plan.target_names(),
            health: plan.health_check.clone(),
        };
        Fixture {
            platform,
            fabric,
            reconciler,
            target,
        }
    }

    fn routed(fabric: &RoutingFabric) -> Vec<String> {
        let mut ids: Vec<String> = fabric
            .target("proxy-8000")
            .unwrap()
            .replicas()
            .iter()
            .map(|r| r.id.clone())
            .collect();
        ids.sort();
        ids
    }

    #[tokio::test(start_paused = true)]
    async fn test_replicas_join_after_healthy_threshold() {
        let f = fixture(1).await;
        f.reconciler.attach(f.target.clone()).await;

        let first = f.reconciler.reconcile("proxy").await.unwrap().unwrap();
        assert!(first.is_empty());
        let second = f.reconciler.reconcile("proxy").await.unwrap().unwrap();
        assert_eq!(second.registered, vec!["proxy-g1-1"]);
        assert_eq!(routed(&f.fabric), vec!["proxy-g1-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scaling_moves_membership() {
        let f = fixture(1).await;
        f.reconciler.attach(f.target.clone()).await;
        f.target.provisioner.scale(&f.target.placement, 3).await.unwrap();
        f.reconciler.reconcile("proxy").await.unwrap();
        f.reconciler.reconcile("proxy").await.unwrap();
        assert_eq!(routed(&f.fabric).len(), 3);

        f.target.provisioner.scale(&f.target.placement, 1).await.unwrap();
        let changes = f.reconciler.reconcile("proxy").await.unwrap().unwrap();
        assert_eq!(changes.drained.len(), 2);
        assert_eq!(routed(&f.fabric), vec!["proxy-g1-1"]);
        assert_eq!(f.fabric.target("proxy-8000").unwrap().healthy_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_replica_is_replaced_in_targets() {
        let f = fixture(2).await;
        f.reconciler.attach(f.target.clone()).await;
        f.reconciler.reconcile("proxy").await.unwrap();
        f.reconciler.reconcile("proxy").await.unwrap();
        assert_eq!(routed(&f.fabric), vec!["proxy-g1-1", "proxy-g1-2"]);

        assert!(f.platform.interrupt("proxy-g1-1"));
        let changes = f.reconciler.reconcile("proxy").await.unwrap().unwrap();
        assert_eq!(changes.drained, vec!["proxy-g1-1"]);
        f.reconciler.reconcile("proxy").await.unwrap();
        assert_eq!(routed(&f.fabric), vec!["proxy-g1-2", "proxy-g1-3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_replicas_are_left_alone() {
        let f = fixture(1).await;
        let other = Arc::new(Replica::new("other-g4-1", "other-g4-1.internal:8000", 4));
        f.fabric.register_replica("proxy-8000", other);
        f.reconciler.attach(f.target.clone()).await;
        f.reconciler.reconcile("proxy").await.unwrap();
        f.reconciler.reconcile("proxy").await.unwrap();
        assert_eq!(routed(&f.fabric), vec!["other-g4-1", "proxy-g1-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_runs_each_interval_until_detached() {
        let f = fixture(2).await;
        f.reconciler.attach(f.target.clone()).await;
        assert!(f.reconciler.is_attached("proxy"));
        assert!(routed(&f.fabric).is_empty());

        // two 10s intervals reach the healthy threshold
        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(routed(&f.fabric).len(), 2);

        assert!(f.reconciler.detach("proxy").await);
        assert!(!f.reconciler.detach("proxy").await);
        f.target.provisioner.scale(&f.target.placement, 4).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(routed(&f.fabric).len(), 2);
        assert!(f.reconciler.reconcile("proxy").await.unwrap().is_none());
    }
}
