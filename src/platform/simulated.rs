//! Simulated platform — in-memory control plane with fault injection
//!
//! Backs `apply --simulate` and every test. Replicas start immediately when
//! capacity allows; health, capacity, interruption, and failure behavior is
//! driven by the injection methods below. Each mutating call is appended to
//! an operation journal.

use super::{
    CapacityPoolRequest, ComputeApi, Credentials, HealthProbe, IdentityApi, LaunchTarget,
    MetricsSource, PlacementRequest, ReplicaInfo, ReplicaStatus, Role, TaskDefinition, TrustBroker,
};
use crate::config::{CrossAccountDelegation, HealthCheckConfig, ScalingPolicyKind};
use crate::error::{Result, TopologyError};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Tasks one node of a pool can host
const SLOTS_PER_NODE: u32 = 4;

struct SimReplica {
    info: ReplicaInfo,
    started_at: Option<Instant>,
    /// `None` = never passes health checks
    healthy_after: Option<Duration>,
}

struct Placement {
    service: String,
    generation: u64,
    pool: Option<String>,
    port: u16,
    images: Vec<String>,
    desired: u32,
    replicas: Vec<SimReplica>,
}

impl Placement {
    fn active(&self) -> usize {
        self.replicas
            .iter()
            .filter(|r| matches!(r.info.status, ReplicaStatus::Pending | ReplicaStatus::Running))
            .count()
    }
}

struct Pool {
    request: CapacityPoolRequest,
    target_capacity_percent: Option<u32>,
    slots: u32,
}

#[derive(Default)]
struct Faults {
    unresolvable_images: HashSet<String>,
    unhealthy_images: HashSet<String>,
    image_latency: HashMap<String, Duration>,
    latency_queue: VecDeque<Duration>,
    transient_place_failures: u32,
    transient_role_failures: u32,
    place_delay: Option<Duration>,
    denied_roles: HashSet<String>,
    pool_slots: HashMap<String, u32>,
}

#[derive(Default)]
struct State {
    task_definitions: BTreeMap<String, TaskDefinition>,
    revisions: HashMap<String, u64>,
    placements: BTreeMap<String, Placement>,
    next_placement: u64,
    /// Replica ids stay unique per generation across re-placements
    replica_counters: HashMap<(String, u64), u32>,
    pools: BTreeMap<String, Pool>,
    roles: BTreeMap<String, Role>,
    metrics: HashMap<(String, ScalingPolicyKind), f64>,
    host_paths: BTreeSet<String>,
    assume_calls: u32,
    journal: Vec<String>,
    faults: Faults,
}

/// In-memory implementation of every platform trait
pub struct SimulatedPlatform {
    state: Mutex<State>,
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPlatform {
    /// A platform whose pools expose the local container-runtime socket
    pub fn new() -> Self {
        let mut state = State::default();
        state.host_paths.insert("/var/run/docker.sock".to_string());
        Self {
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Fault injection ---

    /// Placements referencing this image fail permanently
    pub fn make_unresolvable(&self, image: &str) {
        self.state().faults.unresolvable_images.insert(image.to_string());
    }

    /// Replicas running this image never pass health checks
    pub fn make_unhealthy(&self, image: &str) {
        self.state().faults.unhealthy_images.insert(image.to_string());
    }

    /// Replicas of this image pass health checks only after running this long
    pub fn set_health_latency(&self, image: &str, latency: Duration) {
        self.state()
            .faults
            .image_latency
            .insert(image.to_string(), latency);
    }

    /// Latencies handed out to the next replicas in start order
    pub fn queue_health_latencies(&self, latencies: impl IntoIterator<Item = Duration>) {
        self.state().faults.latency_queue.extend(latencies);
    }

    /// The next `count` placement calls fail with a retryable error
    pub fn fail_next_placements(&self, count: u32) {
        self.state().faults.transient_place_failures = count;
    }

    /// The next `count` role writes fail with a retryable error
    pub fn fail_next_role_writes(&self, count: u32) {
        self.state().faults.transient_role_failures = count;
    }

    /// Every placement call takes this long before answering
    pub fn set_place_delay(&self, delay: Duration) {
        self.state().faults.place_delay = Some(delay);
    }

    /// Pool nodes stop exposing this host path
    pub fn hide_host_path(&self, path: &str) {
        self.state().host_paths.remove(path);
    }

    /// Pool nodes expose this host path
    pub fn expose_host_path(&self, path: &str) {
        self.state().host_paths.insert(path.to_string());
    }

    /// Delegation to this role is refused by the trust broker
    pub fn deny_role(&self, role_ref: &str) {
        self.state().faults.denied_roles.insert(role_ref.to_string());
    }

    /// Override the task slots a pool can host
    pub fn set_pool_slots(&self, pool: &str, slots: u32) {
        let mut state = self.state();
        state.faults.pool_slots.insert(pool.to_string(), slots);
        if let Some(existing) = state.pools.get_mut(pool) {
            existing.slots = slots;
        }
        reconcile_pool(&mut state, pool);
    }

    /// Reclaim an interruptible replica; the platform schedules a replacement
    pub fn interrupt(&self, replica_id: &str) -> bool {
        let mut state = self.state();
        let mut hit = None;
        for (placement_ref, placement) in state.placements.iter_mut() {
            if let Some(replica) = placement
                .replicas
                .iter_mut()
                .find(|r| r.info.id == replica_id && r.info.status == ReplicaStatus::Running)
            {
                replica.info.status = ReplicaStatus::Interrupted;
                hit = Some(placement_ref.clone());
                break;
            }
        }
        match hit {
            Some(placement_ref) => {
                state.journal.push(format!("interrupt {}", replica_id));
                reconcile(&mut state, &placement_ref);
                true
            }
            None => false,
        }
    }

    /// Set the observed value for a service metric
    pub fn set_metric(&self, service: &str, kind: ScalingPolicyKind, value: f64) {
        self.state()
            .metrics
            .insert((service.to_string(), kind), value);
    }

    // --- Inspection ---

    /// Mutating operations in call order
    pub fn journal(&self) -> Vec<String> {
        self.state().journal.clone()
    }

    /// Roles currently stored
    pub fn roles(&self) -> Vec<Role> {
        self.state().roles.values().cloned().collect()
    }

    /// Capacity pools currently present
    pub fn pools(&self) -> Vec<String> {
        self.state().pools.keys().cloned().collect()
    }

    /// Capacity pool request and attached provider target, if present
    pub fn pool(&self, name: &str) -> Option<(CapacityPoolRequest, Option<u32>)> {
        self.state()
            .pools
            .get(name)
            .map(|p| (p.request.clone(), p.target_capacity_percent))
    }

    /// Placement references for a service
    pub fn placements_for(&self, service: &str) -> Vec<String> {
        self.state()
            .placements
            .iter()
            .filter(|(_, p)| p.service == service)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Latest registered task definition for a family
    pub fn task_definition(&self, family: &str) -> Option<TaskDefinition> {
        let state = self.state();
        let revision = state.revisions.get(family)?;
        state
            .task_definitions
            .get(&format!("{}:{}", family, revision))
            .cloned()
    }

    /// Running replicas of a service across all its placements
    pub fn running_replicas(&self, service: &str) -> Vec<ReplicaInfo> {
        self.state()
            .placements
            .values()
            .filter(|p| p.service == service)
            .flat_map(|p| p.replicas.iter())
            .filter(|r| r.info.is_running())
            .map(|r| r.info.clone())
            .collect()
    }

    /// Trust broker calls so far
    pub fn assume_role_calls(&self) -> u32 {
        self.state().assume_calls
    }
}

fn pool_usage(state: &State, pool: &str) -> u32 {
    state
        .placements
        .values()
        .filter(|p| p.pool.as_deref() == Some(pool))
        .flat_map(|p| p.replicas.iter())
        .filter(|r| r.info.is_running())
        .count() as u32
}

fn has_capacity(state: &State, pool: Option<&str>) -> bool {
    match pool {
        None => true,
        Some(name) => match state.pools.get(name) {
            Some(p) => pool_usage(state, name) < p.slots,
            None => false,
        },
    }
}

/// Start or stop replicas until the placement matches its desired count
fn reconcile(state: &mut State, placement_ref: &str) {
    let Some(placement) = state.placements.get(placement_ref) else {
        return;
    };
    let desired = placement.desired as usize;
    let active = placement.active();
    let pool = placement.pool.clone();

    if active > desired {
        if let Some(placement) = state.placements.get_mut(placement_ref) {
            let mut excess = active - desired;
            for replica in placement.replicas.iter_mut().rev() {
                if excess == 0 {
                    break;
                }
                if matches!(replica.info.status, ReplicaStatus::Pending | ReplicaStatus::Running) {
                    replica.info.status = ReplicaStatus::Stopped;
                    excess -= 1;
                }
            }
        }
    }

    for _ in active..desired {
        let running = has_capacity(state, pool.as_deref());
        let latency = state.faults.latency_queue.pop_front();
        let Some(placement) = state.placements.get(placement_ref) else {
            return;
        };
        let unhealthy = placement
            .images
            .iter()
            .any(|i| state.faults.unhealthy_images.contains(i));
        let image_latency = placement
            .images
            .iter()
            .filter_map(|i| state.faults.image_latency.get(i))
            .max()
            .copied();
        let healthy_after = if unhealthy {
            None
        } else {
            Some(latency.or(image_latency).unwrap_or(Duration::ZERO))
        };

        let counter = state
            .replica_counters
            .entry((placement.service.clone(), placement.generation))
            .or_insert(0);
        *counter += 1;
        let index = *counter;
        if let Some(placement) = state.placements.get_mut(placement_ref) {
            let id = format!("{}-g{}-{}", placement.service, placement.generation, index);
            placement.replicas.push(SimReplica {
                info: ReplicaInfo {
                    address: format!("{}.internal:{}", id, placement.port),
                    id,
                    generation: placement.generation,
                    status: if running {
                        ReplicaStatus::Running
                    } else {
                        ReplicaStatus::Pending
                    },
                },
                started_at: running.then(Instant::now),
                healthy_after,
            });
        }
    }

    if let Some(pool) = pool {
        reconcile_pool(state, &pool);
    }
}

/// Promote pending replicas of a pool while slots are free
fn reconcile_pool(state: &mut State, pool: &str) {
    loop {
        if !has_capacity(state, Some(pool)) {
            return;
        }
        let pending = state
            .placements
            .iter()
            .filter(|(_, p)| p.pool.as_deref() == Some(pool))
            .find_map(|(k, p)| {
                p.replicas
                    .iter()
                    .position(|r| r.info.status == ReplicaStatus::Pending)
                    .map(|i| (k.clone(), i))
            });
        let Some((placement_ref, index)) = pending else {
            return;
        };
        if let Some(placement) = state.placements.get_mut(&placement_ref) {
            let replica = &mut placement.replicas[index];
            replica.info.status = ReplicaStatus::Running;
            replica.started_at = Some(Instant::now());
        }
    }
}

#[async_trait]
impl ComputeApi for SimulatedPlatform {
    async fn register_task_definition(&self, definition: &TaskDefinition) -> Result<String> {
        let mut state = self.state();
        let revision = state
            .revisions
            .entry(definition.family.clone())
            .and_modify(|r| *r += 1)
            .or_insert(1);
        let reference = format!("{}:{}", definition.family, revision);
        state
            .task_definitions
            .insert(reference.clone(), definition.clone());
        state
            .journal
            .push(format!("register_task_definition {}", reference));
        Ok(reference)
    }

    async fn ensure_capacity_pool(&self, request: &CapacityPoolRequest) -> Result<String> {
        let mut state = self.state();
        if state.pools.contains_key(&request.name) {
            return Ok(request.name.clone());
        }
        let slots = state
            .faults
            .pool_slots
            .get(&request.name)
            .copied()
            .unwrap_or(request.max_nodes * SLOTS_PER_NODE);
        state.pools.insert(
            request.name.clone(),
            Pool {
                request: request.clone(),
                target_capacity_percent: None,
                slots,
            },
        );
        state
            .journal
            .push(format!("ensure_capacity_pool {}", request.name));
        Ok(request.name.clone())
    }

    async fn attach_capacity_provider(&self, pool: &str, target_capacity_percent: u32) -> Result<()> {
        let mut state = self.state();
        let Some(existing) = state.pools.get_mut(pool) else {
            return Err(TopologyError::permanent(format!(
                "capacity pool '{}' does not exist",
                pool
            )));
        };
        existing.target_capacity_percent = Some(target_capacity_percent);
        state
            .journal
            .push(format!("attach_capacity_provider {}", pool));
        Ok(())
    }

    async fn host_capabilities(&self, pool: &str) -> Result<BTreeSet<String>> {
        let state = self.state();
        if !state.pools.contains_key(pool) {
            return Err(TopologyError::permanent(format!(
                "capacity pool '{}' does not exist",
                pool
            )));
        }
        Ok(state.host_paths.clone())
    }

    async fn place(&self, request: &PlacementRequest) -> Result<String> {
        let delay = self.state().faults.place_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.faults.transient_place_failures > 0 {
            state.faults.transient_place_failures -= 1;
            return Err(TopologyError::transient(format!(
                "placement of '{}' throttled",
                request.service
            )));
        }

        let Some(definition) = state.task_definitions.get(&request.task_definition) else {
            return Err(TopologyError::permanent(format!(
                "task definition '{}' is not registered",
                request.task_definition
            )));
        };
        let images: Vec<String> = definition.images().map(str::to_string).collect();
        let port = definition.containers.first().map(|c| c.port).unwrap_or(0);
        if let Some(image) = images
            .iter()
            .find(|i| state.faults.unresolvable_images.contains(*i))
        {
            return Err(TopologyError::permanent(format!(
                "image '{}' cannot be resolved",
                image
            )));
        }

        let pool = match &request.launch {
            LaunchTarget::Serverless => None,
            LaunchTarget::CapacityPool { pool, .. } => {
                if !state.pools.contains_key(pool) {
                    return Err(TopologyError::permanent(format!(
                        "capacity pool '{}' does not exist",
                        pool
                    )));
                }
                Some(pool.clone())
            }
        };

        state.next_placement += 1;
        let reference = format!(
            "pl-{}-g{}-{}",
            request.service, request.generation, state.next_placement
        );
        state.placements.insert(
            reference.clone(),
            Placement {
                service: request.service.clone(),
                generation: request.generation,
                pool,
                port,
                images,
                desired: request.replicas,
                replicas: Vec::new(),
            },
        );
        state.journal.push(format!("place {}", reference));
        reconcile(&mut state, &reference);
        Ok(reference)
    }

    async fn set_replica_count(&self, placement: &str, count: u32) -> Result<()> {
        let mut state = self.state();
        let Some(existing) = state.placements.get_mut(placement) else {
            return Err(TopologyError::permanent(format!(
                "placement '{}' does not exist",
                placement
            )));
        };
        existing.desired = count;
        state
            .journal
            .push(format!("set_replica_count {} {}", placement, count));
        reconcile(&mut state, placement);
        Ok(())
    }

    async fn describe_replicas(&self, placement: &str) -> Result<Vec<ReplicaInfo>> {
        let mut state = self.state();
        let pool = match state.placements.get(placement) {
            Some(p) => p.pool.clone(),
            None => {
                return Err(TopologyError::permanent(format!(
                    "placement '{}' does not exist",
                    placement
                )))
            }
        };
        if let Some(pool) = pool {
            reconcile_pool(&mut state, &pool);
        }
        Ok(state
            .placements
            .get(placement)
            .map(|p| p.replicas.iter().map(|r| r.info.clone()).collect())
            .unwrap_or_default())
    }

    async fn stop_replica(&self, placement: &str, replica: &str) -> Result<()> {
        let mut state = self.state();
        let Some(existing) = state.placements.get_mut(placement) else {
            return Err(TopologyError::permanent(format!(
                "placement '{}' does not exist",
                placement
            )));
        };
        let Some(target) = existing
            .replicas
            .iter_mut()
            .find(|r| r.info.id == replica && r.info.status != ReplicaStatus::Stopped)
        else {
            return Ok(());
        };
        target.info.status = ReplicaStatus::Stopped;
        existing.desired = existing.desired.saturating_sub(1);
        let pool = existing.pool.clone();
        state.journal.push(format!("stop_replica {}", replica));
        if let Some(pool) = pool {
            reconcile_pool(&mut state, &pool);
        }
        Ok(())
    }

    async fn delete_placement(&self, placement: &str) -> Result<bool> {
        let mut state = self.state();
        let Some(removed) = state.placements.remove(placement) else {
            return Ok(false);
        };
        state.journal.push(format!("delete_placement {}", placement));
        if let Some(pool) = removed.pool {
            reconcile_pool(&mut state, &pool);
        }
        Ok(true)
    }

    async fn delete_capacity_pool(&self, pool: &str) -> Result<bool> {
        let mut state = self.state();
        if state.pools.remove(pool).is_none() {
            return Ok(false);
        }
        state.journal.push(format!("delete_capacity_pool {}", pool));
        Ok(true)
    }
}

#[async_trait]
impl IdentityApi for SimulatedPlatform {
    async fn put_role(&self, role: &Role) -> Result<()> {
        let mut state = self.state();
        if state.faults.transient_role_failures > 0 {
            state.faults.transient_role_failures -= 1;
            return Err(TopologyError::transient("identity service throttled"));
        }
        state.roles.insert(role.name.clone(), role.clone());
        state.journal.push(format!("put_role {}", role.name));
        Ok(())
    }

    async fn delete_role(&self, name: &str) -> Result<bool> {
        let mut state = self.state();
        if state.roles.remove(name).is_none() {
            return Ok(false);
        }
        state.journal.push(format!("delete_role {}", name));
        Ok(true)
    }
}

#[async_trait]
impl TrustBroker for SimulatedPlatform {
    async fn assume_role(
        &self,
        delegation: &CrossAccountDelegation,
        session_name: &str,
    ) -> Result<Credentials> {
        let mut state = self.state();
        if state.faults.denied_roles.contains(&delegation.role_ref) {
            return Err(TopologyError::CrossAccountAuth {
                role: delegation.role_ref.clone(),
                message: "access denied by trust policy".to_string(),
            });
        }
        state.assume_calls += 1;
        let n = state.assume_calls;
        state
            .journal
            .push(format!("assume_role {} {}", delegation.role_ref, session_name));
        Ok(Credentials {
            access_key_id: format!("ASIASIM{:06}", n),
            secret_access_key: uuid::Uuid::new_v4().to_string(),
            session_token: uuid::Uuid::new_v4().to_string(),
            expiration: chrono::Utc::now()
                + chrono::Duration::seconds(delegation.session_duration_secs as i64),
        })
    }
}

#[async_trait]
impl MetricsSource for SimulatedPlatform {
    async fn sample(&self, service: &str, kind: ScalingPolicyKind) -> Result<Option<f64>> {
        Ok(self
            .state()
            .metrics
            .get(&(service.to_string(), kind))
            .copied())
    }
}

#[async_trait]
impl HealthProbe for SimulatedPlatform {
    async fn probe(&self, replica: &ReplicaInfo, _health_check: &HealthCheckConfig) -> Result<bool> {
        let state = self.state();
        let found = state
            .placements
            .values()
            .flat_map(|p| p.replicas.iter())
            .find(|r| r.info.id == replica.id);
        let Some(sim) = found else {
            return Ok(false);
        };
        if !sim.info.is_running() {
            return Ok(false);
        }
        match (sim.started_at, sim.healthy_after) {
            (Some(started), Some(after)) => Ok(started.elapsed() >= after),
            _ => Ok(false),
        }
    }
}
