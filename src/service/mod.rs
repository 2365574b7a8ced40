//! Service layer — routable target groups, affinity, and health tracking
//!
//! A target group is the set of replicas a routing rule forwards to. Only
//! replicas that passed their readiness threshold are ever registered.

pub mod health_check;
pub mod membership;
pub mod sticky;

pub use health_check::{HealthTracker, HttpHealthProbe};
pub use membership::{MembershipChanges, MembershipReconciler, MembershipTarget};
pub use sticky::AffinityTable;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// A replica registered in a target group
#[derive(Debug)]
pub struct Replica {
    /// Platform replica id
    pub id: String,
    /// `host:port` the replica listens on
    pub address: String,
    /// Service generation the replica belongs to
    pub generation: u64,
    healthy: AtomicBool,
    active_connections: AtomicUsize,
}

impl Replica {
    pub fn new(id: impl Into<String>, address: impl Into<String>, generation: u64) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            generation,
            healthy: AtomicBool::new(true),
            active_connections: AtomicUsize::new(0),
        }
    }

    /// Check if this replica is healthy
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Set the health status
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    /// Increment active connections
    pub fn inc_connections(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active connections
    pub fn dec_connections(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Get active connection count
    pub fn connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }
}

/// Target group — the replicas behind one routing target
#[derive(Debug)]
pub struct TargetGroup {
    /// Target name (e.g., "proxy-8000")
    pub name: String,
    /// Container port replicas receive traffic on
    pub port: u16,
    /// Services bound to this target
    owners: RwLock<BTreeSet<String>>,
    replicas: RwLock<Vec<Arc<Replica>>>,
}

impl TargetGroup {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            owners: RwLock::new(BTreeSet::new()),
            replicas: RwLock::new(Vec::new()),
        }
    }

    /// Register a replica; re-registering the same id is a no-op
    pub fn register(&self, replica: Arc<Replica>) -> bool {
        let mut replicas = self.replicas.write().unwrap_or_else(PoisonError::into_inner);
        if replicas.iter().any(|r| r.id == replica.id) {
            return false;
        }
        replicas.push(replica);
        true
    }

    /// Deregister a replica by id
    pub fn deregister(&self, replica_id: &str) -> Option<Arc<Replica>> {
        let mut replicas = self.replicas.write().unwrap_or_else(PoisonError::into_inner);
        let index = replicas.iter().position(|r| r.id == replica_id)?;
        Some(replicas.remove(index))
    }

    /// All registered replicas
    pub fn replicas(&self) -> Vec<Arc<Replica>> {
        self.replicas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Registered replicas currently healthy
    pub fn healthy_replicas(&self) -> Vec<Arc<Replica>> {
        self.replicas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.is_healthy())
            .cloned()
            .collect()
    }

    pub fn healthy_count(&self) -> usize {
        self.replicas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.is_healthy())
            .count()
    }

    /// Registered replicas of one generation
    pub fn generation_replicas(&self, generation: u64) -> Vec<Arc<Replica>> {
        self.replicas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.generation == generation)
            .cloned()
            .collect()
    }

    /// Healthy replica with the fewest active connections
    pub fn least_connections(&self) -> Option<Arc<Replica>> {
        self.replicas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.is_healthy())
            .min_by_key(|r| r.connections())
            .cloned()
    }

    pub(crate) fn add_owner(&self, service: &str) {
        self.owners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(service.to_string());
    }

    /// Remove an owner; returns whether no owners remain
    pub(crate) fn remove_owner(&self, service: &str) -> bool {
        let mut owners = self.owners.write().unwrap_or_else(PoisonError::into_inner);
        owners.remove(service);
        owners.is_empty()
    }

    /// Services bound to this target
    pub fn owners(&self) -> BTreeSet<String> {
        self.owners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_owned_by(&self, service: &str) -> bool {
        self.owners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(service)
    }
}
