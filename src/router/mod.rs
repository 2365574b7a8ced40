//! Routing fabric — the shared listener's prioritized rule table
//!
//! All rule registrations go through one serialized table:
//! - priorities are unique across every service on the listener
//! - a target is owned by one service unless every binder opts into aggregation
//! - a target keeps one port for its whole life
//!
//! Priority reservation and target binding commit together under one lock,
//! so a failed registration leaves no trace. Requests are resolved by
//! ascending priority, first match wins.

pub mod rule;

pub use rule::{PathPattern, PatternSet};

use crate::config::router::{MAX_PRIORITY, MAX_STICKINESS_SECS, MIN_PRIORITY};
use crate::config::{ListenerConfig, RoutingRule};
use crate::error::{Result, TopologyError};
use crate::observability::metrics::TopologyMetrics;
use crate::service::{AffinityTable, Replica, TargetGroup};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Handle to a registered rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteHandle {
    pub id: u64,
    pub service: String,
    pub priority: u32,
    pub target: String,
}

/// Target a rule binds to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTarget {
    /// Owning service
    pub service: String,
    /// Target group name
    pub name: String,
    /// Container port the target forwards to
    pub port: u16,
    /// Allow other services to bind the same target
    pub aggregate: bool,
}

/// A route table row as exposed to operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSummary {
    pub priority: u32,
    pub service: String,
    pub patterns: String,
    pub target: String,
    pub port: u16,
    pub stickiness_secs: Option<u64>,
    pub healthy_replicas: usize,
}

/// Result of resolving a request path
#[derive(Clone)]
pub struct ResolvedRoute {
    pub service: String,
    pub priority: u32,
    pub target: Arc<TargetGroup>,
    affinity: Option<Arc<AffinityTable>>,
}

/// Result of routing one request to a replica
#[derive(Debug, Clone)]
pub struct RoutedRequest {
    pub service: String,
    pub priority: u32,
    pub replica: Arc<Replica>,
    /// Set-Cookie value when a new affinity token was minted
    pub set_cookie: Option<String>,
    /// Whether an existing affinity binding was honored
    pub affinitized: bool,
}

struct RouteEntry {
    handle: RouteHandle,
    patterns: PatternSet,
    target: Arc<TargetGroup>,
    stickiness_secs: Option<u64>,
    affinity: Option<Arc<AffinityTable>>,
}

struct TargetSlot {
    group: Arc<TargetGroup>,
    aggregate: bool,
}

#[derive(Default)]
struct RouteTable {
    /// priority → rule; iteration order is evaluation order
    entries: BTreeMap<u32, RouteEntry>,
    targets: HashMap<String, TargetSlot>,
    next_id: u64,
}

/// The shared listener and its rule table
pub struct RoutingFabric {
    listener: ListenerConfig,
    table: Mutex<RouteTable>,
    metrics: Arc<TopologyMetrics>,
}

impl RoutingFabric {
    pub fn new(listener: ListenerConfig, metrics: Arc<TopologyMetrics>) -> Self {
        Self {
            listener,
            table: Mutex::new(RouteTable::default()),
            metrics,
        }
    }

    pub fn listener(&self) -> &ListenerConfig {
        &self.listener
    }

    fn table(&self) -> MutexGuard<'_, RouteTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a rule against a target.
    ///
    /// Re-registering an identical rule for the same service returns the
    /// existing handle.
    pub fn register_route(&self, rule: &RoutingRule, target: RouteTarget) -> Result<RouteHandle> {
        let patterns = PatternSet::parse(&rule.patterns)
            .map_err(|e| TopologyError::validation(&target.service, e))?;
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&rule.priority) {
            return Err(TopologyError::validation(
                &target.service,
                format!(
                    "route priority {} must be in {}..={}",
                    rule.priority, MIN_PRIORITY, MAX_PRIORITY
                ),
            ));
        }
        if let Some(secs) = rule.stickiness_secs {
            if secs == 0 || secs > MAX_STICKINESS_SECS {
                return Err(TopologyError::validation(
                    &target.service,
                    format!("stickiness ({}s) must be in 1..={}", secs, MAX_STICKINESS_SECS),
                ));
            }
        }

        let mut table = self.table();

        if let Some(existing) = table.entries.get(&rule.priority) {
            if existing.handle.service == target.service
                && existing.handle.target == target.name
                && existing.patterns == patterns
                && existing.stickiness_secs == rule.stickiness_secs
            {
                return Ok(existing.handle.clone());
            }
            self.metrics.record_route_conflict();
            tracing::warn!(
                service = target.service,
                priority = rule.priority,
                owner = existing.handle.service,
                "Route priority already taken"
            );
            return Err(TopologyError::RoutingConflict(format!(
                "priority {} on listener '{}' is already held by service '{}'",
                rule.priority, self.listener.name, existing.handle.service
            )));
        }

        if let Some(slot) = table.targets.get(&target.name) {
            if slot.group.port != target.port {
                self.metrics.record_route_conflict();
                return Err(TopologyError::RoutingConflict(format!(
                    "target '{}' forwards to port {}, not {}",
                    target.name, slot.group.port, target.port
                )));
            }
            let foreign = !slot.group.owners().is_empty() && !slot.group.is_owned_by(&target.service);
            if foreign && !(slot.aggregate && target.aggregate) {
                self.metrics.record_route_conflict();
                return Err(TopologyError::RoutingConflict(format!(
                    "target '{}' is owned by {:?}; sharing requires aggregation on every binder",
                    target.name,
                    slot.group.owners()
                )));
            }
        }

        // Commit: nothing below can fail
        let group = match table.targets.get(&target.name) {
            Some(slot) => slot.group.clone(),
            None => {
                let group = Arc::new(TargetGroup::new(&target.name, target.port));
                table.targets.insert(
                    target.name.clone(),
                    TargetSlot {
                        group: group.clone(),
                        aggregate: target.aggregate,
                    },
                );
                group
            }
        };
        group.add_owner(&target.service);

        table.next_id += 1;
        let handle = RouteHandle {
            id: table.next_id,
            service: target.service.clone(),
            priority: rule.priority,
            target: target.name.clone(),
        };
        let affinity = rule.stickiness_secs.map(|secs| {
            Arc::new(AffinityTable::new(
                &self.listener.affinity_cookie,
                Duration::from_secs(secs),
            ))
        });
        table.entries.insert(
            rule.priority,
            RouteEntry {
                handle: handle.clone(),
                patterns,
                target: group,
                stickiness_secs: rule.stickiness_secs,
                affinity,
            },
        );

        self.metrics.record_route_registered();
        tracing::info!(
            service = handle.service,
            priority = handle.priority,
            target = handle.target,
            "Route registered"
        );
        Ok(handle)
    }

    /// Remove a rule; returns `false` when it was already gone
    pub fn deregister_route(&self, handle: &RouteHandle) -> bool {
        let mut table = self.table();
        let matches = table
            .entries
            .get(&handle.priority)
            .map(|e| e.handle.id == handle.id)
            .unwrap_or(false);
        if !matches {
            return false;
        }
        if let Some(entry) = table.entries.remove(&handle.priority) {
            release_target(&mut table, &entry);
        }
        tracing::info!(
            service = handle.service,
            priority = handle.priority,
            "Route deregistered"
        );
        true
    }

    /// Remove every rule a service holds
    pub fn deregister_service(&self, service: &str) -> Vec<RouteHandle> {
        let mut table = self.table();
        let priorities: Vec<u32> = table
            .entries
            .iter()
            .filter(|(_, e)| e.handle.service == service)
            .map(|(p, _)| *p)
            .collect();
        let mut removed = Vec::new();
        for priority in priorities {
            if let Some(entry) = table.entries.remove(&priority) {
                release_target(&mut table, &entry);
                removed.push(entry.handle);
            }
        }
        if !removed.is_empty() {
            tracing::info!(service = service, count = removed.len(), "Routes deregistered");
        }
        removed
    }

    /// First rule (by ascending priority) matching a path
    pub fn resolve(&self, path: &str) -> Option<ResolvedRoute> {
        let table = self.table();
        table
            .entries
            .values()
            .find(|e| e.patterns.matches(path))
            .map(|e| ResolvedRoute {
                service: e.handle.service.clone(),
                priority: e.handle.priority,
                target: e.target.clone(),
                affinity: e.affinity.clone(),
            })
    }

    /// Route one request: resolve the rule, then pick a replica honoring affinity
    pub fn route_request(&self, path: &str, cookie_header: Option<&str>) -> Option<RoutedRequest> {
        let resolved = self.resolve(path)?;
        match &resolved.affinity {
            Some(affinity) => {
                let token = cookie_header.and_then(|c| affinity.extract_token(c));
                let selection = affinity.select(token, &resolved.target)?;
                Some(RoutedRequest {
                    service: resolved.service,
                    priority: resolved.priority,
                    set_cookie: selection
                        .issued_token
                        .as_deref()
                        .map(|t| affinity.build_cookie(t)),
                    affinitized: selection.affinitized,
                    replica: selection.replica,
                })
            }
            None => Some(RoutedRequest {
                replica: resolved.target.least_connections()?,
                service: resolved.service,
                priority: resolved.priority,
                set_cookie: None,
                affinitized: false,
            }),
        }
    }

    /// Target group by name
    pub fn target(&self, name: &str) -> Option<Arc<TargetGroup>> {
        self.table().targets.get(name).map(|s| s.group.clone())
    }

    /// Add a ready replica to a target
    pub fn register_replica(&self, target: &str, replica: Arc<Replica>) -> bool {
        match self.target(target) {
            Some(group) => group.register(replica),
            None => false,
        }
    }

    /// Remove a replica from a target and forget its affinity bindings
    pub fn drain_replica(&self, target: &str, replica_id: &str) -> bool {
        let table = self.table();
        let Some(slot) = table.targets.get(target) else {
            return false;
        };
        let removed = slot.group.deregister(replica_id).is_some();
        for entry in table.entries.values() {
            if entry.handle.target == target {
                if let Some(affinity) = &entry.affinity {
                    affinity.remove_replica(replica_id);
                }
            }
        }
        removed
    }

    /// Handles held by a service, in priority order
    pub fn routes_for(&self, service: &str) -> Vec<RouteHandle> {
        self.table()
            .entries
            .values()
            .filter(|e| e.handle.service == service)
            .map(|e| e.handle.clone())
            .collect()
    }

    /// Every rule in evaluation order
    pub fn summaries(&self) -> Vec<RouteSummary> {
        self.table()
            .entries
            .values()
            .map(|e| RouteSummary {
                priority: e.handle.priority,
                service: e.handle.service.clone(),
                patterns: e.patterns.to_string(),
                target: e.handle.target.clone(),
                port: e.target.port,
                stickiness_secs: e.stickiness_secs,
                healthy_replicas: e.target.healthy_count(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.table().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().entries.is_empty()
    }
}

/// Drop the entry's claim on its target; forget the target once unreferenced
fn release_target(table: &mut RouteTable, entry: &RouteEntry) {
    let service = &entry.handle.service;
    let still_bound = table
        .entries
        .values()
        .any(|e| e.handle.target == entry.handle.target && e.handle.service == *service);
    if !still_bound {
        entry.target.remove_owner(service);
    }
    let referenced = table
        .entries
        .values()
        .any(|e| e.handle.target == entry.handle.target);
    if !referenced {
        table.targets.remove(&entry.handle.target);
    }
}
