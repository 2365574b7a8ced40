//! # A3S Topology
//!
//! A control plane that plans, routes, scales, and rolls out multi-service
//! deployments behind one shared entry point.
//!
//! ## Architecture
//!
//! ```text
//! ServiceSpec → Planner → SecurityBinder → RoutingFabric → ComputeProvisioner
//!                                                ↑                 ↓
//!                                       RolloutController ← AutoscalingController
//! ```
//!
//! ## Core Features
//!
//! - **Local validation**: malformed specs never reach the control plane
//! - **Two substrates**: serverless tasks, or a node pool with host mounts and spot capacity
//! - **Shared listener**: unique rule priorities, one owner per target, session affinity
//! - **Composed autoscaling**: independent policy loops, largest recommendation wins
//! - **Bounded-risk rollouts**: readiness-gated routing, healthy-replica floor, automatic rollback
//! - **Deterministic identities**: content-derived names, cached cross-account delegation
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use a3s_topology::{Orchestrator, PlatformClients, config::TopologyConfig};
//! use a3s_topology::platform::simulated::SimulatedPlatform;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> a3s_topology::Result<()> {
//!     let config = TopologyConfig::from_file("topology.hcl").await?;
//!     let platform = Arc::new(SimulatedPlatform::new());
//!     let orchestrator = Arc::new(Orchestrator::new(config, PlatformClients::simulated(platform))?);
//!     for (service, report) in orchestrator.apply().await {
//!         println!("{}: {}", service, report?.state);
//!     }
//!     Ok(())
//! }
//! ```

pub mod compute;
pub mod config;
pub mod error;
pub mod observability;
pub mod orchestrator;
pub mod planner;
pub mod platform;
pub mod router;
pub mod scaling;
pub mod security;
pub mod service;

// Re-export main types
pub use error::{Result, TopologyError};
pub use orchestrator::{
    DecommissionReport, DecommissionStep, Orchestrator, PlatformClients, Topology,
};
pub use planner::{ServicePlan, TopologyPlanner};
pub use scaling::{RolloutReport, RolloutState};
