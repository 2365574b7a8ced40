//! Autoscaler — independent policy loops composed by maximum
//!
//! Each attached policy runs its own evaluation loop. A loop records the
//! policy's latest observation, then recomputes every policy's
//! recommendation against the replica count the evaluation period opened
//! with:
//!
//! `recommended = ceil(baseline * observed / target)` clamped to `[min, max]`
//!
//! Loops waking in the same period share that baseline, so one period's
//! decisions compose instead of compounding.
//!
//! The service moves to the largest recommendation among policies outside
//! cooldown for the direction they point in. Policies inside cooldown still
//! hold a floor at `min(recommended, current)`, so one urgent policy can
//! never be undercut by another's scale-in. Composition and execution run
//! under a per-service lock; detach takes the same lock.

use crate::config::{AutoscalingSettings, ScalingPolicy};
use crate::error::Result;
use crate::observability::TopologyMetrics;
use crate::platform::MetricsSource;
use crate::scaling::executor::{ScaleDecision, ScaleDirection, ScaleExecutor};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Replica bounds of a scaled service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleTarget {
    pub service: String,
    pub min: u32,
    pub max: u32,
}

/// One policy's latest input and cooldown stamps
#[derive(Debug, Clone)]
struct PolicyState {
    policy: ScalingPolicy,
    observed: Option<f64>,
    scale_out_until: Option<Instant>,
    scale_in_until: Option<Instant>,
}

/// A policy's view at composition time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyVote {
    pub recommended: u32,
    /// Cooldown blocks moving in the recommended direction
    pub cooling: bool,
}

/// Replica count an evaluation period opened with
#[derive(Debug, Clone, Copy)]
struct Window {
    opened: Instant,
    baseline: u32,
}

struct ServiceScaleState {
    target: ScaleTarget,
    policies: Vec<PolicyState>,
    window: Option<Window>,
    detached: bool,
}

struct Attachment {
    state: Arc<Mutex<ServiceScaleState>>,
    handles: Vec<JoinHandle<()>>,
}

/// Attaches scaling policies to services and runs their loops
pub struct AutoscalingController {
    executor: Arc<dyn ScaleExecutor>,
    source: Arc<dyn MetricsSource>,
    metrics: Arc<TopologyMetrics>,
    settings: AutoscalingSettings,
    services: std::sync::Mutex<HashMap<String, Attachment>>,
}

impl AutoscalingController {
    pub fn new(
        executor: Arc<dyn ScaleExecutor>,
        source: Arc<dyn MetricsSource>,
        metrics: Arc<TopologyMetrics>,
        settings: AutoscalingSettings,
    ) -> Self {
        Self {
            executor,
            source,
            metrics,
            settings,
            services: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Single policy recommendation, clamped to the target's bounds
    pub fn recommend(policy: &ScalingPolicy, observed: f64, current: u32, target: &ScaleTarget) -> u32 {
        let base = current.max(1) as f64;
        let raw = if policy.target > 0.0 {
            (base * observed / policy.target).ceil()
        } else {
            target.max as f64
        };
        let raw = if raw.is_finite() && raw > 0.0 { raw as u32 } else { 0 };
        raw.clamp(target.min, target.max.max(target.min))
    }

    /// Compose policy votes into a desired count.
    ///
    /// `None` when no policy outside cooldown has a recommendation.
    pub fn compose(current: u32, votes: &[PolicyVote]) -> Option<u32> {
        let voters = votes.iter().filter(|v| !v.cooling).map(|v| v.recommended).max()?;
        let floor = votes
            .iter()
            .filter(|v| v.cooling)
            .map(|v| v.recommended.min(current))
            .max()
            .unwrap_or(0);
        Some(voters.max(floor))
    }

    /// Attach policies to a service, replacing any previous attachment
    pub async fn attach(self: &Arc<Self>, target: ScaleTarget, policies: Vec<ScalingPolicy>) {
        self.detach(&target.service).await;
        if policies.is_empty() {
            return;
        }

        let service = target.service.clone();
        let state = Arc::new(Mutex::new(ServiceScaleState {
            target,
            policies: policies
                .iter()
                .map(|p| PolicyState {
                    policy: p.clone(),
                    observed: None,
                    scale_out_until: None,
                    scale_in_until: None,
                })
                .collect(),
            window: None,
            detached: false,
        }));

        let period = Duration::from_secs(self.settings.evaluation_period_secs.max(1));
        let handles = (0..policies.len())
            .map(|index| {
                let controller = Arc::downgrade(self);
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        ticker.tick().await;
                        let Some(controller) = controller.upgrade() else {
                            break;
                        };
                        if let Err(e) = controller.run_policy(&state, index).await {
                            tracing::warn!(error = %e, "Scaling evaluation failed");
                        }
                    }
                })
            })
            .collect();

        tracing::info!(service = service, policies = policies.len(), "Scaling policies attached");
        self.services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(service, Attachment { state, handles });
    }

    /// Remove every policy of a service; `false` when none were attached
    pub async fn detach(&self, service: &str) -> bool {
        let attachment = self
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(service);
        let Some(attachment) = attachment else {
            return false;
        };
        // Waits for an in-flight decision, then stops all loops together
        let mut state = attachment.state.lock().await;
        state.detached = true;
        for handle in &attachment.handles {
            handle.abort();
        }
        tracing::info!(service = service, "Scaling policies detached");
        true
    }

    pub fn is_attached(&self, service: &str) -> bool {
        self.services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(service)
    }

    /// Sample every policy of a service once and apply the composed result
    pub async fn tick(&self, service: &str) -> Result<Option<ScaleDecision>> {
        let state = self
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .map(|a| Arc::clone(&a.state));
        let Some(state) = state else {
            return Ok(None);
        };
        let mut guard = state.lock().await;
        if guard.detached {
            return Ok(None);
        }
        for index in 0..guard.policies.len() {
            let kind = guard.policies[index].policy.kind;
            if let Some(observed) = self.source.sample(service, kind).await? {
                guard.policies[index].observed = Some(observed);
            }
        }
        let live = self.executor.current_replicas(service).await?;
        guard.window = Some(Window {
            opened: Instant::now(),
            baseline: live,
        });
        self.apply(&mut guard, live, live).await
    }

    async fn run_policy(&self, state: &Mutex<ServiceScaleState>, index: usize) -> Result<()> {
        let mut guard = state.lock().await;
        if guard.detached {
            return Ok(());
        }
        let kind = guard.policies[index].policy.kind;
        let service = guard.target.service.clone();
        if let Some(observed) = self.source.sample(&service, kind).await? {
            guard.policies[index].observed = Some(observed);
        }
        let live = self.executor.current_replicas(&service).await?;
        let now = Instant::now();
        let period = Duration::from_secs(self.settings.evaluation_period_secs.max(1));
        let baseline = match guard.window {
            Some(window) if now < window.opened + period => window.baseline,
            _ => {
                guard.window = Some(Window {
                    opened: now,
                    baseline: live,
                });
                live
            }
        };
        self.apply(&mut guard, baseline, live).await.map(|_| ())
    }

    /// Recommend against `baseline`, decide against `live`
    async fn apply(
        &self,
        state: &mut ServiceScaleState,
        baseline: u32,
        live: u32,
    ) -> Result<Option<ScaleDecision>> {
        let service = state.target.service.clone();
        let now = Instant::now();

        let mut votes = Vec::new();
        let mut voter_index = Vec::new();
        for (i, p) in state.policies.iter().enumerate() {
            let Some(observed) = p.observed else {
                continue;
            };
            let recommended = Self::recommend(&p.policy, observed, baseline, &state.target);
            let until = if recommended > baseline {
                p.scale_out_until
            } else if recommended < baseline {
                p.scale_in_until
            } else {
                None
            };
            let cooling = until.is_some_and(|t| now < t);
            votes.push(PolicyVote { recommended, cooling });
            voter_index.push(i);
        }

        let Some(desired) = Self::compose(live, &votes) else {
            return Ok(None);
        };
        if desired == live {
            return Ok(None);
        }

        let direction = if desired > live {
            ScaleDirection::Up
        } else {
            ScaleDirection::Down
        };
        let reasons: Vec<String> = votes
            .iter()
            .zip(&voter_index)
            .map(|(v, &i)| {
                format!(
                    "{}={}{}",
                    state.policies[i].policy.kind,
                    v.recommended,
                    if v.cooling { "(cooldown)" } else { "" }
                )
            })
            .collect();
        let decision = ScaleDecision {
            service: service.clone(),
            direction,
            current_replicas: live,
            desired_replicas: desired,
            reason: format!("{}: {}", direction, reasons.join(", ")),
        };

        self.executor.execute(&decision).await?;
        self.metrics.record_scale_decision(&service);
        tracing::info!(
            service = service,
            direction = %direction,
            from = live,
            to = desired,
            reason = decision.reason,
            "Autoscaler decision"
        );

        for (vote, &i) in votes.iter().zip(&voter_index) {
            if vote.cooling {
                continue;
            }
            let policy = &mut state.policies[i];
            match direction {
                ScaleDirection::Up if vote.recommended > baseline => {
                    policy.scale_out_until =
                        Some(now + Duration::from_secs(policy.policy.scale_out_cooldown_secs));
                }
                ScaleDirection::Down if vote.recommended < baseline => {
                    policy.scale_in_until =
                        Some(now + Duration::from_secs(policy.policy.scale_in_cooldown_secs));
                }
                _ => {}
            }
        }
        Ok(Some(decision))
    }

    /// Number of services with attached policies
    pub fn service_count(&self) -> usize {
        self.services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for AutoscalingController {
    fn drop(&mut self) {
        let services = self
            .services
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for attachment in services.values() {
            for handle in &attachment.handles {
                handle.abort();
            }
        }
    }
}
