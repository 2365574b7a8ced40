//! Scaling configuration — target-tracking policies and rollout tuning

use serde::{Deserialize, Serialize};

/// Metric a scaling policy tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScalingPolicyKind {
    /// Average CPU utilization percentage across replicas
    CpuUtilization,
    /// Average memory utilization percentage across replicas
    MemoryUtilization,
    /// Requests per replica per minute at the shared listener
    RequestRate,
}

impl ScalingPolicyKind {
    /// Whether target values are percentages
    pub fn is_utilization(&self) -> bool {
        matches!(self, Self::CpuUtilization | Self::MemoryUtilization)
    }
}

impl std::fmt::Display for ScalingPolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CpuUtilization => write!(f, "cpu-utilization"),
            Self::MemoryUtilization => write!(f, "memory-utilization"),
            Self::RequestRate => write!(f, "request-rate"),
        }
    }
}

/// Target-tracking scaling policy
///
/// # Example
///
/// ```toml
/// kind = "cpu-utilization"
/// target = 70.0
/// scale_in_cooldown_secs = 300
/// scale_out_cooldown_secs = 60
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingPolicy {
    /// Tracked metric
    pub kind: ScalingPolicyKind,

    /// Target value for the tracked metric
    pub target: f64,

    /// Seconds after a scale-in before this policy may scale in again (default: 300)
    #[serde(default = "default_scale_in_cooldown")]
    pub scale_in_cooldown_secs: u64,

    /// Seconds after a scale-out before this policy may scale out again (default: 60)
    #[serde(default = "default_scale_out_cooldown")]
    pub scale_out_cooldown_secs: u64,
}

impl ScalingPolicy {
    /// Policy with default cooldowns
    pub fn new(kind: ScalingPolicyKind, target: f64) -> Self {
        Self {
            kind,
            target,
            scale_in_cooldown_secs: default_scale_in_cooldown(),
            scale_out_cooldown_secs: default_scale_out_cooldown(),
        }
    }
}

/// Autoscaling controller settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoscalingSettings {
    /// Seconds between evaluations of each policy (default: 60)
    #[serde(default = "default_evaluation_period")]
    pub evaluation_period_secs: u64,
}

impl Default for AutoscalingSettings {
    fn default() -> Self {
        Self {
            evaluation_period_secs: default_evaluation_period(),
        }
    }
}

/// Rollout tuning for a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutConfig {
    /// Lower bound on healthy replicas during a rollout, as a percent of desired (default: 100)
    #[serde(default = "default_min_healthy_percent")]
    pub min_healthy_percent: u32,

    /// Seconds the stabilizing phase may last before rollback (default: 600)
    #[serde(default = "default_stabilization_timeout")]
    pub stabilization_timeout_secs: u64,

    /// Health-check failure ratio (0.0..=1.0) that triggers rollback (default: 0.5)
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,

    /// Probes observed before the failure rate is trusted (default: 10)
    #[serde(default = "default_min_probe_samples")]
    pub min_probe_samples: u32,

    /// Attempts to restore the previous generation before giving up (default: 3)
    #[serde(default = "default_max_rollback_attempts")]
    pub max_rollback_attempts: u32,

    /// Milliseconds between health polls (default: 5000)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            min_healthy_percent: default_min_healthy_percent(),
            stabilization_timeout_secs: default_stabilization_timeout(),
            failure_rate_threshold: default_failure_rate_threshold(),
            min_probe_samples: default_min_probe_samples(),
            max_rollback_attempts: default_max_rollback_attempts(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl RolloutConfig {
    /// Healthy replicas that must stay in service for a given desired count
    pub fn min_healthy_replicas(&self, desired: u32) -> u32 {
        let scaled = u64::from(self.min_healthy_percent) * u64::from(desired);
        scaled.div_ceil(100) as u32
    }
}

fn default_scale_in_cooldown() -> u64 {
    300
}

fn default_scale_out_cooldown() -> u64 {
    60
}

fn default_evaluation_period() -> u64 {
    60
}

fn default_min_healthy_percent() -> u32 {
    100
}

fn default_stabilization_timeout() -> u64 {
    600
}

fn default_failure_rate_threshold() -> f64 {
    0.5
}

fn default_min_probe_samples() -> u32 {
    10
}

fn default_max_rollback_attempts() -> u32 {
    3
}

fn default_poll_interval() -> u64 {
    5000
}

/// Validate scaling policies and rollout tuning for a service.
///
/// Returns a human-readable reason on failure.
pub fn check_scaling(
    policies: &[ScalingPolicy],
    rollout: &RolloutConfig,
) -> std::result::Result<(), String> {
    let mut seen = Vec::new();
    for policy in policies {
        if seen.contains(&policy.kind) {
            return Err(format!("duplicate scaling policy '{}'", policy.kind));
        }
        seen.push(policy.kind);

        if !(policy.target > 0.0) {
            return Err(format!(
                "scaling policy '{}' target ({}) must be greater than 0",
                policy.kind, policy.target
            ));
        }
        if policy.kind.is_utilization() && policy.target > 100.0 {
            return Err(format!(
                "scaling policy '{}' target ({}) cannot exceed 100%",
                policy.kind, policy.target
            ));
        }
    }

    if rollout.min_healthy_percent > 100 {
        return Err(format!(
            "min_healthy_percent ({}) must be <= 100",
            rollout.min_healthy_percent
        ));
    }
    if rollout.failure_rate_threshold <= 0.0 || rollout.failure_rate_threshold > 1.0 {
        return Err(format!(
            "failure_rate_threshold ({}) must be in (0.0, 1.0]",
            rollout.failure_rate_threshold
        ));
    }
    if rollout.stabilization_timeout_secs == 0 {
        return Err("stabilization_timeout_secs must be greater than 0".to_string());
    }
    if rollout.max_rollback_attempts == 0 {
        return Err("max_rollback_attempts must be at least 1".to_string());
    }
    if rollout.poll_interval_ms == 0 {
        return Err("poll_interval_ms must be greater than 0".to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_parse_toml() {
        let toml = r#"
            kind = "request-rate"
            target = 1000.0
        "#;
        let policy: ScalingPolicy = toml::from_str(toml).unwrap();
        assert_eq!(policy.kind, ScalingPolicyKind::RequestRate);
        assert_eq!(policy.scale_in_cooldown_secs, 300);
        assert_eq!(policy.scale_out_cooldown_secs, 60);
    }

    #[test]
    fn test_rollout_defaults() {
        let rollout: RolloutConfig = toml::from_str("").unwrap();
        assert_eq!(rollout, RolloutConfig::default());
        assert_eq!(rollout.min_healthy_percent, 100);
        assert_eq!(rollout.stabilization_timeout_secs, 600);
        assert_eq!(rollout.max_rollback_attempts, 3);
    }

    #[test]
    fn test_min_healthy_replicas_rounds_up() {
        let rollout = RolloutConfig {
            min_healthy_percent: 50,
            ..RolloutConfig::default()
        };
        assert_eq!(rollout.min_healthy_replicas(3), 2);
        assert_eq!(rollout.min_healthy_replicas(4), 2);
        assert_eq!(rollout.min_healthy_replicas(0), 0);
        assert_eq!(RolloutConfig::default().min_healthy_replicas(5), 5);
    }

    #[test]
    fn test_check_duplicate_policy() {
        let policies = vec![
            ScalingPolicy::new(ScalingPolicyKind::CpuUtilization, 70.0),
            ScalingPolicy::new(ScalingPolicyKind::CpuUtilization, 50.0),
        ];
        let err = check_scaling(&policies, &RolloutConfig::default()).unwrap_err();
        assert!(err.contains("duplicate"));
    }

    #[test]
    fn test_check_utilization_over_100() {
        let policies = vec![ScalingPolicy::new(ScalingPolicyKind::MemoryUtilization, 120.0)];
        let err = check_scaling(&policies, &RolloutConfig::default()).unwrap_err();
        assert!(err.contains("cannot exceed 100%"));
    }

    #[test]
    fn test_check_request_rate_over_100_is_fine() {
        let policies = vec![ScalingPolicy::new(ScalingPolicyKind::RequestRate, 5000.0)];
        assert!(check_scaling(&policies, &RolloutConfig::default()).is_ok());
    }

    #[test]
    fn test_check_zero_target() {
        let policies = vec![ScalingPolicy::new(ScalingPolicyKind::RequestRate, 0.0)];
        assert!(check_scaling(&policies, &RolloutConfig::default()).is_err());
    }

    #[test]
    fn test_check_bad_failure_threshold() {
        let rollout = RolloutConfig {
            failure_rate_threshold: 1.5,
            ..RolloutConfig::default()
        };
        let err = check_scaling(&[], &rollout).unwrap_err();
        assert!(err.contains("failure_rate_threshold"));
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ScalingPolicyKind::CpuUtilization.to_string(), "cpu-utilization");
        assert_eq!(ScalingPolicyKind::MemoryUtilization.to_string(), "memory-utilization");
        assert_eq!(ScalingPolicyKind::RequestRate.to_string(), "request-rate");
    }
}
