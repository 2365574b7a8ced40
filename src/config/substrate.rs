//! Compute substrate configuration — managed tasks vs. a self-managed node pool

use serde::{Deserialize, Serialize};

/// Substrate discriminant without its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubstrateKind {
    Serverless,
    NodePool,
}

impl std::fmt::Display for SubstrateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serverless => write!(f, "serverless"),
            Self::NodePool => write!(f, "node-pool"),
        }
    }
}

/// Capacity strategy backing a node-pool substrate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityStrategy {
    /// Instance class for pool nodes (e.g., "c7g.xlarge")
    pub instance_class: String,

    /// Whether nodes may run on discounted, interruptible capacity
    #[serde(default)]
    pub spot_eligible: bool,

    /// Optional hourly price ceiling for interruptible capacity (requires `spot_eligible`)
    #[serde(default)]
    pub spot_price_ceiling: Option<f64>,

    /// Minimum node count (default: 1)
    #[serde(default = "default_min_nodes")]
    pub min_nodes: u32,

    /// Maximum node count (default: 3)
    #[serde(default = "default_max_nodes")]
    pub max_nodes: u32,

    /// Desired node count (default: 1)
    #[serde(default = "default_desired_nodes")]
    pub desired_nodes: u32,

    /// Root volume size in GiB (default: 30)
    #[serde(default = "default_root_volume")]
    pub root_volume_gib: u32,

    /// Target pool utilization reported back to the scheduler (default: 100)
    #[serde(default = "default_target_capacity")]
    pub target_capacity_percent: u32,
}

impl CapacityStrategy {
    /// Strategy for an instance class with all other fields defaulted
    pub fn new(instance_class: impl Into<String>) -> Self {
        Self {
            instance_class: instance_class.into(),
            spot_eligible: false,
            spot_price_ceiling: None,
            min_nodes: default_min_nodes(),
            max_nodes: default_max_nodes(),
            desired_nodes: default_desired_nodes(),
            root_volume_gib: default_root_volume(),
            target_capacity_percent: default_target_capacity(),
        }
    }

    /// Check min ≤ desired ≤ max and the spot/price-ceiling pairing
    pub fn check(&self) -> std::result::Result<(), String> {
        if self.instance_class.trim().is_empty() {
            return Err("instance_class must not be empty".to_string());
        }
        if self.max_nodes == 0 {
            return Err("max_nodes must be at least 1".to_string());
        }
        if !(self.min_nodes <= self.desired_nodes && self.desired_nodes <= self.max_nodes) {
            return Err(format!(
                "node counts must satisfy min ({}) <= desired ({}) <= max ({})",
                self.min_nodes, self.desired_nodes, self.max_nodes
            ));
        }
        if self.root_volume_gib < 8 {
            return Err(format!(
                "root_volume_gib ({}) must be at least 8",
                self.root_volume_gib
            ));
        }
        if self.target_capacity_percent == 0 || self.target_capacity_percent > 100 {
            return Err(format!(
                "target_capacity_percent ({}) must be in 1..=100",
                self.target_capacity_percent
            ));
        }
        match self.spot_price_ceiling {
            Some(_) if !self.spot_eligible => {
                Err("spot_price_ceiling requires spot_eligible = true".to_string())
            }
            Some(price) if price <= 0.0 => {
                Err(format!("spot_price_ceiling ({}) must be positive", price))
            }
            _ => Ok(()),
        }
    }
}

/// Target compute substrate for a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ComputeSubstrate {
    /// On-demand, fully-managed tasks with no host access
    Serverless,
    /// Long-lived host pool driven by a capacity strategy
    NodePool(CapacityStrategy),
}

impl ComputeSubstrate {
    /// Discriminant of this substrate
    pub fn kind(&self) -> SubstrateKind {
        match self {
            Self::Serverless => SubstrateKind::Serverless,
            Self::NodePool(_) => SubstrateKind::NodePool,
        }
    }

    /// Capacity strategy, if this is a node pool
    pub fn capacity(&self) -> Option<&CapacityStrategy> {
        match self {
            Self::Serverless => None,
            Self::NodePool(strategy) => Some(strategy),
        }
    }
}

fn default_min_nodes() -> u32 {
    1
}

fn default_max_nodes() -> u32 {
    3
}

fn default_desired_nodes() -> u32 {
    1
}

fn default_root_volume() -> u32 {
    30
}

fn default_target_capacity() -> u32 {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serverless_json() {
        let substrate: ComputeSubstrate = serde_json::from_str(r#"{"kind":"serverless"}"#).unwrap();
        assert_eq!(substrate, ComputeSubstrate::Serverless);
        assert_eq!(substrate.kind(), SubstrateKind::Serverless);
        assert!(substrate.capacity().is_none());
    }

    #[test]
    fn test_parse_node_pool_toml() {
        let toml = r#"
            kind = "node-pool"
            instance_class = "c7g.xlarge"
            spot_eligible = true
            spot_price_ceiling = 0.12
            min_nodes = 1
            max_nodes = 3
            desired_nodes = 1
        "#;
        let substrate: ComputeSubstrate = toml::from_str(toml).unwrap();
        let capacity = substrate.capacity().unwrap();
        assert_eq!(capacity.instance_class, "c7g.xlarge");
        assert!(capacity.spot_eligible);
        assert_eq!(capacity.spot_price_ceiling, Some(0.12));
        assert_eq!(capacity.root_volume_gib, 30);
        assert_eq!(capacity.target_capacity_percent, 100);
        assert!(capacity.check().is_ok());
    }

    #[test]
    fn test_check_node_count_ordering() {
        let strategy = CapacityStrategy {
            min_nodes: 2,
            desired_nodes: 1,
            max_nodes: 3,
            ..CapacityStrategy::new("m5.large")
        };
        let err = strategy.check().unwrap_err();
        assert!(err.contains("min (2) <= desired (1) <= max (3)"));

        let strategy = CapacityStrategy {
            desired_nodes: 4,
            ..CapacityStrategy::new("m5.large")
        };
        assert!(strategy.check().is_err());
    }

    #[test]
    fn test_check_price_ceiling_requires_spot() {
        let strategy = CapacityStrategy {
            spot_price_ceiling: Some(0.1),
            ..CapacityStrategy::new("m5.large")
        };
        assert!(strategy.check().unwrap_err().contains("spot_eligible"));
    }

    #[test]
    fn test_check_small_root_volume() {
        let strategy = CapacityStrategy {
            root_volume_gib: 4,
            ..CapacityStrategy::new("m5.large")
        };
        assert!(strategy.check().unwrap_err().contains("root_volume_gib"));
    }

    #[test]
    fn test_substrate_kind_display() {
        assert_eq!(SubstrateKind::Serverless.to_string(), "serverless");
        assert_eq!(SubstrateKind::NodePool.to_string(), "node-pool");
    }
}
