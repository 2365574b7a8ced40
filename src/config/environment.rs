//! Environment profile — region, platform word size, feature flags, and workload defaults

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// CPU architecture (platform word size) stamped on task definitions and node pools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    #[default]
    X86_64,
    Arm64,
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::X86_64 => write!(f, "X86_64"),
            Self::Arm64 => write!(f, "ARM64"),
        }
    }
}

/// Rate-limit defaults handed to every workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitDefaults {
    /// Whether rate limiting is enabled in the workload (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Requests allowed per window (default: 1000)
    #[serde(default = "default_rate_limit_requests")]
    pub requests: u32,

    /// Window length in seconds (default: 60)
    #[serde(default = "default_rate_limit_window")]
    pub window_secs: u64,
}

impl Default for RateLimitDefaults {
    fn default() -> Self {
        Self {
            enabled: true,
            requests: default_rate_limit_requests(),
            window_secs: default_rate_limit_window(),
        }
    }
}

/// Environment profile the planner resolves a service spec against
///
/// # HCL Example
///
/// ```hcl
/// environment {
///   name          = "production"
///   region        = "us-west-2"
///   architecture  = "arm64"
///   log_level     = "INFO"
///   feature_flags = ["tool-use", "extended-thinking"]
///   storage_tables = {
///     api_keys = "anthropic-proxy-api-keys"
///     usage    = "anthropic-proxy-usage"
///   }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentProfile {
    /// Deployment environment name (default: "development")
    #[serde(default = "default_environment_name")]
    pub name: String,

    /// Region identifier (e.g., "us-east-1")
    pub region: String,

    /// Platform word size
    #[serde(default)]
    pub architecture: Architecture,

    /// Workload log level (default: "INFO")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enabled feature flags
    #[serde(default)]
    pub feature_flags: BTreeSet<String>,

    /// Storage table identifiers, keyed by logical table name
    #[serde(default)]
    pub storage_tables: BTreeMap<String, String>,

    /// Rate-limit defaults
    #[serde(default)]
    pub rate_limit: RateLimitDefaults,

    /// Default service tier (default: "default")
    #[serde(default = "default_service_tier")]
    pub service_tier: String,
}

impl EnvironmentProfile {
    /// Minimal profile for a region, all other fields defaulted
    pub fn for_region(region: impl Into<String>) -> Self {
        Self {
            name: default_environment_name(),
            region: region.into(),
            architecture: Architecture::default(),
            log_level: default_log_level(),
            feature_flags: BTreeSet::new(),
            storage_tables: BTreeMap::new(),
            rate_limit: RateLimitDefaults::default(),
            service_tier: default_service_tier(),
        }
    }

    /// Whether a feature flag is enabled
    pub fn has_feature(&self, flag: &str) -> bool {
        self.feature_flags.contains(flag)
    }
}

fn default_true() -> bool {
    true
}

fn default_rate_limit_requests() -> u32 {
    1000
}

fn default_rate_limit_window() -> u64 {
    60
}

fn default_environment_name() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_service_tier() -> String {
    "default".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_toml() {
        let profile: EnvironmentProfile = toml::from_str(r#"region = "eu-west-1""#).unwrap();
        assert_eq!(profile.region, "eu-west-1");
        assert_eq!(profile.name, "development");
        assert_eq!(profile.architecture, Architecture::X86_64);
        assert_eq!(profile.log_level, "INFO");
        assert!(profile.feature_flags.is_empty());
        assert!(profile.rate_limit.enabled);
        assert_eq!(profile.rate_limit.requests, 1000);
        assert_eq!(profile.rate_limit.window_secs, 60);
        assert_eq!(profile.service_tier, "default");
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
            name = "production"
            region = "us-west-2"
            architecture = "arm64"
            log_level = "DEBUG"
            feature_flags = ["tool-use", "extended-thinking"]
            service_tier = "reserved"

            [storage_tables]
            api_keys = "proxy-api-keys"

            [rate_limit]
            requests = 50
            window_secs = 10
        "#;
        let profile: EnvironmentProfile = toml::from_str(toml).unwrap();
        assert_eq!(profile.architecture, Architecture::Arm64);
        assert!(profile.has_feature("tool-use"));
        assert!(!profile.has_feature("documents"));
        assert_eq!(profile.storage_tables["api_keys"], "proxy-api-keys");
        assert_eq!(profile.rate_limit.requests, 50);
        assert_eq!(profile.service_tier, "reserved");
    }

    #[test]
    fn test_architecture_display() {
        assert_eq!(Architecture::X86_64.to_string(), "X86_64");
        assert_eq!(Architecture::Arm64.to_string(), "ARM64");
    }
}
