//! Routing configuration — shared listener and per-service path rules

use serde::{Deserialize, Serialize};

/// Lowest priority value accepted by the listener
pub const MIN_PRIORITY: u32 = 1;
/// Highest priority value accepted by the listener
pub const MAX_PRIORITY: u32 = 50_000;
/// Upper bound for affinity duration (7 days)
pub const MAX_STICKINESS_SECS: u64 = 604_800;

/// Routing rule — matches request paths to a service target
///
/// # Example
///
/// ```toml
/// patterns = ["/v1/messages", "/v1/messages/*"]
/// priority = 10
/// target_port = 8000
/// stickiness_secs = 240
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Path patterns; a trailing `*` matches any suffix
    pub patterns: Vec<String>,

    /// Priority, unique per listener (lower = evaluated first)
    pub priority: u32,

    /// Container port this rule targets (optional when the service has one container)
    #[serde(default)]
    pub target_port: Option<u16>,

    /// Explicit target group name; defaults to `<service>-<port>`
    #[serde(default)]
    pub target_group: Option<String>,

    /// Allow several services to bind the same explicit target group
    #[serde(default)]
    pub aggregate: bool,

    /// Session-affinity duration in seconds (absent = no affinity)
    #[serde(default)]
    pub stickiness_secs: Option<u64>,
}

impl RoutingRule {
    /// A rule for the given patterns and priority, all other fields defaulted
    pub fn new(patterns: &[&str], priority: u32) -> Self {
        Self {
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            priority,
            target_port: None,
            target_group: None,
            aggregate: false,
            stickiness_secs: None,
        }
    }
}

/// Shared listener configuration — the single entry point for all services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Listener name (default: "shared")
    #[serde(default = "default_listener_name")]
    pub name: String,

    /// Listening port (default: 80)
    #[serde(default = "default_listener_port")]
    pub port: u16,

    /// Idle connection timeout in seconds (default: 60)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Affinity cookie name (default: "a3s_affinity")
    #[serde(default = "default_affinity_cookie")]
    pub affinity_cookie: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            name: default_listener_name(),
            port: default_listener_port(),
            idle_timeout_secs: default_idle_timeout(),
            affinity_cookie: default_affinity_cookie(),
        }
    }
}

fn default_listener_name() -> String {
    "shared".to_string()
}

fn default_listener_port() -> u16 {
    80
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_affinity_cookie() -> String {
    "a3s_affinity".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_parse_minimal() {
        let toml = r#"
            patterns = ["/v1/*"]
            priority = 10
        "#;
        let rule: RoutingRule = toml::from_str(toml).unwrap();
        assert_eq!(rule.patterns, vec!["/v1/*"]);
        assert_eq!(rule.priority, 10);
        assert!(rule.target_port.is_none());
        assert!(rule.target_group.is_none());
        assert!(!rule.aggregate);
        assert!(rule.stickiness_secs.is_none());
    }

    #[test]
    fn test_rule_parse_full() {
        let toml = r#"
            patterns = ["/v1/messages", "/v1/messages/*"]
            priority = 20
            target_port = 8000
            target_group = "shared-admin"
            aggregate = true
            stickiness_secs = 240
        "#;
        let rule: RoutingRule = toml::from_str(toml).unwrap();
        assert_eq!(rule.target_port, Some(8000));
        assert_eq!(rule.target_group.as_deref(), Some("shared-admin"));
        assert!(rule.aggregate);
        assert_eq!(rule.stickiness_secs, Some(240));
    }

    #[test]
    fn test_listener_defaults() {
        let listener: ListenerConfig = toml::from_str("").unwrap();
        assert_eq!(listener, ListenerConfig::default());
        assert_eq!(listener.name, "shared");
        assert_eq!(listener.port, 80);
        assert_eq!(listener.affinity_cookie, "a3s_affinity");
    }

    #[test]
    fn test_rule_new() {
        let rule = RoutingRule::new(&["/health"], 1);
        assert_eq!(rule.patterns, vec!["/health"]);
        assert_eq!(rule.priority, MIN_PRIORITY);
    }
}
