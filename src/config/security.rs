//! Security configuration — declared resource grants and cross-account delegation

use serde::{Deserialize, Serialize};

/// Shortest session a delegation may request (15 minutes)
pub const MIN_SESSION_SECS: u64 = 900;
/// Longest session a delegation may request (12 hours)
pub const MAX_SESSION_SECS: u64 = 43_200;

/// A single action/resource permission pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PermissionGrant {
    /// Action identifier (e.g., "dynamodb:GetItem")
    pub action: String,
    /// Resource identifier (e.g., a table ARN, or "*")
    pub resource: String,
}

impl PermissionGrant {
    /// Create a grant
    pub fn new(action: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            resource: resource.into(),
        }
    }
}

/// Cross-trust-domain delegation — a role in another account the workload assumes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CrossAccountDelegation {
    /// Role reference in the target account (e.g., "arn:aws:iam::123456789012:role/bedrock")
    pub role_ref: String,

    /// Region the delegated capability lives in
    pub target_region: String,

    /// Upper bound on delegated session length in seconds (default: 3600)
    #[serde(default = "default_session_duration")]
    pub session_duration_secs: u64,
}

impl CrossAccountDelegation {
    /// Check role reference shape and session bounds
    pub fn check(&self) -> std::result::Result<(), String> {
        if !self.role_ref.starts_with("arn:") || !self.role_ref.contains(":role/") {
            return Err(format!(
                "delegation role_ref '{}' must be a role ARN",
                self.role_ref
            ));
        }
        if self.target_region.trim().is_empty() {
            return Err("delegation target_region must not be empty".to_string());
        }
        if !(MIN_SESSION_SECS..=MAX_SESSION_SECS).contains(&self.session_duration_secs) {
            return Err(format!(
                "delegation session_duration_secs ({}) must be in {}..={}",
                self.session_duration_secs, MIN_SESSION_SECS, MAX_SESSION_SECS
            ));
        }
        Ok(())
    }
}

fn default_session_duration() -> u64 {
    3600
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delegation(role: &str, secs: u64) -> CrossAccountDelegation {
        CrossAccountDelegation {
            role_ref: role.into(),
            target_region: "us-west-2".into(),
            session_duration_secs: secs,
        }
    }

    #[test]
    fn test_parse_defaults() {
        let toml = r#"
            role_ref = "arn:aws:iam::123456789012:role/bedrock-access"
            target_region = "us-west-2"
        "#;
        let d: CrossAccountDelegation = toml::from_str(toml).unwrap();
        assert_eq!(d.session_duration_secs, 3600);
        assert!(d.check().is_ok());
    }

    #[test]
    fn test_check_rejects_non_arn() {
        let err = delegation("bedrock-access", 3600).check().unwrap_err();
        assert!(err.contains("role ARN"));
    }

    #[test]
    fn test_check_session_bounds() {
        let role = "arn:aws:iam::123456789012:role/x";
        assert!(delegation(role, 899).check().is_err());
        assert!(delegation(role, 900).check().is_ok());
        assert!(delegation(role, 43_200).check().is_ok());
        assert!(delegation(role, 43_201).check().is_err());
    }
}
