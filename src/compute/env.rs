//! Environment-variable contract handed to every workload at start

use crate::config::{ContainerSpec, EnvironmentProfile, ServiceSpec};
use crate::error::{Result, TopologyError};
use std::collections::BTreeMap;

/// Keys a service may not override
pub const RESERVED_KEYS: &[&str] = &[
    "AWS_REGION",
    "PORT",
    "BEDROCK_CROSS_ACCOUNT_ROLE_ARN",
    "BEDROCK_REGION",
];

/// Upper-case a name into an environment key segment
fn env_segment(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Reject service-declared variables that shadow reserved keys
pub fn check_reserved(spec: &ServiceSpec) -> Result<()> {
    for key in spec.environment.keys() {
        if RESERVED_KEYS.contains(&key.as_str()) {
            return Err(TopologyError::validation(
                &spec.name,
                format!("environment variable '{}' is reserved", key),
            ));
        }
    }
    Ok(())
}

/// Resolved environment for one container
///
/// Contract defaults first, then service-declared variables, then reserved keys.
pub fn build_environment(
    spec: &ServiceSpec,
    container: &ContainerSpec,
    env: &EnvironmentProfile,
) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    vars.insert("LOG_LEVEL".to_string(), env.log_level.clone());
    vars.insert("ENVIRONMENT".to_string(), env.name.clone());
    for flag in &env.feature_flags {
        vars.insert(format!("ENABLE_{}", env_segment(flag)), "true".to_string());
    }
    for (table, identifier) in &env.storage_tables {
        vars.insert(format!("DYNAMODB_{}_TABLE", env_segment(table)), identifier.clone());
    }
    vars.insert(
        "RATE_LIMIT_ENABLED".to_string(),
        env.rate_limit.enabled.to_string(),
    );
    vars.insert(
        "RATE_LIMIT_REQUESTS".to_string(),
        env.rate_limit.requests.to_string(),
    );
    vars.insert(
        "RATE_LIMIT_WINDOW".to_string(),
        env.rate_limit.window_secs.to_string(),
    );
    vars.insert("DEFAULT_SERVICE_TIER".to_string(), env.service_tier.clone());

    for (key, value) in &spec.environment {
        vars.insert(key.clone(), value.clone());
    }

    vars.insert("AWS_REGION".to_string(), env.region.clone());
    vars.insert("PORT".to_string(), container.port.to_string());
    // Model calls go to the delegated region, or stay local without one
    match &spec.delegation {
        Some(delegation) => {
            vars.insert(
                "BEDROCK_CROSS_ACCOUNT_ROLE_ARN".to_string(),
                delegation.role_ref.clone(),
            );
            vars.insert(
                "BEDROCK_REGION".to_string(),
                delegation.target_region.clone(),
            );
        }
        None => {
            vars.insert("BEDROCK_REGION".to_string(), env.region.clone());
        }
    }
    vars
}
