//! Security binder — scope-limited identities and cross-account delegation
//!
//! Identity names are content-derived: `<service>-<scope>-<hash8>`, where the
//! hash covers the service name, region, and scope. Planning the same spec
//! twice yields the same names, and `put_role` upserts by name, so repeated
//! binding never accumulates duplicates.

pub mod delegation;

pub use delegation::{CredentialCache, DelegatedCredential};

use crate::compute::retry::with_retry;
use crate::config::{CrossAccountDelegation, EnvironmentProfile, PermissionGrant, RetryPolicy, ServiceSpec};
use crate::error::Result;
use crate::observability::TopologyMetrics;
use crate::platform::{IdentityApi, IdentityScope, Role, TrustBroker};
use ring::digest::{digest, SHA256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Principal trusted to assume task identities
pub const TASK_PRINCIPAL: &str = "ecs-tasks.amazonaws.com";

/// Longest identity name the platform accepts
const MAX_IDENTITY_NAME: usize = 64;

/// Identities bound for one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityContext {
    pub execution_identity: String,
    pub workload_identity: String,
    /// Delegation the workload may use, if declared
    pub delegation: Option<CrossAccountDelegation>,
}

/// Deterministic identity name for a service and scope
pub fn identity_name(service: &str, region: &str, scope: IdentityScope) -> String {
    let material = format!("{}\n{}\n{}", service, region, scope.tag());
    let hash = digest(&SHA256, material.as_bytes());
    let suffix: String = hash
        .as_ref()
        .iter()
        .take(4)
        .map(|b| format!("{:02x}", b))
        .collect();
    let tail = format!("-{}-{}", scope.tag(), suffix);
    let budget = MAX_IDENTITY_NAME - tail.len();
    let head: String = service.chars().take(budget).collect();
    format!("{}{}", head, tail)
}

/// Log group a service's containers write to
pub fn log_group(service: &str) -> String {
    format!("/a3s/{}", service)
}

/// Execution identity: image pull and log write, nothing else
pub fn execution_role(spec: &ServiceSpec, env: &EnvironmentProfile) -> Role {
    let log_resource = format!("arn:aws:logs:{}:*:log-group:{}:*", env.region, log_group(&spec.name));
    let grants: BTreeSet<PermissionGrant> = [
        PermissionGrant::new("ecr:GetAuthorizationToken", "*"),
        PermissionGrant::new("ecr:BatchCheckLayerAvailability", "*"),
        PermissionGrant::new("ecr:GetDownloadUrlForLayer", "*"),
        PermissionGrant::new("ecr:BatchGetImage", "*"),
        PermissionGrant::new("logs:CreateLogStream", log_resource.clone()),
        PermissionGrant::new("logs:PutLogEvents", log_resource),
    ]
    .into_iter()
    .collect();

    Role {
        name: identity_name(&spec.name, &env.region, IdentityScope::ExecutionIdentity),
        scope: IdentityScope::ExecutionIdentity,
        trust_principals: BTreeSet::from([TASK_PRINCIPAL.to_string()]),
        grants,
    }
}

/// Workload identity: the declared grants, reads on referenced secrets,
/// and the hop into a delegated role when one is declared
pub fn workload_role(spec: &ServiceSpec, env: &EnvironmentProfile) -> Role {
    let mut grants: BTreeSet<PermissionGrant> = spec.grants.iter().cloned().collect();
    for container in &spec.containers {
        for secret_id in container.secrets.values() {
            grants.insert(PermissionGrant::new("secretsmanager:GetSecretValue", secret_id));
        }
    }
    if let Some(delegation) = &spec.delegation {
        grants.insert(PermissionGrant::new("sts:AssumeRole", &delegation.role_ref));
    }

    Role {
        name: identity_name(&spec.name, &env.region, IdentityScope::WorkloadIdentity),
        scope: IdentityScope::WorkloadIdentity,
        trust_principals: BTreeSet::from([TASK_PRINCIPAL.to_string()]),
        grants,
    }
}

/// Mints identities through the identity API and resolves delegations
pub struct SecurityBinder {
    identity: Arc<dyn IdentityApi>,
    credentials: CredentialCache,
    retry: RetryPolicy,
    metrics: Arc<TopologyMetrics>,
}

impl SecurityBinder {
    pub fn new(
        identity: Arc<dyn IdentityApi>,
        broker: Arc<dyn TrustBroker>,
        metrics: Arc<TopologyMetrics>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            identity,
            credentials: CredentialCache::new(broker, metrics.clone(), retry.clone()),
            retry,
            metrics,
        }
    }

    async fn put_role(&self, role: &Role) -> Result<()> {
        with_retry(&self.retry, "put_role", &self.metrics, || self.identity.put_role(role)).await
    }

    async fn delete_role(&self, name: &str) -> Result<bool> {
        with_retry(&self.retry, "delete_role", &self.metrics, || self.identity.delete_role(name)).await
    }

    /// Create or refresh the execution identity
    pub async fn bind_execution_identity(
        &self,
        spec: &ServiceSpec,
        env: &EnvironmentProfile,
    ) -> Result<Role> {
        let role = execution_role(spec, env);
        self.put_role(&role).await?;
        tracing::info!(service = spec.name, role = role.name, "Execution identity bound");
        Ok(role)
    }

    /// Create or refresh the workload identity
    pub async fn bind_workload_identity(
        &self,
        spec: &ServiceSpec,
        env: &EnvironmentProfile,
    ) -> Result<Role> {
        let role = workload_role(spec, env);
        self.put_role(&role).await?;
        tracing::info!(
            service = spec.name,
            role = role.name,
            grants = role.grants.len(),
            "Workload identity bound"
        );
        Ok(role)
    }

    /// Bind both identities and check the delegation can be resolved
    pub async fn bind(&self, spec: &ServiceSpec, env: &EnvironmentProfile) -> Result<SecurityContext> {
        let execution = self.bind_execution_identity(spec, env).await?;
        let workload = self.bind_workload_identity(spec, env).await?;
        if let Some(delegation) = &spec.delegation {
            self.resolve_delegation(delegation).await?;
        }
        Ok(SecurityContext {
            execution_identity: execution.name,
            workload_identity: workload.name,
            delegation: spec.delegation.clone(),
        })
    }

    /// Short-lived credential for a delegation; callers re-invoke before expiry
    pub async fn resolve_delegation(
        &self,
        delegation: &CrossAccountDelegation,
    ) -> Result<Arc<DelegatedCredential>> {
        self.credentials.resolve(delegation).await
    }

    /// Delete both identities of a service; absent identities are skipped.
    ///
    /// Names derive from the service and region alone, so no spec is needed.
    pub async fn revoke(
        &self,
        service: &str,
        env: &EnvironmentProfile,
        delegation: Option<&CrossAccountDelegation>,
    ) -> Result<Vec<String>> {
        let mut revoked = Vec::new();
        for scope in [IdentityScope::WorkloadIdentity, IdentityScope::ExecutionIdentity] {
            let name = identity_name(service, &env.region, scope);
            if self.delete_role(&name).await? {
                tracing::info!(service = service, role = name, "Identity revoked");
                revoked.push(name);
            }
        }
        if let Some(delegation) = delegation {
            self.credentials.forget(delegation);
        }
        Ok(revoked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContainerSpec;
    use crate::platform::simulated::SimulatedPlatform;

    fn spec(name: &str) -> ServiceSpec {
        let mut container = ContainerSpec::new(name, "img:1", 8000);
        container
            .secrets
            .insert("API_KEY".into(), "arn:aws:secretsmanager:us-east-1:1:secret:key".into());
        ServiceSpec::builder(name)
            .container(container)
            .grant(PermissionGrant::new("dynamodb:GetItem", "arn:aws:dynamodb:*:*:table/keys"))
            .delegation(CrossAccountDelegation {
                role_ref: "arn:aws:iam::123456789012:role/bedrock".into(),
                target_region: "us-west-2".into(),
                session_duration_secs: 3600,
            })
            .build()
            .unwrap()
    }

    fn binder(platform: Arc<SimulatedPlatform>) -> SecurityBinder {
        SecurityBinder::new(
            platform.clone(),
            platform,
            Arc::new(TopologyMetrics::new()),
            RetryPolicy::default(),
        )
    }

    #[test]
    fn test_identity_name_deterministic() {
        let a = identity_name("proxy", "us-east-1", IdentityScope::ExecutionIdentity);
        let b = identity_name("proxy", "us-east-1", IdentityScope::ExecutionIdentity);
        assert_eq!(a, b);
        assert!(a.starts_with("proxy-exec-"));
        assert_eq!(a.len(), "proxy-exec-".len() + 8);
    }

    #[test]
    fn test_identity_name_distinguishes_inputs() {
        let base = identity_name("proxy", "us-east-1", IdentityScope::ExecutionIdentity);
        assert_ne!(base, identity_name("proxy", "us-east-1", IdentityScope::WorkloadIdentity));
        assert_ne!(base, identity_name("proxy", "eu-west-1", IdentityScope::ExecutionIdentity));
        assert_ne!(base, identity_name("proxy2", "us-east-1", IdentityScope::ExecutionIdentity));
    }

    #[test]
    fn test_identity_name_length_bounded() {
        let long = "s".repeat(100);
        assert_eq!(identity_name(&long, "r", IdentityScope::WorkloadIdentity).len(), 64);
    }

    #[test]
    fn test_execution_role_scope() {
        let env = EnvironmentProfile::for_region("us-east-1");
        let role = execution_role(&spec("proxy"), &env);
        assert!(role
            .grants
            .iter()
            .all(|g| g.action.starts_with("ecr:") || g.action.starts_with("logs:")));
        assert!(role.trust_principals.contains(TASK_PRINCIPAL));
    }

    #[test]
    fn test_workload_role_grants() {
        let env = EnvironmentProfile::for_region("us-east-1");
        let role = workload_role(&spec("proxy"), &env);
        let actions: Vec<&str> = role.grants.iter().map(|g| g.action.as_str()).collect();
        assert!(actions.contains(&"dynamodb:GetItem"));
        assert!(actions.contains(&"secretsmanager:GetSecretValue"));
        assert!(actions.contains(&"sts:AssumeRole"));
        assert!(!actions.iter().any(|a| a.starts_with("ecr:")));
    }

    #[tokio::test]
    async fn test_bind_twice_is_idempotent() {
        let platform = Arc::new(SimulatedPlatform::new());
        let binder = binder(platform.clone());
        let env = EnvironmentProfile::for_region("us-east-1");
        let first = binder.bind(&spec("proxy"), &env).await.unwrap();
        let second = binder.bind(&spec("proxy"), &env).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(platform.roles().len(), 2);
        // delegation resolved once, then served from cache
        assert_eq!(platform.assume_role_calls(), 1);
    }

    #[tokio::test]
    async fn test_bind_fails_on_denied_delegation() {
        let platform = Arc::new(SimulatedPlatform::new());
        platform.deny_role("arn:aws:iam::123456789012:role/bedrock");
        let binder = binder(platform.clone());
        let env = EnvironmentProfile::for_region("us-east-1");
        let err = binder.bind(&spec("proxy"), &env).await.unwrap_err();
        assert!(matches!(err, crate::error::TopologyError::CrossAccountAuth { .. }));
    }

    #[tokio::test]
    async fn test_revoke_twice() {
        let platform = Arc::new(SimulatedPlatform::new());
        let binder = binder(platform.clone());
        let env = EnvironmentProfile::for_region("us-east-1");
        let spec = spec("proxy");
        binder.bind(&spec, &env).await.unwrap();
        let delegation = spec.delegation.as_ref();
        assert_eq!(binder.revoke("proxy", &env, delegation).await.unwrap().len(), 2);
        assert!(binder.revoke("proxy", &env, delegation).await.unwrap().is_empty());
        assert!(platform.roles().is_empty());

        // the cached delegation went with the identities
        binder.bind(&spec, &env).await.unwrap();
        assert_eq!(platform.assume_role_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_identity_failures_are_retried() {
        let platform = Arc::new(SimulatedPlatform::new());
        platform.fail_next_role_writes(2);
        let binder = binder(platform.clone());
        let env = EnvironmentProfile::for_region("us-east-1");
        binder.bind(&spec("proxy"), &env).await.unwrap();
        assert_eq!(platform.roles().len(), 2);
    }
}
