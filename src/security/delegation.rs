//! Delegated credentials — immutable, time-bounded, shared by reference
//!
//! A resolved credential never changes. Refreshing produces a new
//! `Arc<DelegatedCredential>`, so holders of the previous one keep a
//! consistent view until its window closes.

use crate::compute::retry::with_deadline;
use crate::config::{CrossAccountDelegation, RetryPolicy};
use crate::error::{Result, TopologyError};
use crate::observability::TopologyMetrics;
use crate::platform::{Credentials, TrustBroker};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Session name presented to the trust broker
pub const SESSION_NAME: &str = "a3s-topology-session";

/// Short-lived credential for a resource outside the local boundary
#[derive(Debug)]
pub struct DelegatedCredential {
    pub role_ref: String,
    pub target_region: String,
    pub credentials: Credentials,
    pub issued_at: Instant,
    valid_until: Instant,
}

impl DelegatedCredential {
    /// Wrap broker output; the window is the shorter of the requested
    /// session bound and the broker's own expiration.
    pub fn new(delegation: &CrossAccountDelegation, credentials: Credentials) -> Self {
        let issued_at = Instant::now();
        let requested = Duration::from_secs(delegation.session_duration_secs);
        let granted = (credentials.expiration - chrono::Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        Self {
            role_ref: delegation.role_ref.clone(),
            target_region: delegation.target_region.clone(),
            credentials,
            issued_at,
            valid_until: issued_at + requested.min(granted),
        }
    }

    pub fn is_valid(&self) -> bool {
        Instant::now() < self.valid_until
    }

    /// Time left in the validity window
    pub fn remaining(&self) -> Duration {
        self.valid_until.saturating_duration_since(Instant::now())
    }

    /// Credential material, or `CrossAccountAuth` once the window closed
    pub fn credentials(&self) -> Result<&Credentials> {
        if self.is_valid() {
            Ok(&self.credentials)
        } else {
            Err(TopologyError::CrossAccountAuth {
                role: self.role_ref.clone(),
                message: "delegated credential expired; resolve the delegation again".to_string(),
            })
        }
    }
}

type Slot = Arc<Mutex<Option<Arc<DelegatedCredential>>>>;

/// Cache key prefix shared by every session bound of one role and region
fn key_prefix(delegation: &CrossAccountDelegation) -> String {
    format!("{}|{}|", delegation.role_ref, delegation.target_region)
}

fn cache_key(delegation: &CrossAccountDelegation) -> String {
    format!("{}{}", key_prefix(delegation), delegation.session_duration_secs)
}

/// Cache of delegated credentials keyed by role, region, and session bound
pub struct CredentialCache {
    broker: Arc<dyn TrustBroker>,
    metrics: Arc<TopologyMetrics>,
    retry: RetryPolicy,
    slots: std::sync::Mutex<HashMap<String, Slot>>,
}

impl CredentialCache {
    pub fn new(broker: Arc<dyn TrustBroker>, metrics: Arc<TopologyMetrics>, retry: RetryPolicy) -> Self {
        Self {
            broker,
            metrics,
            retry,
            slots: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, key: &str) -> Slot {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Return the cached credential while valid, otherwise cross the boundary again
    pub async fn resolve(&self, delegation: &CrossAccountDelegation) -> Result<Arc<DelegatedCredential>> {
        let slot = self.slot(&cache_key(delegation));
        // Held across the broker call so concurrent misses for one key share a resolution
        let mut entry = slot.lock().await;
        if let Some(existing) = entry.as_ref() {
            if existing.is_valid() {
                self.metrics.record_delegation_cache_hit();
                return Ok(existing.clone());
            }
        }

        let credentials = with_deadline(
            &self.retry,
            "assume_role",
            self.broker.assume_role(delegation, SESSION_NAME),
        )
        .await
        .map_err(|e| match e {
                TopologyError::CrossAccountAuth { .. } => e,
                other => TopologyError::CrossAccountAuth {
                    role: delegation.role_ref.clone(),
                    message: other.to_string(),
                },
            })?;
        let credential = Arc::new(DelegatedCredential::new(delegation, credentials));
        *entry = Some(credential.clone());

        self.metrics.record_delegation_resolved();
        tracing::info!(
            role = delegation.role_ref,
            region = delegation.target_region,
            valid_secs = credential.remaining().as_secs(),
            "Delegation resolved"
        );
        Ok(credential)
    }

    /// Drop every cached credential for a delegation's role and region
    pub fn forget(&self, delegation: &CrossAccountDelegation) {
        let prefix = key_prefix(delegation);
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|key, _| !key.starts_with(&prefix));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::simulated::SimulatedPlatform;
    use async_trait::async_trait;

    fn delegation() -> CrossAccountDelegation {
        CrossAccountDelegation {
            role_ref: "arn:aws:iam::123456789012:role/bedrock-access".into(),
            target_region: "us-west-2".into(),
            session_duration_secs: 3600,
        }
    }

    fn cache(platform: Arc<SimulatedPlatform>) -> CredentialCache {
        CredentialCache::new(platform, Arc::new(TopologyMetrics::new()), RetryPolicy::default())
    }

    /// Broker that never answers for one role
    struct StalledBroker {
        stalled: String,
        inner: Arc<SimulatedPlatform>,
    }

    #[async_trait]
    impl TrustBroker for StalledBroker {
        async fn assume_role(
            &self,
            delegation: &CrossAccountDelegation,
            session_name: &str,
        ) -> Result<Credentials> {
            if delegation.role_ref == self.stalled {
                std::future::pending::<()>().await;
            }
            self.inner.assume_role(delegation, session_name).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reuse_within_window_and_refresh_after() {
        let platform = Arc::new(SimulatedPlatform::new());
        let cache = cache(platform.clone());

        let first = cache.resolve(&delegation()).await.unwrap();
        tokio::time::advance(Duration::from_secs(3599)).await;
        let held = cache.resolve(&delegation()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &held));
        assert!(held.credentials().is_ok());
        assert_eq!(platform.assume_role_calls(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        let fresh = cache.resolve(&delegation()).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &fresh));
        assert_eq!(platform.assume_role_calls(), 2);

        // the old object is unchanged and now reports expiry
        assert!(!first.is_valid());
        assert!(matches!(
            first.credentials().unwrap_err(),
            TopologyError::CrossAccountAuth { .. }
        ));
        assert!(fresh.credentials().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_role_is_cross_account_error() {
        let platform = Arc::new(SimulatedPlatform::new());
        platform.deny_role(&delegation().role_ref);
        let err = cache(platform).resolve(&delegation()).await.unwrap_err();
        assert!(matches!(err, TopologyError::CrossAccountAuth { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_resolve_once() {
        let platform = Arc::new(SimulatedPlatform::new());
        let cache = Arc::new(cache(platform.clone()));
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.resolve(&delegation()).await.unwrap() })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(platform.assume_role_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget() {
        let platform = Arc::new(SimulatedPlatform::new());
        let cache = cache(platform.clone());
        cache.resolve(&delegation()).await.unwrap();
        cache.forget(&delegation());
        cache.resolve(&delegation()).await.unwrap();
        assert_eq!(platform.assume_role_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shorter_session_bound_is_not_served_a_longer_credential() {
        let platform = Arc::new(SimulatedPlatform::new());
        let cache = cache(platform.clone());
        let long = cache.resolve(&delegation()).await.unwrap();

        tokio::time::advance(Duration::from_secs(1000)).await;
        let short = CrossAccountDelegation {
            session_duration_secs: 900,
            ..delegation()
        };
        let credential = cache.resolve(&short).await.unwrap();
        assert!(!Arc::ptr_eq(&long, &credential));
        assert!(credential.remaining() <= Duration::from_secs(900));
        assert_eq!(platform.assume_role_calls(), 2);

        // each bound keeps its own entry
        assert!(Arc::ptr_eq(&long, &cache.resolve(&delegation()).await.unwrap()));
        assert_eq!(platform.assume_role_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_broker_hits_deadline_without_blocking_other_roles() {
        let platform = Arc::new(SimulatedPlatform::new());
        let stalled = delegation();
        let broker = Arc::new(StalledBroker {
            stalled: stalled.role_ref.clone(),
            inner: platform.clone(),
        });
        let retry = RetryPolicy {
            call_timeout_secs: 5,
            ..RetryPolicy::default()
        };
        let cache = Arc::new(CredentialCache::new(broker, Arc::new(TopologyMetrics::new()), retry));

        let pending = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.resolve(&stalled).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;

        let started = Instant::now();
        let other = CrossAccountDelegation {
            role_ref: "arn:aws:iam::210987654321:role/search".into(),
            ..delegation()
        };
        assert!(cache.resolve(&other).await.is_ok());
        assert!(started.elapsed() < Duration::from_secs(1));

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, TopologyError::CrossAccountAuth { .. }));
        assert_eq!(platform.assume_role_calls(), 1);
    }
}
