//! Centralized error types for A3S Topology

use thiserror::Error;

/// Topology error types
#[derive(Debug, Error)]
pub enum TopologyError {
    /// Malformed or contradictory service spec, rejected before any external call
    #[error("Validation failed for '{service}': {message}")]
    Validation { service: String, message: String },

    /// Capability requested is not available on the chosen substrate
    #[error("Unsupported capability on {substrate} substrate: {message}")]
    UnsupportedCapability { substrate: String, message: String },

    /// Host mount requested for a path the node pool does not expose
    #[error("Host capability '{path}' is not exposed by capacity pool '{pool}'")]
    HostCapabilityUnavailable { pool: String, path: String },

    /// External placement failed
    #[error("Provisioning failed: {message}")]
    Provisioning { message: String, retryable: bool },

    /// Priority or target collision on the shared listener
    #[error("Routing conflict: {0}")]
    RoutingConflict(String),

    /// Capacity pool cannot host the requested replicas within the bounded wait
    #[error("Capacity exhausted in pool '{pool}': {message}")]
    CapacityExhausted { pool: String, message: String },

    /// A rollout transitioned to rollback (informational)
    #[error("Rollout of '{service}' rolled back: {reason}")]
    RollbackTriggered { service: String, reason: String },

    /// Delegated credential could not be obtained or has expired
    #[error("Cross-account delegation via '{role}' failed: {message}")]
    CrossAccountAuth { role: String, message: String },

    /// External call exceeded its caller-supplied deadline
    #[error("Operation '{operation}' timed out after {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    /// A rollout is already in flight for this service
    #[error("Rollout already in progress for service '{0}'")]
    RolloutInProgress(String),

    /// Configuration file could not be loaded or parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl TopologyError {
    /// Shorthand for a validation error
    pub fn validation(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a transient provisioning error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Provisioning {
            message: message.into(),
            retryable: true,
        }
    }

    /// Shorthand for a permanent provisioning error
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Provisioning {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether retrying the failed operation with the same parameters may succeed.
    ///
    /// Routing and capacity conflicts are never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provisioning { retryable, .. } => *retryable,
            Self::Timeout { .. } => true,
            _ => false,
        }
    }
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, TopologyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(TopologyError::transient("throttled").is_retryable());
        assert!(!TopologyError::permanent("image not found").is_retryable());
        assert!(TopologyError::Timeout {
            operation: "place".into(),
            elapsed_ms: 1000
        }
        .is_retryable());
        assert!(!TopologyError::RoutingConflict("priority 10".into()).is_retryable());
        assert!(!TopologyError::CapacityExhausted {
            pool: "p".into(),
            message: "full".into()
        }
        .is_retryable());
        assert!(!TopologyError::validation("svc", "bad").is_retryable());
    }

    #[test]
    fn test_display() {
        let err = TopologyError::validation("api", "no containers");
        assert_eq!(err.to_string(), "Validation failed for 'api': no containers");

        let err = TopologyError::HostCapabilityUnavailable {
            pool: "api-pool".into(),
            path: "/dev/fuse".into(),
        };
        assert!(err.to_string().contains("/dev/fuse"));
        assert!(err.to_string().contains("api-pool"));
    }
}
