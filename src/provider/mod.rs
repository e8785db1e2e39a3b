//! # Provider gateway
//!
//! The contract the reconciler consumes from the external load balancer:
//! create a listener with its backend group, validate a listener against what
//! a service recorded, and delete both again.
//!
//! Contract details the reconciler relies on:
//! - `create_listener` is safe to retry. Backend groups are keyed by backend
//!   port and reused when one already exists; a freshly created group gets
//!   every instance of the configured network registered as a target.
//! - `validate_listener` reports drift as a named [`ListenerMismatch`] rather
//!   than an error, so the caller can reallocate instead of retrying.
//! - `create_listener` refuses a pair that already carries a listener of
//!   another service with [`ProviderError::PortInUse`].
//! - `delete_listener` removes the listener, then the group unless another
//!   listener still forwards to it. Objects that are already gone count as
//!   deleted. A half-finished delete is an error and is not rolled back.
//! - `listener_owner` names the service a listener was created for, so a
//!   stale handle copied from someone else is never deleted.

pub mod memory;

pub use memory::{CallCounts, MemoryProvider, Operation};

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::ServiceIdentity;

/// Opaque provider identifiers for one listener and its backend group
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerHandles {
    pub listener: String,
    pub backend_group: String,
}

impl ListenerHandles {
    pub fn new(listener: impl Into<String>, backend_group: impl Into<String>) -> Self {
        Self {
            listener: listener.into(),
            backend_group: backend_group.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.listener.is_empty() && self.backend_group.is_empty()
    }
}

/// A specific way a live listener differs from its recorded binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerMismatch {
    ListenerNotFound { listener: String },
    LoadBalancer { expected: String, actual: String },
    ListenerPort { expected: u16, actual: u16 },
    BackendGroup { expected: String, actual: String },
    BackendPort { expected: u16, actual: u16 },
}

impl fmt::Display for ListenerMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerMismatch::ListenerNotFound { listener } => {
                write!(f, "listener {} no longer exists", listener)
            }
            ListenerMismatch::LoadBalancer { expected, actual } => {
                write!(f, "listener belongs to {} instead of {}", actual, expected)
            }
            ListenerMismatch::ListenerPort { expected, actual } => {
                write!(f, "listener port is {} but binding says {}", actual, expected)
            }
            ListenerMismatch::BackendGroup { expected, actual } => {
                write!(f, "listener forwards to {} instead of {}", actual, expected)
            }
            ListenerMismatch::BackendPort { expected, actual } => {
                write!(f, "backend group port is {} but node port is {}", actual, expected)
            }
        }
    }
}

/// Result of a live listener check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid,
    Mismatch(ListenerMismatch),
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid)
    }
}

/// Errors returned by provider calls.
///
/// None is retried in place. `Transient`, `PartialDelete` and `PortInUse`
/// clear up on a later pass. `LoadBalancerNotFound` and `Rejected` point at
/// configuration; they are retried with capped backoff and stop after
/// `--max-attempts` when that is set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Load balancer '{0}' not found")]
    LoadBalancerNotFound(String),

    #[error("{load_balancer}:{port} already has a listener for another service")]
    PortInUse { load_balancer: String, port: u16 },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Listener {listener} deleted but backend group {backend_group} was not: {reason}")]
    PartialDelete {
        listener: String,
        backend_group: String,
        reason: String,
    },

    #[error("Provider rejected the request: {0}")]
    Rejected(String),

    #[error("Transient provider error: {0}")]
    Transient(String),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound { .. })
    }

    /// The request can not succeed until the configuration changes
    pub fn is_misconfiguration(&self) -> bool {
        matches!(
            self,
            ProviderError::LoadBalancerNotFound(_) | ProviderError::Rejected(_)
        )
    }
}

#[async_trait]
pub trait LoadBalancerProvider: Send + Sync {
    /// Create a listener on `load_balancer:port` forwarding to `backend_port`
    async fn create_listener(
        &self,
        load_balancer: &str,
        port: u16,
        backend_port: u16,
        service: &ServiceIdentity,
    ) -> Result<ListenerHandles, ProviderError>;

    /// Compare the live listener with the expected ports and backend group
    async fn validate_listener(
        &self,
        handles: &ListenerHandles,
        load_balancer: &str,
        external_port: u16,
        backend_port: u16,
    ) -> Result<Validation, ProviderError>;

    /// Delete the listener, then its backend group
    async fn delete_listener(&self, handles: &ListenerHandles) -> Result<(), ProviderError>;

    /// Service the listener was created for; `None` when it no longer exists
    async fn listener_owner(&self, listener: &str)
        -> Result<Option<ServiceIdentity>, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mismatch_messages_name_the_discrepancy() {
        let port = ListenerMismatch::ListenerPort {
            expected: 9000,
            actual: 9005,
        };
        assert_eq!(
            port.to_string(),
            "listener port is 9005 but binding says 9000"
        );

        let group = ListenerMismatch::BackendGroup {
            expected: "G1".to_string(),
            actual: "G2".to_string(),
        };
        assert!(group.to_string().contains("G2"));
    }

    #[test]
    fn test_not_found_classification() {
        let err = ProviderError::NotFound {
            kind: "listener",
            id: "L1".to_string(),
        };
        assert!(err.is_not_found());
        assert!(!ProviderError::Transient("throttled".to_string()).is_not_found());
    }

    #[test]
    fn test_misconfiguration_classification() {
        assert!(ProviderError::LoadBalancerNotFound("lb9".to_string()).is_misconfiguration());
        assert!(!ProviderError::Transient("throttled".to_string()).is_misconfiguration());
        assert!(!ProviderError::PortInUse {
            load_balancer: "lb1".to_string(),
            port: 9000,
        }
        .is_misconfiguration());
    }
}
