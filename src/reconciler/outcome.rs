use std::fmt;

use thiserror::Error;

use crate::cluster::{ClusterError, ServiceIdentity};
use crate::ledger::{Allocation, LedgerError};
use crate::provider::{ListenerHandles, ProviderError};

/// Binding state of a service, derived fresh on every pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    NoBinding,
    BindingValid,
    BindingInvalid,
    Deleting,
}

impl fmt::Display for BindingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BindingState::NoBinding => "NoBinding",
            BindingState::BindingValid => "BindingValid",
            BindingState::BindingInvalid => "BindingInvalid",
            BindingState::Deleting => "Deleting",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone)]
pub enum ReconcileError {
    #[error("Unable to fetch service {service}: {source}")]
    ClusterRead {
        service: ServiceIdentity,
        source: ClusterError,
    },

    #[error("No free load balancer port for {0}")]
    CapacityExhausted(ServiceIdentity),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Unable to remove stale listener for {service}: {source}")]
    StaleCleanup {
        service: ServiceIdentity,
        source: ProviderError,
    },

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Unable to update the finalizer of {service}: {source}")]
    Finalizer {
        service: ServiceIdentity,
        source: ClusterError,
    },

    #[error("Unable to persist binding for {service}: {source}")]
    Persist {
        service: ServiceIdentity,
        source: ClusterError,
    },

    #[error(
        "Leaked listener {} and backend group {} for {service}: {source}",
        .handles.listener,
        .handles.backend_group
    )]
    LeakedResources {
        service: ServiceIdentity,
        handles: ListenerHandles,
        source: ProviderError,
    },
}

impl ReconcileError {
    /// Everything except a failed rollback can be fixed by trying again later
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ReconcileError::LeakedResources { .. })
    }
}

/// Why a present service was left alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Not a `NodePort` service, or not opted in
    NotEligible,
    MissingBackendPort,
}

/// How a pass that needs no retry ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Skipped(SkipReason),
    /// Recorded binding matched the provider and is held in the ledger
    Verified(Allocation),
    Allocated(Allocation),
    Released(Allocation),
    /// Service is gone and held nothing
    NothingToRelease,
    /// Service vanished mid-allocation; the new objects were rolled back
    ServiceGone,
}

/// Result of one reconciliation pass
#[derive(Debug, Clone)]
pub enum Outcome {
    Done(Completion),
    /// Run another pass for this service later
    Retry(ReconcileError),
    /// Do not retry automatically; an operator has to look at it
    Fatal(ReconcileError),
}

impl Outcome {
    pub fn is_done(&self) -> bool {
        matches!(self, Outcome::Done(_))
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, Outcome::Retry(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Outcome::Fatal(_))
    }

    /// The allocation a completed pass left in place, if any
    pub fn allocation(&self) -> Option<&Allocation> {
        match self {
            Outcome::Done(Completion::Verified(a)) | Outcome::Done(Completion::Allocated(a)) => {
                Some(a)
            }
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ReconcileError> {
        match self {
            Outcome::Retry(e) | Outcome::Fatal(e) => Some(e),
            Outcome::Done(_) => None,
        }
    }
}
