//! # Cluster collaborator
//!
//! The reconciler only needs a few things from the cluster: read one service
//! record, write its annotations back, and hold or drop the finalizer that
//! keeps a deleted service around until its listener is gone. Watching,
//! listing and caching stay outside the [`ClusterClient`] trait.
//!
//! - [`ServiceIdentity`]: namespace-qualified service name, the ledger key
//! - [`ServiceRecord`]: the slice of a Service the controller cares about
//! - [`annotations`]: the external-binding record carried in annotations
//! - [`kubernetes`]: `kube` backed implementation
//! - [`memory`]: in-memory implementation with fault injection

pub mod annotations;
pub mod kubernetes;
pub mod memory;

pub use annotations::{BindingRecord, MalformedBinding};
pub use kubernetes::KubeServices;
pub use memory::MemoryCluster;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use annotations::{OPT_IN_ANNOTATION, OPT_IN_VALUE};

/// Held on every exposed service until its listener has been deleted
pub const SERVICE_FINALIZER: &str = "service-nlb.io/release";

/// Errors returned by the cluster collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("Service '{0}' not found")]
    NotFound(ServiceIdentity),

    #[error("Write conflict on service '{0}'")]
    Conflict(ServiceIdentity),

    #[error("Cluster API error: {0}")]
    Api(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }
}

/// Namespace-qualified service name, rendered as `namespace/name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceIdentity {
    pub namespace: String,
    pub name: String,
}

impl ServiceIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid service identity '{0}': expected namespace/name")]
pub struct InvalidIdentity(pub String);

impl FromStr for ServiceIdentity {
    type Err = InvalidIdentity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(InvalidIdentity(s.to_string())),
        }
    }
}

impl TryFrom<String> for ServiceIdentity {
    type Error = InvalidIdentity;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ServiceIdentity> for String {
    fn from(id: ServiceIdentity) -> Self {
        id.to_string()
    }
}

/// Service type as reported by the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceKind {
    NodePort,
    ClusterIp,
    LoadBalancer,
    ExternalName,
    Other(String),
}

impl ServiceKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "NodePort" => ServiceKind::NodePort,
            "ClusterIP" => ServiceKind::ClusterIp,
            "LoadBalancer" => ServiceKind::LoadBalancer,
            "ExternalName" => ServiceKind::ExternalName,
            other => ServiceKind::Other(other.to_string()),
        }
    }
}

/// The parts of a cluster Service the reconciler reads and writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub identity: ServiceIdentity,
    pub kind: ServiceKind,
    /// Port every cluster node forwards to the service (the node port)
    pub backend_port: Option<u16>,
    pub annotations: BTreeMap<String, String>,
    pub finalizers: Vec<String>,
    /// Deletion was requested; the object stays while finalizers remain
    pub deleting: bool,
}

impl ServiceRecord {
    pub fn new(identity: ServiceIdentity, kind: ServiceKind) -> Self {
        Self {
            identity,
            kind,
            backend_port: None,
            annotations: BTreeMap::new(),
            finalizers: Vec::new(),
            deleting: false,
        }
    }

    /// A `NodePort` service that opted in through its annotation
    pub fn node_port(identity: ServiceIdentity, backend_port: u16) -> Self {
        Self::new(identity, ServiceKind::NodePort)
            .with_backend_port(backend_port)
            .with_annotation(OPT_IN_ANNOTATION, OPT_IN_VALUE)
    }

    pub fn with_backend_port(mut self, port: u16) -> Self {
        self.backend_port = Some(port);
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn is_opted_in(&self) -> bool {
        self.annotations.get(OPT_IN_ANNOTATION).map(String::as_str) == Some(OPT_IN_VALUE)
    }

    /// Whether this service should be exposed through the load balancer pool
    pub fn is_eligible(&self) -> bool {
        self.kind == ServiceKind::NodePort && self.is_opted_in()
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers.iter().any(|f| f == SERVICE_FINALIZER)
    }

    /// The recorded external binding, if the service carries one
    pub fn binding(&self) -> Option<Result<BindingRecord, MalformedBinding>> {
        annotations::read_binding(&self.annotations)
    }

    pub fn set_binding(&mut self, binding: &BindingRecord) {
        annotations::write_binding(&mut self.annotations, binding);
    }
}

/// Read/write access to service records.
///
/// Implementations must report a missing service as `Ok(None)` from `get`
/// and as [`ClusterError::NotFound`] from `update`.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get(&self, identity: &ServiceIdentity) -> Result<Option<ServiceRecord>, ClusterError>;

    /// Persist the record's binding annotations
    async fn update(&self, record: &ServiceRecord) -> Result<(), ClusterError>;

    /// Add [`SERVICE_FINALIZER`]; no-op when present
    async fn add_finalizer(&self, identity: &ServiceIdentity) -> Result<(), ClusterError>;

    /// Drop [`SERVICE_FINALIZER`]; a deleting service goes away with it
    async fn remove_finalizer(&self, identity: &ServiceIdentity) -> Result<(), ClusterError>;
}
