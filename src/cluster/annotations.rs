//! External-binding record stored in service annotations
//!
//! These keys are the only persisted output of the controller. Anything
//! reading a Service can discover its external host and port through them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provider::ListenerHandles;

/// Opt-in marker a service must carry to be exposed
pub const OPT_IN_ANNOTATION: &str = "github.com/chinmayrelkar/service";
pub const OPT_IN_VALUE: &str = "true";

pub const NLB_NAME_ANNOTATION: &str = "service-nlb-name";
pub const NLB_HOST_ANNOTATION: &str = "service-nlb-host";
pub const NLB_PORT_ANNOTATION: &str = "service-nlb-port";
pub const NLB_LISTENER_ANNOTATION: &str = "service-nlb-listener";
pub const NLB_TARGET_ANNOTATION: &str = "service-nlb-target";

/// Every annotation key owned by the controller
pub const BINDING_ANNOTATIONS: [&str; 5] = [
    NLB_NAME_ANNOTATION,
    NLB_HOST_ANNOTATION,
    NLB_PORT_ANNOTATION,
    NLB_LISTENER_ANNOTATION,
    NLB_TARGET_ANNOTATION,
];

/// A service's recorded (load balancer, port) binding and provider handles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRecord {
    pub load_balancer: String,
    pub host: String,
    pub port: u16,
    pub listener: String,
    pub backend_group: String,
}

impl BindingRecord {
    pub fn handles(&self) -> ListenerHandles {
        ListenerHandles::new(self.listener.clone(), self.backend_group.clone())
    }
}

/// A binding record that names a load balancer but cannot be used as is
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Malformed binding record: {reason}")]
pub struct MalformedBinding {
    pub reason: String,
    /// Handles that were still readable, for cleaning up what they point at
    pub handles: Option<ListenerHandles>,
}

fn non_empty<'a>(annotations: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    annotations
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

/// Read the binding record.
///
/// Returns `None` when no load balancer name is recorded, which means the
/// service was never bound.
pub fn read_binding(
    annotations: &BTreeMap<String, String>,
) -> Option<Result<BindingRecord, MalformedBinding>> {
    let load_balancer = non_empty(annotations, NLB_NAME_ANNOTATION)?;

    let listener = non_empty(annotations, NLB_LISTENER_ANNOTATION);
    let backend_group = non_empty(annotations, NLB_TARGET_ANNOTATION);
    let handles = match (listener, backend_group) {
        (Some(l), Some(g)) => Some(ListenerHandles::new(l, g)),
        _ => None,
    };

    let malformed = |reason: String| MalformedBinding {
        reason,
        handles: handles.clone(),
    };

    let port = match non_empty(annotations, NLB_PORT_ANNOTATION) {
        None => return Some(Err(malformed(format!("missing {}", NLB_PORT_ANNOTATION)))),
        Some(raw) => match raw.parse::<u16>() {
            Ok(p) => p,
            Err(_) => return Some(Err(malformed(format!("invalid port '{}'", raw)))),
        },
    };

    let Some(recorded) = handles.clone() else {
        return Some(Err(malformed("missing listener or target handle".to_string())));
    };

    Some(Ok(BindingRecord {
        load_balancer: load_balancer.to_string(),
        host: annotations
            .get(NLB_HOST_ANNOTATION)
            .cloned()
            .unwrap_or_default(),
        port,
        listener: recorded.listener,
        backend_group: recorded.backend_group,
    }))
}

pub fn write_binding(annotations: &mut BTreeMap<String, String>, binding: &BindingRecord) {
    annotations.insert(NLB_NAME_ANNOTATION.to_string(), binding.load_balancer.clone());
    annotations.insert(NLB_HOST_ANNOTATION.to_string(), binding.host.clone());
    annotations.insert(NLB_PORT_ANNOTATION.to_string(), binding.port.to_string());
    annotations.insert(NLB_LISTENER_ANNOTATION.to_string(), binding.listener.clone());
    annotations.insert(NLB_TARGET_ANNOTATION.to_string(), binding.backend_group.clone());
}
