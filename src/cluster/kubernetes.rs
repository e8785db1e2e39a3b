//! Kubernetes-backed cluster collaborator
//!
//! Reads core/v1 `Service` objects and writes the binding annotations back
//! with a JSON merge patch, so only the controller's own keys are touched.
//! Finalizer changes carry the resource version they were computed from and
//! fail with a conflict when another writer got there first.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::annotations::BINDING_ANNOTATIONS;
use super::{
    ClusterClient, ClusterError, ServiceIdentity, ServiceKind, ServiceRecord, SERVICE_FINALIZER,
};

#[derive(Clone)]
pub struct KubeServices {
    client: Client,
}

impl KubeServices {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn api(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Rewrite the finalizer list of one service from its current state
    async fn patch_finalizers(
        &self,
        identity: &ServiceIdentity,
        edit: impl FnOnce(&mut Vec<String>) -> bool,
    ) -> Result<(), ClusterError> {
        let api = self.api(&identity.namespace);
        let service = api
            .get(&identity.name)
            .await
            .map_err(|e| map_error(identity, e))?;

        let mut finalizers = service.metadata.finalizers.clone().unwrap_or_default();
        if !edit(&mut finalizers) {
            return Ok(());
        }

        let patch = finalizer_patch(&finalizers, service.metadata.resource_version.as_deref());
        api.patch(&identity.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_error(identity, e))?;
        Ok(())
    }
}

/// Project a Service onto the fields the reconciler uses.
///
/// The backend port is the node port of the first declared port.
pub fn service_record(identity: ServiceIdentity, service: &Service) -> ServiceRecord {
    let spec = service.spec.as_ref();
    let kind = spec
        .and_then(|s| s.type_.as_deref())
        .map(ServiceKind::parse)
        .unwrap_or(ServiceKind::ClusterIp);
    let backend_port = spec
        .and_then(|s| s.ports.as_ref())
        .and_then(|ports| ports.first())
        .and_then(|p| p.node_port)
        .and_then(|p| u16::try_from(p).ok());

    ServiceRecord {
        identity,
        kind,
        backend_port,
        annotations: service.metadata.annotations.clone().unwrap_or_default(),
        finalizers: service.metadata.finalizers.clone().unwrap_or_default(),
        deleting: service.metadata.deletion_timestamp.is_some(),
    }
}

/// Merge patch replacing the finalizer list, guarded by `resource_version`
pub fn finalizer_patch(finalizers: &[String], resource_version: Option<&str>) -> Value {
    let mut metadata = Map::new();
    metadata.insert("finalizers".to_string(), json!(finalizers));
    if let Some(version) = resource_version {
        metadata.insert("resourceVersion".to_string(), json!(version));
    }
    json!({ "metadata": metadata })
}

/// Merge patch setting every binding key present in `annotations` and
/// removing the ones that are absent.
pub fn binding_patch(annotations: &BTreeMap<String, String>) -> Value {
    let mut keys = Map::new();
    for key in BINDING_ANNOTATIONS {
        let value = annotations
            .get(key)
            .map(|v| Value::String(v.clone()))
            .unwrap_or(Value::Null);
        keys.insert(key.to_string(), value);
    }
    json!({ "metadata": { "annotations": keys } })
}

fn map_error(identity: &ServiceIdentity, err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => ClusterError::NotFound(identity.clone()),
        kube::Error::Api(resp) if resp.code == 409 => ClusterError::Conflict(identity.clone()),
        other => ClusterError::Api(other.to_string()),
    }
}

#[async_trait]
impl ClusterClient for KubeServices {
    async fn get(&self, identity: &ServiceIdentity) -> Result<Option<ServiceRecord>, ClusterError> {
        let service = self
            .api(&identity.namespace)
            .get_opt(&identity.name)
            .await
            .map_err(|e| map_error(identity, e))?;
        Ok(service.map(|s| service_record(identity.clone(), &s)))
    }

    async fn update(&self, record: &ServiceRecord) -> Result<(), ClusterError> {
        let patch = binding_patch(&record.annotations);
        self.api(&record.identity.namespace)
            .patch(
                &record.identity.name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| map_error(&record.identity, e))?;
        Ok(())
    }

    async fn add_finalizer(&self, identity: &ServiceIdentity) -> Result<(), ClusterError> {
        self.patch_finalizers(identity, |finalizers| {
            if finalizers.iter().any(|f| f == SERVICE_FINALIZER) {
                return false;
            }
            finalizers.push(SERVICE_FINALIZER.to_string());
            true
        })
        .await?;
        debug!(service = %identity, "Finalizer added");
        Ok(())
    }

    async fn remove_finalizer(&self, identity: &ServiceIdentity) -> Result<(), ClusterError> {
        self.patch_finalizers(identity, |finalizers| {
            let before = finalizers.len();
            finalizers.retain(|f| f != SERVICE_FINALIZER);
            finalizers.len() != before
        })
        .await?;
        info!(service = %identity, "Finalizer removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::annotations::{NLB_NAME_ANNOTATION, NLB_PORT_ANNOTATION, OPT_IN_ANNOTATION};
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn node_port_service(node_port: Option<i32>) -> Service {
        let mut annotations = BTreeMap::new();
        annotations.insert(OPT_IN_ANNOTATION.to_string(), "true".to_string());
        Service {
            metadata: ObjectMeta {
                name: Some("api".to_string()),
                namespace: Some("payments".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("NodePort".to_string()),
                ports: Some(vec![ServicePort {
                    port: 80,
                    node_port,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_service_record_projection() {
        let id = ServiceIdentity::new("payments", "api");
        let record = service_record(id.clone(), &node_port_service(Some(30080)));

        assert_eq!(record.identity, id);
        assert_eq!(record.kind, ServiceKind::NodePort);
        assert_eq!(record.backend_port, Some(30080));
        assert!(record.is_eligible());
    }

    #[test]
    fn test_service_without_node_port() {
        let id = ServiceIdentity::new("payments", "api");
        let record = service_record(id, &node_port_service(None));
        assert_eq!(record.backend_port, None);
    }

    #[test]
    fn test_default_kind_is_cluster_ip() {
        let id = ServiceIdentity::new("payments", "api");
        let record = service_record(id, &Service::default());
        assert_eq!(record.kind, ServiceKind::ClusterIp);
        assert!(record.annotations.is_empty());
    }

    #[test]
    fn test_binding_patch_sets_and_removes() {
        let mut annotations = BTreeMap::new();
        annotations.insert(NLB_NAME_ANNOTATION.to_string(), "lb1".to_string());
        annotations.insert(NLB_PORT_ANNOTATION.to_string(), "9000".to_string());
        annotations.insert(OPT_IN_ANNOTATION.to_string(), "true".to_string());

        let patch = binding_patch(&annotations);
        let keys = &patch["metadata"]["annotations"];

        assert_eq!(keys[NLB_NAME_ANNOTATION], "lb1");
        assert_eq!(keys[NLB_PORT_ANNOTATION], "9000");
        assert!(keys["service-nlb-listener"].is_null());
        assert!(keys.get(OPT_IN_ANNOTATION).is_none());
    }

    #[test]
    fn test_deleting_service_projection() {
        let mut service = node_port_service(Some(30080));
        service.metadata.finalizers = Some(vec![SERVICE_FINALIZER.to_string()]);
        service.metadata.deletion_timestamp = Some(Time(Default::default()));

        let record = service_record(ServiceIdentity::new("payments", "api"), &service);
        assert!(record.deleting);
        assert!(record.has_finalizer());
    }

    #[test]
    fn test_finalizer_patch_carries_resource_version() {
        let finalizers = vec!["other.io/keep".to_string()];
        let patch = finalizer_patch(&finalizers, Some("42"));
        assert_eq!(patch["metadata"]["finalizers"][0], "other.io/keep");
        assert_eq!(patch["metadata"]["resourceVersion"], "42");

        let empty = finalizer_patch(&[], None);
        assert!(empty["metadata"]["finalizers"].as_array().unwrap().is_empty());
        assert!(empty["metadata"].get("resourceVersion").is_none());
    }
}
