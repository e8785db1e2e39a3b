//! Service reconciler
//!
//! One pass per service-changed notification. A pass reads the service,
//! derives its binding state, talks to the provider, and only then touches the
//! ledger and the service's annotations:
//!
//! ```text
//! service gone or deleting ───▶ Deleting ──▶ delete listener ──▶ release ──▶ drop finalizer
//! not eligible ───────────────▶ done
//! eligible ───────────────────▶ hold finalizer, then
//! binding recorded ──▶ validate ──▶ valid ──▶ re-reserve ──▶ done
//!                                 └▶ invalid ──▶ delete stale objects ─┐
//! no binding ─────────────────────────────────────────────────────────┴▶ allocate
//! allocate: find slot ──▶ create listener ──▶ persist record
//!                    (fail: release)     (fail: release + delete, leak = fatal)
//! ```
//!
//! Passes for different services may run concurrently. Passes for the same
//! service must be serialized by the caller.

pub mod outcome;
pub mod retry;

pub use outcome::{BindingState, Completion, Outcome, ReconcileError, SkipReason};
pub use retry::RetryPolicy;

use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use crate::cluster::{BindingRecord, ClusterClient, ServiceIdentity, ServiceRecord};
use crate::ledger::{Allocation, Ledger, LedgerError, Slot};
use crate::provider::{ListenerHandles, LoadBalancerProvider, ProviderError, Validation};

/// What verifying a recorded binding concluded
enum Verification {
    Unbound,
    Valid(Allocation),
    /// Binding abandoned; `abandoned` is the pair it pointed at
    Invalid { abandoned: Option<Slot> },
    Retry(ReconcileError),
}

pub struct Reconciler<P, C> {
    ledger: Arc<Ledger>,
    provider: Arc<P>,
    cluster: Arc<C>,
}

impl<P, C> Reconciler<P, C>
where
    P: LoadBalancerProvider,
    C: ClusterClient,
{
    pub fn new(ledger: Arc<Ledger>, provider: Arc<P>, cluster: Arc<C>) -> Self {
        Self {
            ledger,
            provider,
            cluster,
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    pub fn cluster(&self) -> &Arc<C> {
        &self.cluster
    }

    /// Run one reconciliation pass for `service`
    #[instrument(skip_all, fields(service = %service))]
    pub async fn reconcile(&self, service: &ServiceIdentity) -> Outcome {
        let record = match self.cluster.get(service).await {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Unable to fetch service");
                return Outcome::Retry(ReconcileError::ClusterRead {
                    service: service.clone(),
                    source: e,
                });
            }
        };

        let Some(record) = record else {
            debug!(state = %BindingState::Deleting, "Service does not exist");
            return self.release(service).await;
        };

        if record.deleting {
            debug!(state = %BindingState::Deleting, "Service is being deleted");
            return self.finalize(&record).await;
        }

        if !record.is_eligible() {
            debug!("Service is not an opted-in NodePort service, skipping");
            return Outcome::Done(Completion::Skipped(SkipReason::NotEligible));
        }
        let Some(backend_port) = record.backend_port else {
            warn!("Service has no node port, skipping");
            return Outcome::Done(Completion::Skipped(SkipReason::MissingBackendPort));
        };

        // Finalizer before any provider object exists.
        if !record.has_finalizer() {
            if let Err(e) = self.cluster.add_finalizer(service).await {
                warn!(error = %e, "Unable to add finalizer, will retry");
                return Outcome::Retry(ReconcileError::Finalizer {
                    service: service.clone(),
                    source: e,
                });
            }
        }

        let avoid = match self.verify(&record, backend_port).await {
            Verification::Valid(allocation) => {
                debug!(
                    state = %BindingState::BindingValid,
                    lb = %allocation.load_balancer,
                    port = allocation.port,
                    "Binding verified"
                );
                return Outcome::Done(Completion::Verified(allocation));
            }
            Verification::Retry(e) => return Outcome::Retry(e),
            Verification::Invalid { abandoned } => {
                debug!(state = %BindingState::BindingInvalid, "Reallocating");
                abandoned
            }
            Verification::Unbound => {
                debug!(state = %BindingState::NoBinding, "Allocating");
                None
            }
        };

        self.allocate(&record, backend_port, avoid.as_ref()).await
    }

    /// Release a service that is being deleted, then let it go
    async fn finalize(&self, record: &ServiceRecord) -> Outcome {
        let service = &record.identity;
        let outcome = self.release(service).await;
        if !outcome.is_done() || !record.has_finalizer() {
            return outcome;
        }

        match self.cluster.remove_finalizer(service).await {
            Ok(()) => outcome,
            Err(e) if e.is_not_found() => outcome,
            Err(e) => {
                warn!(error = %e, "Unable to remove finalizer, will retry");
                Outcome::Retry(ReconcileError::Finalizer {
                    service: service.clone(),
                    source: e,
                })
            }
        }
    }

    /// Tear down the allocation of a service that no longer exists.
    ///
    /// The allocation stays in the ledger until the provider confirms the
    /// delete, so a failed delete is retried with the same handles.
    async fn release(&self, service: &ServiceIdentity) -> Outcome {
        let Some(allocation) = self.ledger.get(service) else {
            debug!("No allocation found");
            return Outcome::Done(Completion::NothingToRelease);
        };

        let handles = allocation.handles();
        if !handles.is_empty() {
            info!(
                listener = %handles.listener,
                backend_group = %handles.backend_group,
                "Deleting listener and backend group"
            );
            match self.provider.delete_listener(&handles).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(error = %e, "Unable to delete listener, will retry");
                    return Outcome::Retry(ReconcileError::Provider(e));
                }
            }
        }

        self.ledger.release(service);
        info!(
            lb = %allocation.load_balancer,
            port = allocation.port,
            "Released load balancer port"
        );
        Outcome::Done(Completion::Released(allocation))
    }

    /// Check a recorded binding against the provider and, if it holds,
    /// re-reserve it in the ledger.
    async fn verify(&self, record: &ServiceRecord, backend_port: u16) -> Verification {
        let service = &record.identity;
        let binding = match record.binding() {
            None => return Verification::Unbound,
            Some(Ok(binding)) => binding,
            Some(Err(malformed)) => {
                warn!(reason = %malformed.reason, "Malformed binding record, reallocating");
                return self.abandon(service, malformed.handles, None).await;
            }
        };

        let handles = binding.handles();
        let slot = Slot::new(binding.load_balancer.clone(), binding.port);

        match self
            .provider
            .validate_listener(&handles, &binding.load_balancer, binding.port, backend_port)
            .await
        {
            Ok(Validation::Valid) => {}
            Ok(Validation::Mismatch(mismatch)) => {
                warn!(%mismatch, "Binding does not match the provider, reallocating");
                return self.abandon(service, Some(handles), Some(slot)).await;
            }
            Err(e) if e.is_not_found() => {
                warn!(error = %e, "Bound provider objects are gone, reallocating");
                return self.abandon(service, Some(handles), Some(slot)).await;
            }
            Err(e) => {
                warn!(error = %e, "Unable to validate listener, will retry");
                return Verification::Retry(ReconcileError::Provider(e));
            }
        }

        match self
            .ledger
            .reserve(&binding.load_balancer, binding.port, service, &handles)
        {
            Ok(allocation) => Verification::Valid(allocation),
            Err(LedgerError::Conflict { owner, .. }) => {
                // The listener belongs to whoever holds the pair; leave it alone.
                warn!(%owner, "Recorded pair is held by another service, reallocating");
                Verification::Invalid {
                    abandoned: Some(slot),
                }
            }
            Err(e) => {
                warn!(error = %e, "Recorded pair is outside the pool, reallocating");
                self.abandon(service, Some(handles), Some(slot)).await
            }
        }
    }

    /// Drop a stale binding: free its ledger entry and delete the provider
    /// objects it points at before a new pair is allocated.
    ///
    /// Handles that belong to another service (annotations copied between
    /// services, or a listener since handed to someone else) are left alone.
    async fn abandon(
        &self,
        service: &ServiceIdentity,
        handles: Option<ListenerHandles>,
        slot: Option<Slot>,
    ) -> Verification {
        self.ledger.release(service);

        let Some(handles) = handles else {
            return Verification::Invalid { abandoned: slot };
        };

        if let Some(holder) = self.ledger.listener_holder(&handles.listener) {
            warn!(%holder, listener = %handles.listener, "Stale listener belongs to another service, not deleting it");
            return Verification::Invalid { abandoned: slot };
        }
        if !handles.listener.is_empty() {
            match self.provider.listener_owner(&handles.listener).await {
                Ok(Some(owner)) if owner != *service => {
                    warn!(%owner, listener = %handles.listener, "Stale listener belongs to another service, not deleting it");
                    return Verification::Invalid { abandoned: slot };
                }
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(error = %e, listener = %handles.listener, "Unable to look up stale listener, will retry");
                    return Verification::Retry(ReconcileError::StaleCleanup {
                        service: service.clone(),
                        source: e,
                    });
                }
            }
        }

        match self.provider.delete_listener(&handles).await {
            Ok(()) => {
                info!(listener = %handles.listener, "Deleted stale listener");
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!(error = %e, listener = %handles.listener, "Unable to delete stale listener, will retry");
                return Verification::Retry(ReconcileError::StaleCleanup {
                    service: service.clone(),
                    source: e,
                });
            }
        }
        Verification::Invalid { abandoned: slot }
    }

    async fn allocate(
        &self,
        record: &ServiceRecord,
        backend_port: u16,
        avoid: Option<&Slot>,
    ) -> Outcome {
        let service = &record.identity;

        let slot = match self.ledger.find_free_slot_avoiding(service, avoid) {
            Ok(slot) => slot,
            Err(LedgerError::Exhausted) => {
                warn!(
                    capacity = self.ledger.capacity(),
                    "No free load balancer port, add capacity to the pool"
                );
                return Outcome::Retry(ReconcileError::CapacityExhausted(service.clone()));
            }
            Err(e) => return Outcome::Retry(e.into()),
        };

        let handles = match self
            .provider
            .create_listener(&slot.load_balancer, slot.port, backend_port, service)
            .await
        {
            Ok(handles) => handles,
            Err(e) => {
                self.ledger.release(service);
                match &e {
                    ProviderError::PortInUse { .. } => {
                        warn!(
                            error = %e,
                            lb = %slot.load_balancer,
                            port = slot.port,
                            "Port carries a listener the ledger does not know, trying another pair next; \
                             delete the listener if no service owns it"
                        );
                        self.ledger.block(&slot);
                    }
                    e if e.is_misconfiguration() => error!(
                        error = %e,
                        lb = %slot.load_balancer,
                        "Provider refused the configured load balancer, check the pool"
                    ),
                    e => warn!(
                        error = %e,
                        lb = %slot.load_balancer,
                        port = slot.port,
                        "Unable to create listener"
                    ),
                }
                return Outcome::Retry(ReconcileError::Provider(e));
            }
        };

        let allocation = match self.ledger.attach_handles(service, &handles) {
            Ok(allocation) => allocation,
            Err(e) => return self.roll_back(service, handles, e.into(), false).await,
        };

        let mut updated = record.clone();
        updated.set_binding(&BindingRecord {
            load_balancer: slot.load_balancer.clone(),
            host: self
                .ledger
                .host_of(&slot.load_balancer)
                .unwrap_or_default()
                .to_string(),
            port: slot.port,
            listener: handles.listener.clone(),
            backend_group: handles.backend_group.clone(),
        });

        match self.cluster.update(&updated).await {
            Ok(()) => {
                info!(
                    lb = %slot.load_balancer,
                    port = slot.port,
                    backend_port,
                    "Load balancer assigned and binding recorded"
                );
                Outcome::Done(Completion::Allocated(allocation))
            }
            Err(e) => {
                let gone = e.is_not_found();
                let cause = ReconcileError::Persist {
                    service: service.clone(),
                    source: e,
                };
                self.roll_back(service, handles, cause, gone).await
            }
        }
    }

    /// Undo a half-finished allocation: free the pair and delete the objects
    /// that were just created. If the delete fails the objects are leaked.
    async fn roll_back(
        &self,
        service: &ServiceIdentity,
        handles: ListenerHandles,
        cause: ReconcileError,
        service_gone: bool,
    ) -> Outcome {
        warn!(error = %cause, "Unable to record binding, rolling back");
        self.ledger.release(service);

        match self.provider.delete_listener(&handles).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                error!(
                    error = %e,
                    listener = %handles.listener,
                    backend_group = %handles.backend_group,
                    "SEV0: failed to delete listener for a failed allocation, provider objects leaked"
                );
                return Outcome::Fatal(ReconcileError::LeakedResources {
                    service: service.clone(),
                    handles,
                    source: e,
                });
            }
        }

        if service_gone {
            Outcome::Done(Completion::ServiceGone)
        } else {
            Outcome::Retry(cause)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::annotations::{NLB_LISTENER_ANNOTATION, NLB_PORT_ANNOTATION};
    use crate::cluster::{ClusterError, MemoryCluster, ServiceKind};
    use crate::config::{LoadBalancer, PoolConfig, PortRange, ProviderScope};
    use crate::provider::{MemoryProvider, Operation};

    type TestReconciler = Reconciler<MemoryProvider, MemoryCluster>;

    fn setup(ports: (u16, u16)) -> TestReconciler {
        let pool = PoolConfig::new(
            vec![LoadBalancer::new("lb1", "lb1.example.com")],
            PortRange::new(ports.0, ports.1).unwrap(),
        )
        .unwrap();
        let provider = MemoryProvider::new(ProviderScope::new("vpc-test").unwrap())
            .with_load_balancers(["lb1"])
            .with_instances(["i-1"]);
        Reconciler::new(
            Arc::new(Ledger::new(pool)),
            Arc::new(provider),
            Arc::new(MemoryCluster::new()),
        )
    }

    fn svc(name: &str) -> ServiceIdentity {
        ServiceIdentity::new("ns", name)
    }

    #[tokio::test]
    async fn test_ineligible_service_is_skipped() {
        let r = setup((9000, 9001));
        r.cluster()
            .apply(ServiceRecord::new(svc("a"), ServiceKind::ClusterIp).with_backend_port(30001));

        let outcome = r.reconcile(&svc("a")).await;

        assert!(matches!(
            outcome,
            Outcome::Done(Completion::Skipped(SkipReason::NotEligible))
        ));
        assert_eq!(r.provider().calls(), Default::default());
        assert_eq!(r.ledger().occupied(), 0);
    }

    #[tokio::test]
    async fn test_missing_node_port_is_skipped() {
        let r = setup((9000, 9001));
        let mut record = ServiceRecord::node_port(svc("a"), 30001);
        record.backend_port = None;
        r.cluster().apply(record);

        let outcome = r.reconcile(&svc("a")).await;
        assert!(matches!(
            outcome,
            Outcome::Done(Completion::Skipped(SkipReason::MissingBackendPort))
        ));
    }

    #[tokio::test]
    async fn test_allocation_writes_binding() {
        let r = setup((9000, 9001));
        r.cluster().apply(ServiceRecord::node_port(svc("a"), 30001));

        let outcome = r.reconcile(&svc("a")).await;
        let allocation = outcome.allocation().cloned().unwrap();

        let stored = r.cluster().service(&svc("a")).unwrap();
        let binding = stored.binding().unwrap().unwrap();
        assert_eq!(binding.load_balancer, "lb1");
        assert_eq!(binding.host, "lb1.example.com");
        assert_eq!(binding.port, 9000);
        assert_eq!(binding.listener, allocation.listener);
        assert_eq!(binding.backend_group, allocation.backend_group);
        assert_eq!(r.ledger().get(&svc("a")), Some(allocation));
    }

    #[tokio::test]
    async fn test_cluster_read_failure_retries() {
        let r = setup((9000, 9001));
        r.cluster()
            .fail_next_get(ClusterError::Api("connection refused".to_string()));

        let outcome = r.reconcile(&svc("a")).await;
        assert!(matches!(
            outcome,
            Outcome::Retry(ReconcileError::ClusterRead { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_failure_releases_pair() {
        let r = setup((9000, 9000));
        r.cluster().apply(ServiceRecord::node_port(svc("a"), 30001));
        r.provider().fail_next(
            Operation::CreateListener,
            ProviderError::Transient("throttled".to_string()),
        );

        let outcome = r.reconcile(&svc("a")).await;

        assert!(matches!(outcome, Outcome::Retry(ReconcileError::Provider(_))));
        assert_eq!(r.ledger().occupied(), 0);
        assert!(r.cluster().service(&svc("a")).unwrap().binding().is_none());

        let outcome = r.reconcile(&svc("a")).await;
        assert_eq!(outcome.allocation().unwrap().port, 9000);
    }

    #[tokio::test]
    async fn test_transient_validation_error_keeps_binding() {
        let r = setup((9000, 9001));
        r.cluster().apply(ServiceRecord::node_port(svc("a"), 30001));
        let first = r.reconcile(&svc("a")).await.allocation().cloned().unwrap();

        r.provider().fail_next(
            Operation::ValidateListener,
            ProviderError::Transient("timeout".to_string()),
        );
        let outcome = r.reconcile(&svc("a")).await;

        assert!(outcome.is_retry());
        assert_eq!(r.provider().calls().creates, 1);
        assert_eq!(r.provider().listener(&first.listener).unwrap().port, 9000);
    }

    #[tokio::test]
    async fn test_malformed_binding_reallocates() {
        let r = setup((9000, 9001));
        r.cluster().apply(ServiceRecord::node_port(svc("a"), 30001));
        let first = r.reconcile(&svc("a")).await.allocation().cloned().unwrap();

        let mut record = r.cluster().service(&svc("a")).unwrap();
        record
            .annotations
            .insert(NLB_PORT_ANNOTATION.to_string(), "not-a-port".to_string());
        r.cluster().apply(record);

        let outcome = r.reconcile(&svc("a")).await;
        let second = outcome.allocation().cloned().unwrap();

        assert!(matches!(outcome, Outcome::Done(Completion::Allocated(_))));
        assert_ne!(first.listener, second.listener);
        assert!(r.provider().listener(&first.listener).is_none());
        assert_eq!(r.provider().listener_count(), 1);
    }

    #[tokio::test]
    async fn test_binding_outside_pool_is_replaced() {
        let r = setup((9000, 9001));
        let record = ServiceRecord::node_port(svc("a"), 30001);
        r.cluster().apply(record);
        let first = r.reconcile(&svc("a")).await.allocation().cloned().unwrap();

        // Shrink the pool so the recorded port falls outside it.
        let pool = PoolConfig::new(
            vec![LoadBalancer::new("lb1", "lb1.example.com")],
            PortRange::new(9001, 9001).unwrap(),
        )
        .unwrap();
        let r = Reconciler::new(
            Arc::new(Ledger::new(pool)),
            r.provider().clone(),
            r.cluster().clone(),
        );

        let outcome = r.reconcile(&svc("a")).await;
        let second = outcome.allocation().cloned().unwrap();

        assert_eq!(second.port, 9001);
        assert!(r.provider().listener(&first.listener).is_none());
    }

    #[tokio::test]
    async fn test_stale_delete_failure_retries_without_allocating() {
        let r = setup((9000, 9001));
        r.cluster().apply(ServiceRecord::node_port(svc("a"), 30001));
        let first = r.reconcile(&svc("a")).await.allocation().cloned().unwrap();
        r.provider().set_listener_port(&first.listener, 9005);
        r.provider().fail_next(
            Operation::DeleteListener,
            ProviderError::Transient("throttled".to_string()),
        );

        let outcome = r.reconcile(&svc("a")).await;

        assert!(matches!(
            outcome,
            Outcome::Retry(ReconcileError::StaleCleanup { .. })
        ));
        assert_eq!(r.provider().calls().creates, 1);
        let stored = r.cluster().service(&svc("a")).unwrap();
        assert_eq!(
            stored.annotations.get(NLB_LISTENER_ANNOTATION),
            Some(&first.listener)
        );
    }

    #[tokio::test]
    async fn test_conflicting_binding_does_not_delete_owner_listener() {
        let r = setup((9000, 9001));
        r.cluster().apply(ServiceRecord::node_port(svc("a"), 30001));
        let owner = r.reconcile(&svc("a")).await.allocation().cloned().unwrap();

        // A copy of a's annotations on another service with the same node port.
        let mut copy = r.cluster().service(&svc("a")).unwrap();
        copy.identity = svc("b");
        r.cluster().apply(copy);

        let outcome = r.reconcile(&svc("b")).await;
        let copy_alloc = outcome.allocation().cloned();

        assert!(matches!(outcome, Outcome::Done(Completion::Allocated(_))));
        assert!(r.provider().listener(&owner.listener).is_some());
        assert_eq!(r.ledger().owner_of("lb1", 9000), Some(svc("a")));
        assert_eq!(copy_alloc.unwrap().port, 9001);
    }

    #[tokio::test]
    async fn test_copied_binding_with_other_node_port_keeps_owner_listener() {
        let r = setup((9000, 9001));
        r.cluster().apply(ServiceRecord::node_port(svc("a"), 30001));
        let owner = r.reconcile(&svc("a")).await.allocation().cloned().unwrap();

        // b carries a's annotations but forwards to a different node port, so
        // validation reports a backend port mismatch.
        let mut copy = r.cluster().service(&svc("a")).unwrap();
        copy.identity = svc("b");
        copy.backend_port = Some(30002);
        r.cluster().apply(copy);

        let outcome = r.reconcile(&svc("b")).await;

        assert_eq!(outcome.allocation().unwrap().port, 9001);
        assert!(r.provider().listener(&owner.listener).is_some());
        assert!(r.provider().backend_group(&owner.backend_group).is_some());
        let again = r.reconcile(&svc("a")).await;
        assert!(matches!(again, Outcome::Done(Completion::Verified(ref a)) if a.port == 9000));
    }

    #[tokio::test]
    async fn test_copied_binding_after_restart_keeps_owner_listener() {
        let r = setup((9000, 9001));
        r.cluster().apply(ServiceRecord::node_port(svc("a"), 30001));
        let owner = r.reconcile(&svc("a")).await.allocation().cloned().unwrap();

        let mut copy = r.cluster().service(&svc("a")).unwrap();
        copy.identity = svc("b");
        copy.backend_port = Some(30002);
        r.cluster().apply(copy);

        // Fresh ledger: only the provider knows who owns the listener.
        let pool = PoolConfig::new(
            vec![LoadBalancer::new("lb1", "lb1.example.com")],
            PortRange::new(9000, 9001).unwrap(),
        )
        .unwrap();
        let r = Reconciler::new(
            Arc::new(Ledger::new(pool)),
            r.provider().clone(),
            r.cluster().clone(),
        );

        let outcome = r.reconcile(&svc("b")).await;
        assert_eq!(outcome.allocation().unwrap().port, 9001);
        assert!(r.provider().listener(&owner.listener).is_some());

        let again = r.reconcile(&svc("a")).await;
        assert!(matches!(again, Outcome::Done(Completion::Verified(ref a)) if a.port == 9000));
    }

    #[tokio::test]
    async fn test_malformed_copy_keeps_owner_listener() {
        let r = setup((9000, 9001));
        r.cluster().apply(ServiceRecord::node_port(svc("a"), 30001));
        let owner = r.reconcile(&svc("a")).await.allocation().cloned().unwrap();

        let mut copy = r.cluster().service(&svc("a")).unwrap();
        copy.identity = svc("b");
        copy.backend_port = Some(30002);
        copy.annotations
            .insert(NLB_PORT_ANNOTATION.to_string(), "garbage".to_string());
        r.cluster().apply(copy);

        let outcome = r.reconcile(&svc("b")).await;

        assert!(matches!(outcome, Outcome::Done(Completion::Allocated(_))));
        assert!(r.provider().listener(&owner.listener).is_some());
        assert_eq!(r.provider().listener_count(), 2);
    }

    #[tokio::test]
    async fn test_owner_lookup_failure_retries_without_deleting() {
        let r = setup((9000, 9001));
        r.cluster().apply(ServiceRecord::node_port(svc("a"), 30001));
        let first = r.reconcile(&svc("a")).await.allocation().cloned().unwrap();
        r.provider().set_listener_port(&first.listener, 9005);
        r.provider().fail_next(
            Operation::DescribeListener,
            ProviderError::Transient("throttled".to_string()),
        );

        let outcome = r.reconcile(&svc("a")).await;

        assert!(matches!(
            outcome,
            Outcome::Retry(ReconcileError::StaleCleanup { .. })
        ));
        assert_eq!(r.provider().calls().deletes, 0);
    }

    #[tokio::test]
    async fn test_foreign_listener_on_free_pair_is_skipped() {
        let r = setup((9000, 9001));
        r.provider()
            .insert_listener("lb1", 9000, 31000, &svc("forgotten"));
        r.cluster().apply(ServiceRecord::node_port(svc("a"), 30001));

        let first = r.reconcile(&svc("a")).await;
        assert!(matches!(
            first,
            Outcome::Retry(ReconcileError::Provider(ProviderError::PortInUse { .. }))
        ));
        assert_eq!(r.ledger().occupied(), 0);
        assert!(r.ledger().is_blocked(&Slot::new("lb1", 9000)));

        let second = r.reconcile(&svc("a")).await;
        assert_eq!(second.allocation().unwrap().port, 9001);
    }

    #[tokio::test]
    async fn test_unknown_load_balancer_retries_and_frees_pair() {
        let pool = PoolConfig::new(
            vec![LoadBalancer::new("lb-missing", "lb.example.com")],
            PortRange::new(9000, 9001).unwrap(),
        )
        .unwrap();
        let r: TestReconciler = Reconciler::new(
            Arc::new(Ledger::new(pool)),
            Arc::new(
                MemoryProvider::new(ProviderScope::new("vpc-test").unwrap())
                    .with_load_balancers(["lb1"]),
            ),
            Arc::new(MemoryCluster::new()),
        );
        r.cluster().apply(ServiceRecord::node_port(svc("a"), 30001));

        let outcome = r.reconcile(&svc("a")).await;

        match outcome {
            Outcome::Retry(ReconcileError::Provider(e)) => assert!(e.is_misconfiguration()),
            other => panic!("expected retry, got {:?}", other),
        }
        assert_eq!(r.ledger().occupied(), 0);
        assert!(!r.ledger().is_blocked(&Slot::new("lb-missing", 9000)));
    }

    #[tokio::test]
    async fn test_update_conflict_rolls_back_and_retries() {
        let r = setup((9000, 9001));
        r.cluster().apply(ServiceRecord::node_port(svc("a"), 30001));
        r.cluster().fail_next_update(ClusterError::Conflict(svc("a")));

        let outcome = r.reconcile(&svc("a")).await;

        assert!(matches!(outcome, Outcome::Retry(ReconcileError::Persist { .. })));
        assert_eq!(r.ledger().occupied(), 0);
        assert_eq!(r.provider().listener_count(), 0);
        assert_eq!(r.provider().backend_group_count(), 0);
    }

    #[tokio::test]
    async fn test_service_vanishing_mid_allocation_is_done() {
        let r = setup((9000, 9001));
        r.cluster().apply(ServiceRecord::node_port(svc("a"), 30001));
        r.cluster().fail_next_update(ClusterError::NotFound(svc("a")));

        let outcome = r.reconcile(&svc("a")).await;

        assert!(matches!(outcome, Outcome::Done(Completion::ServiceGone)));
        assert_eq!(r.provider().listener_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_rollback_is_fatal() {
        let r = setup((9000, 9001));
        r.cluster().apply(ServiceRecord::node_port(svc("a"), 30001));
        r.cluster()
            .fail_next_update(ClusterError::Api("etcd unavailable".to_string()));
        r.provider().fail_next(
            Operation::DeleteListener,
            ProviderError::Transient("throttled".to_string()),
        );

        let outcome = r.reconcile(&svc("a")).await;

        match outcome {
            Outcome::Fatal(ReconcileError::LeakedResources { handles, .. }) => {
                assert!(r.provider().listener(&handles.listener).is_some());
            }
            other => panic!("expected fatal leak, got {:?}", other),
        }
        assert_eq!(r.ledger().occupied(), 0);
    }

    #[tokio::test]
    async fn test_allocation_holds_finalizer() {
        let r = setup((9000, 9001));
        r.cluster().apply(ServiceRecord::node_port(svc("a"), 30001));

        r.reconcile(&svc("a")).await;

        assert!(r.cluster().service(&svc("a")).unwrap().has_finalizer());
    }

    #[tokio::test]
    async fn test_finalizer_failure_retries_before_allocating() {
        let r = setup((9000, 9001));
        r.cluster().apply(ServiceRecord::node_port(svc("a"), 30001));
        r.cluster()
            .fail_next_finalizer(ClusterError::Api("unavailable".to_string()));

        let outcome = r.reconcile(&svc("a")).await;

        assert!(matches!(outcome, Outcome::Retry(ReconcileError::Finalizer { .. })));
        assert_eq!(r.provider().calls().creates, 0);
        assert_eq!(r.ledger().occupied(), 0);
    }

    #[tokio::test]
    async fn test_deleting_service_is_released_then_let_go() {
        let r = setup((9000, 9001));
        r.cluster().apply(ServiceRecord::node_port(svc("a"), 30001));
        r.reconcile(&svc("a")).await;
        assert!(!r.cluster().delete(&svc("a")));

        let outcome = r.reconcile(&svc("a")).await;

        assert!(matches!(outcome, Outcome::Done(Completion::Released(_))));
        assert!(r.cluster().service(&svc("a")).is_none());
        assert_eq!(r.provider().listener_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_release_keeps_finalizer() {
        let r = setup((9000, 9001));
        r.cluster().apply(ServiceRecord::node_port(svc("a"), 30001));
        r.reconcile(&svc("a")).await;
        r.cluster().delete(&svc("a"));
        r.provider().fail_next(
            Operation::DeleteListener,
            ProviderError::Transient("throttled".to_string()),
        );

        let outcome = r.reconcile(&svc("a")).await;

        assert!(outcome.is_retry());
        let held = r.cluster().service(&svc("a")).unwrap();
        assert!(held.deleting && held.has_finalizer());
        assert!(r.ledger().get(&svc("a")).is_some());
    }

    #[tokio::test]
    async fn test_absent_service_without_allocation_is_noop() {
        let r = setup((9000, 9001));
        let outcome = r.reconcile(&svc("ghost")).await;

        assert!(matches!(
            outcome,
            Outcome::Done(Completion::NothingToRelease)
        ));
        assert_eq!(r.provider().calls().deletes, 0);
    }
}
