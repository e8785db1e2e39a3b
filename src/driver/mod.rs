//! Service controller
//!
//! Runs the reconciler under `kube::runtime::Controller`. The controller
//! owns the watch, the work queue and the per-object serialization: one
//! service is never reconciled twice at once, and a requeue for a service
//! that is already scheduled is merged into the earlier one.
//!
//! What the runtime does not know about lives in [`Context`]: the retry
//! policy, the consecutive-failure counter per service and the registry of
//! fatal incidents served on the status endpoint.

use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, ResourceExt};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterClient, ServiceIdentity};
use crate::provider::LoadBalancerProvider;
use crate::reconciler::{Completion, Outcome, ReconcileError, Reconciler, RetryPolicy};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Identities whose last pass ended fatally, with the reason
pub type Incidents = Arc<DashMap<ServiceIdentity, ReconcileError>>;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Reconciliation of {service} failed: {source}")]
    Reconcile {
        service: ServiceIdentity,
        source: ReconcileError,
    },

    #[error("Service '{0}' has no namespace")]
    MissingNamespace(String),
}

/// Shared state handed to every reconcile and error-policy call
pub struct Context<P, C> {
    reconciler: Arc<Reconciler<P, C>>,
    retry: RetryPolicy,
    attempts: DashMap<ServiceIdentity, u32>,
    incidents: Incidents,
}

impl<P, C> Context<P, C>
where
    P: LoadBalancerProvider,
    C: ClusterClient,
{
    pub fn new(reconciler: Arc<Reconciler<P, C>>, retry: RetryPolicy) -> Self {
        Self {
            reconciler,
            retry,
            attempts: DashMap::new(),
            incidents: Arc::new(DashMap::new()),
        }
    }

    pub fn reconciler(&self) -> &Arc<Reconciler<P, C>> {
        &self.reconciler
    }

    pub fn incidents(&self) -> Incidents {
        self.incidents.clone()
    }

    /// Consecutive retryable failures recorded for `service`
    pub fn attempts(&self, service: &ServiceIdentity) -> u32 {
        self.attempts.get(service).map(|a| *a).unwrap_or(0)
    }

    /// Run one pass and translate its outcome for the controller runtime.
    ///
    /// A retry comes back as an error so the runtime hands it to
    /// [`error_policy`]; everything else waits for the next change.
    pub async fn reconcile_identity(
        &self,
        service: &ServiceIdentity,
    ) -> Result<Action, DriverError> {
        let outcome = self.reconciler.reconcile(service).await;
        self.settle(service, outcome)
    }

    fn settle(&self, service: &ServiceIdentity, outcome: Outcome) -> Result<Action, DriverError> {
        match outcome {
            Outcome::Done(completion) => {
                self.attempts.remove(service);
                self.incidents.remove(service);
                log_completion(service, &completion);
                Ok(Action::await_change())
            }
            Outcome::Retry(source) => Err(DriverError::Reconcile {
                service: service.clone(),
                source,
            }),
            Outcome::Fatal(e) => {
                self.attempts.remove(service);
                error!(
                    service = %service,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Reconciliation failed fatally, operator action required"
                );
                self.incidents.insert(service.clone(), e);
                Ok(Action::await_change())
            }
        }
    }

    /// Count a failed pass and pick the requeue delay for it
    pub fn backoff(&self, error: &DriverError) -> Action {
        let DriverError::Reconcile { service, source } = error else {
            warn!(error = %error, "Ignoring service until it changes");
            return Action::await_change();
        };

        let attempt = {
            let mut entry = self.attempts.entry(service.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        match self.retry.delay_for(attempt) {
            Some(delay) => {
                warn!(
                    service = %service,
                    error = %source,
                    attempt,
                    "Reconciliation failed, requeueing in {:?}",
                    delay
                );
                Action::requeue(delay)
            }
            None => {
                self.attempts.remove(service);
                error!(
                    service = %service,
                    error = %source,
                    attempt,
                    "Giving up until the service changes again"
                );
                Action::await_change()
            }
        }
    }
}

fn identity_of(service: &Service) -> Result<ServiceIdentity, DriverError> {
    let name = service.name_any();
    match service.namespace() {
        Some(ns) => Ok(ServiceIdentity::new(ns, name)),
        None => Err(DriverError::MissingNamespace(name)),
    }
}

/// Controller reconcile entry point
pub async fn reconcile<P, C>(
    service: Arc<Service>,
    ctx: Arc<Context<P, C>>,
) -> Result<Action, DriverError>
where
    P: LoadBalancerProvider,
    C: ClusterClient,
{
    let identity = identity_of(&service)?;
    debug!(service = %identity, "Service changed");
    ctx.reconcile_identity(&identity).await
}

/// Controller error policy: backoff from the retry policy, per service
pub fn error_policy<P, C>(
    _service: Arc<Service>,
    error: &DriverError,
    ctx: Arc<Context<P, C>>,
) -> Action
where
    P: LoadBalancerProvider,
    C: ClusterClient,
{
    ctx.backoff(error)
}

/// Watch services through `api` and reconcile them until a termination
/// signal arrives.
///
/// The initial listing is reconciled too, which is what repopulates the
/// ledger after a restart.
pub async fn run<P, C>(api: Api<Service>, ctx: Arc<Context<P, C>>)
where
    P: LoadBalancerProvider + 'static,
    C: ClusterClient + 'static,
{
    info!("- Service controller");

    Controller::new(api, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .shutdown_on_signal()
        .run(reconcile::<P, C>, error_policy::<P, C>, ctx)
        .for_each(log_reconcile_result("Service"))
        .await;

    info!("Service controller stopped");
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => debug!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

fn log_completion(service: &ServiceIdentity, completion: &Completion) {
    match completion {
        Completion::Allocated(a) => info!(
            service = %service,
            lb = %a.load_balancer,
            port = a.port,
            "Reconciliation completed: allocated"
        ),
        Completion::Released(a) => info!(
            service = %service,
            lb = %a.load_balancer,
            port = a.port,
            "Reconciliation completed: released"
        ),
        other => debug!(service = %service, completion = ?other, "Reconciliation completed"),
    }
}
