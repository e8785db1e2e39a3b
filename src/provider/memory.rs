//! In-memory load balancer provider
//!
//! Models the flat forwarding setup the controller drives: named load
//! balancers, listeners bound to one port each, and backend groups named after
//! the backend port they forward to. It keeps the gateway contract exactly
//! (group reuse, target registration, not-found-is-deleted) and adds call
//! counters plus per-operation fault injection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ListenerHandles, ListenerMismatch, LoadBalancerProvider, ProviderError, Validation};
use crate::cluster::ServiceIdentity;
use crate::config::ProviderScope;

/// Provider operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateListener,
    ValidateListener,
    DeleteListener,
    /// Second half of a delete, after the listener is gone
    DeleteBackendGroup,
    DescribeListener,
}

/// Number of calls made to each gateway operation, failed ones included
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub creates: usize,
    pub validations: usize,
    pub deletes: usize,
}

impl CallCounts {
    /// Calls that change provider state
    pub fn mutations(&self) -> usize {
        self.creates + self.deletes
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerInfo {
    pub load_balancer: String,
    pub port: u16,
    pub backend_group: String,
    pub owner: ServiceIdentity,
    /// Free-text label, `namespace-name` of the owner
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub instance_id: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendGroupInfo {
    pub name: String,
    pub port: u16,
    pub protocol: String,
    pub vpc_id: String,
    pub targets: Vec<Target>,
}

#[derive(Default)]
struct State {
    load_balancers: HashSet<String>,
    instances: Vec<String>,
    listeners: HashMap<String, ListenerInfo>,
    groups: HashMap<String, BackendGroupInfo>,
}

pub struct MemoryProvider {
    scope: ProviderScope,
    state: Mutex<State>,
    faults: Mutex<HashMap<Operation, VecDeque<ProviderError>>>,
    creates: AtomicUsize,
    validations: AtomicUsize,
    deletes: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryProvider {
    pub fn new(scope: ProviderScope) -> Self {
        Self {
            scope,
            state: Mutex::new(State::default()),
            faults: Mutex::new(HashMap::new()),
            creates: AtomicUsize::new(0),
            validations: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    /// Register load balancers that listeners may be created on
    pub fn with_load_balancers<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        lock(&self.state)
            .load_balancers
            .extend(names.into_iter().map(Into::into));
        self
    }

    /// Register compute instances of the configured network
    pub fn with_instances<I, S>(self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        lock(&self.state)
            .instances
            .extend(ids.into_iter().map(Into::into));
        self
    }

    /// Queue an error for the next call of `op`
    pub fn fail_next(&self, op: Operation, error: ProviderError) {
        lock(&self.faults).entry(op).or_default().push_back(error);
    }

    pub fn calls(&self) -> CallCounts {
        CallCounts {
            creates: self.creates.load(Ordering::SeqCst),
            validations: self.validations.load(Ordering::SeqCst),
            deletes: self.deletes.load(Ordering::SeqCst),
        }
    }

    pub fn listener(&self, handle: &str) -> Option<ListenerInfo> {
        lock(&self.state).listeners.get(handle).cloned()
    }

    pub fn backend_group(&self, handle: &str) -> Option<BackendGroupInfo> {
        lock(&self.state).groups.get(handle).cloned()
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.state).listeners.len()
    }

    pub fn backend_group_count(&self) -> usize {
        lock(&self.state).groups.len()
    }

    /// Change a listener's port behind the controller's back
    pub fn set_listener_port(&self, handle: &str, port: u16) -> bool {
        match lock(&self.state).listeners.get_mut(handle) {
            Some(listener) => {
                listener.port = port;
                true
            }
            None => false,
        }
    }

    /// Create a listener behind the controller's back, as another tool or a
    /// previous controller run would have left it
    pub fn insert_listener(
        &self,
        load_balancer: &str,
        port: u16,
        backend_port: u16,
        owner: &ServiceIdentity,
    ) -> ListenerHandles {
        let mut state = lock(&self.state);
        let group = self.ensure_backend_group(&mut state, backend_port);
        let listener = self.handle("listener/net", load_balancer);
        state.listeners.insert(
            listener.clone(),
            ListenerInfo {
                load_balancer: load_balancer.to_string(),
                port,
                backend_group: group.clone(),
                owner: owner.clone(),
                description: owner.to_string().replacen('/', "-", 1),
            },
        );
        ListenerHandles::new(listener, group)
    }

    /// Delete a listener behind the controller's back
    pub fn remove_listener(&self, handle: &str) -> Option<ListenerInfo> {
        lock(&self.state).listeners.remove(handle)
    }

    fn take_fault(&self, op: Operation) -> Result<(), ProviderError> {
        match lock(&self.faults).get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn handle(&self, kind: &str, name: &str) -> String {
        format!(
            "arn:memory:elasticloadbalancing:{}:{}/{}/{}",
            self.scope.region,
            kind,
            name,
            Uuid::new_v4().simple()
        )
    }

    /// Find the backend group for `backend_port`, creating and populating it
    /// when it does not exist yet.
    fn ensure_backend_group(&self, state: &mut State, backend_port: u16) -> String {
        let name = backend_port.to_string();
        if let Some((handle, _)) = state.groups.iter().find(|(_, g)| g.name == name) {
            debug!(backend_group = %handle, "Reusing backend group");
            return handle.clone();
        }

        let handle = self.handle("targetgroup", &name);
        let targets = state
            .instances
            .iter()
            .map(|id| Target {
                instance_id: id.clone(),
                port: backend_port,
            })
            .collect::<Vec<_>>();
        info!(
            backend_group = %handle,
            targets = targets.len(),
            "Created backend group"
        );
        state.groups.insert(
            handle.clone(),
            BackendGroupInfo {
                name,
                port: backend_port,
                protocol: self.scope.protocol.clone(),
                vpc_id: self.scope.vpc_id.clone(),
                targets,
            },
        );
        handle
    }
}

#[async_trait]
impl LoadBalancerProvider for MemoryProvider {
    async fn create_listener(
        &self,
        load_balancer: &str,
        port: u16,
        backend_port: u16,
        service: &ServiceIdentity,
    ) -> Result<ListenerHandles, ProviderError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.take_fault(Operation::CreateListener)?;

        let mut state = lock(&self.state);
        if !state.load_balancers.contains(load_balancer) {
            return Err(ProviderError::LoadBalancerNotFound(load_balancer.to_string()));
        }

        let existing = state
            .listeners
            .iter()
            .find(|(_, l)| l.load_balancer == load_balancer && l.port == port)
            .map(|(handle, l)| (handle.clone(), l.clone()));
        if let Some((handle, existing)) = existing {
            let same_backend = state
                .groups
                .get(&existing.backend_group)
                .is_some_and(|g| g.port == backend_port);
            if same_backend && existing.owner == *service {
                return Ok(ListenerHandles::new(handle, existing.backend_group));
            }
            debug!(
                listener = %handle,
                owner = %existing.owner,
                "Port already carries a listener"
            );
            return Err(ProviderError::PortInUse {
                load_balancer: load_balancer.to_string(),
                port,
            });
        }

        let group = self.ensure_backend_group(&mut state, backend_port);

        let listener = self.handle("listener/net", load_balancer);
        state.listeners.insert(
            listener.clone(),
            ListenerInfo {
                load_balancer: load_balancer.to_string(),
                port,
                backend_group: group.clone(),
                owner: service.clone(),
                description: service.to_string().replacen('/', "-", 1),
            },
        );
        info!(%listener, lb = load_balancer, port, "Created listener");

        Ok(ListenerHandles::new(listener, group))
    }

    async fn validate_listener(
        &self,
        handles: &ListenerHandles,
        load_balancer: &str,
        external_port: u16,
        backend_port: u16,
    ) -> Result<Validation, ProviderError> {
        self.validations.fetch_add(1, Ordering::SeqCst);
        self.take_fault(Operation::ValidateListener)?;

        let state = lock(&self.state);
        let Some(listener) = state.listeners.get(&handles.listener) else {
            return Ok(Validation::Mismatch(ListenerMismatch::ListenerNotFound {
                listener: handles.listener.clone(),
            }));
        };

        if listener.load_balancer != load_balancer {
            return Ok(Validation::Mismatch(ListenerMismatch::LoadBalancer {
                expected: load_balancer.to_string(),
                actual: listener.load_balancer.clone(),
            }));
        }
        if listener.port != external_port {
            return Ok(Validation::Mismatch(ListenerMismatch::ListenerPort {
                expected: external_port,
                actual: listener.port,
            }));
        }
        if listener.backend_group != handles.backend_group {
            return Ok(Validation::Mismatch(ListenerMismatch::BackendGroup {
                expected: handles.backend_group.clone(),
                actual: listener.backend_group.clone(),
            }));
        }

        let group = state
            .groups
            .get(&listener.backend_group)
            .ok_or_else(|| ProviderError::NotFound {
                kind: "backend group",
                id: listener.backend_group.clone(),
            })?;
        if group.port != backend_port {
            return Ok(Validation::Mismatch(ListenerMismatch::BackendPort {
                expected: backend_port,
                actual: group.port,
            }));
        }

        Ok(Validation::Valid)
    }

    async fn delete_listener(&self, handles: &ListenerHandles) -> Result<(), ProviderError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.take_fault(Operation::DeleteListener)?;

        let mut state = lock(&self.state);
        if !handles.listener.is_empty() && state.listeners.remove(&handles.listener).is_some() {
            info!(listener = %handles.listener, "Deleted listener");
        }

        if handles.backend_group.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.take_fault(Operation::DeleteBackendGroup) {
            return Err(ProviderError::PartialDelete {
                listener: handles.listener.clone(),
                backend_group: handles.backend_group.clone(),
                reason: e.to_string(),
            });
        }
        if state
            .listeners
            .values()
            .any(|l| l.backend_group == handles.backend_group)
        {
            debug!(backend_group = %handles.backend_group, "Backend group still referenced, keeping it");
            return Ok(());
        }
        if state.groups.remove(&handles.backend_group).is_some() {
            info!(backend_group = %handles.backend_group, "Deleted backend group");
        }
        Ok(())
    }

    async fn listener_owner(
        &self,
        listener: &str,
    ) -> Result<Option<ServiceIdentity>, ProviderError> {
        self.take_fault(Operation::DescribeListener)?;
        Ok(lock(&self.state)
            .listeners
            .get(listener)
            .map(|l| l.owner.clone()))
    }
}
