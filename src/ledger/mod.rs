//! Allocation ledger
//!
//! In-memory index of which service holds which (load balancer, port) pair.
//! Both directions of the index live in one [`LedgerState`] behind one
//! mutex, so a pair and its owner's allocation are always updated together
//! and can never be observed out of sync.
//!
//! The ledger is a cache. It starts empty and is refilled from the services'
//! binding records as the reconciler verifies them.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use thiserror::Error;

use crate::cluster::ServiceIdentity;
use crate::config::PoolConfig;
use crate::provider::ListenerHandles;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("{load_balancer}:{port} is held by {owner}")]
    Conflict {
        load_balancer: String,
        port: u16,
        owner: ServiceIdentity,
    },

    #[error("No free port left on any load balancer")]
    Exhausted,

    #[error("{0}:{1} is not part of the load balancer pool")]
    UnknownSlot(String, u16),

    #[error("{0} holds no reservation")]
    NotReserved(ServiceIdentity),
}

/// One (load balancer, port) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Slot {
    pub load_balancer: String,
    pub port: u16,
}

impl Slot {
    pub fn new(load_balancer: impl Into<String>, port: u16) -> Self {
        Self {
            load_balancer: load_balancer.into(),
            port,
        }
    }
}

/// A service's external binding as the ledger knows it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub service: ServiceIdentity,
    pub load_balancer: String,
    pub port: u16,
    /// Empty while the listener is being created
    pub listener: String,
    /// Empty while the listener is being created
    pub backend_group: String,
}

impl Allocation {
    pub fn slot(&self) -> Slot {
        Slot::new(self.load_balancer.clone(), self.port)
    }

    pub fn handles(&self) -> ListenerHandles {
        ListenerHandles::new(self.listener.clone(), self.backend_group.clone())
    }

    /// Provider objects have been created for this allocation
    pub fn is_settled(&self) -> bool {
        !self.listener.is_empty() && !self.backend_group.is_empty()
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    owners: HashMap<Slot, ServiceIdentity>,
    allocations: HashMap<ServiceIdentity, Allocation>,
    /// Free pairs the provider refused to create a listener on
    blocked: HashSet<Slot>,
}

impl LedgerState {
    fn release(&mut self, service: &ServiceIdentity) -> Option<Allocation> {
        let allocation = self.allocations.remove(service)?;
        self.owners.remove(&allocation.slot());
        Some(allocation)
    }

    fn occupy(&mut self, allocation: Allocation) -> Allocation {
        self.blocked.remove(&allocation.slot());
        self.owners
            .insert(allocation.slot(), allocation.service.clone());
        self.allocations
            .insert(allocation.service.clone(), allocation.clone());
        allocation
    }
}

/// Point-in-time copy of the ledger
#[derive(Debug, Clone, Serialize)]
pub struct LedgerSnapshot {
    pub capacity: usize,
    pub occupied: usize,
    pub allocations: Vec<Allocation>,
    pub blocked: Vec<Slot>,
}

pub struct Ledger {
    pool: PoolConfig,
    state: Mutex<LedgerState>,
}

impl Ledger {
    pub fn new(pool: PoolConfig) -> Self {
        Self {
            pool,
            state: Mutex::new(LedgerState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn host_of(&self, load_balancer: &str) -> Option<&str> {
        self.pool.host_of(load_balancer)
    }

    /// Occupy `load_balancer:port` for `service`.
    ///
    /// Succeeds when the pair is free or already held by `service`, and
    /// records the given handles. If `service` held a different pair, that
    /// pair is released. Never takes a pair away from another service.
    pub fn reserve(
        &self,
        load_balancer: &str,
        port: u16,
        service: &ServiceIdentity,
        handles: &ListenerHandles,
    ) -> Result<Allocation, LedgerError> {
        if !self.pool.contains(load_balancer, port) {
            return Err(LedgerError::UnknownSlot(load_balancer.to_string(), port));
        }

        let slot = Slot::new(load_balancer, port);
        let mut state = self.state();
        if let Some(owner) = state.owners.get(&slot) {
            if owner != service {
                return Err(LedgerError::Conflict {
                    load_balancer: slot.load_balancer,
                    port,
                    owner: owner.clone(),
                });
            }
        }

        state.release(service);
        Ok(state.occupy(Allocation {
            service: service.clone(),
            load_balancer: slot.load_balancer,
            port,
            listener: handles.listener.clone(),
            backend_group: handles.backend_group.clone(),
        }))
    }

    /// Reserve the first free pair for `service`.
    ///
    /// Load balancers are scanned in configured order, ports ascending. Any
    /// pair `service` already held is released first, so the result is
    /// always a fresh reservation without provider handles.
    pub fn find_free_slot(&self, service: &ServiceIdentity) -> Result<Slot, LedgerError> {
        self.find_free_slot_avoiding(service, None)
    }

    /// Like [`Ledger::find_free_slot`], but `avoid` is only handed out when
    /// it is the last free pair.
    ///
    /// Blocked pairs come after everything else, `avoid` included, so a pair
    /// held by a foreign listener is only retried once nothing else is left.
    pub fn find_free_slot_avoiding(
        &self,
        service: &ServiceIdentity,
        avoid: Option<&Slot>,
    ) -> Result<Slot, LedgerError> {
        let mut state = self.state();
        state.release(service);

        let free: Vec<Slot> = self
            .pool
            .load_balancers
            .iter()
            .flat_map(|lb| {
                self.pool
                    .ports
                    .ports()
                    .map(move |port| Slot::new(lb.name.clone(), port))
            })
            .filter(|slot| !state.owners.contains_key(slot))
            .collect();

        let slot = free
            .iter()
            .find(|slot| Some(*slot) != avoid && !state.blocked.contains(*slot))
            .or_else(|| {
                free.iter()
                    .find(|slot| Some(*slot) == avoid && !state.blocked.contains(*slot))
            })
            .or_else(|| free.first())
            .cloned()
            .ok_or(LedgerError::Exhausted)?;

        state.occupy(Allocation {
            service: service.clone(),
            load_balancer: slot.load_balancer.clone(),
            port: slot.port,
            listener: String::new(),
            backend_group: String::new(),
        });
        Ok(slot)
    }

    /// Push `slot` to the back of the scan until someone reserves it
    pub fn block(&self, slot: &Slot) {
        if self.pool.contains(&slot.load_balancer, slot.port) {
            self.state().blocked.insert(slot.clone());
        }
    }

    pub fn is_blocked(&self, slot: &Slot) -> bool {
        self.state().blocked.contains(slot)
    }

    /// Service whose allocation records `listener`, if any
    pub fn listener_holder(&self, listener: &str) -> Option<ServiceIdentity> {
        if listener.is_empty() {
            return None;
        }
        self.state()
            .allocations
            .values()
            .find(|a| a.listener == listener)
            .map(|a| a.service.clone())
    }

    /// Record provider handles on the reservation `service` holds
    pub fn attach_handles(
        &self,
        service: &ServiceIdentity,
        handles: &ListenerHandles,
    ) -> Result<Allocation, LedgerError> {
        let mut state = self.state();
        let allocation = state
            .allocations
            .get_mut(service)
            .ok_or_else(|| LedgerError::NotReserved(service.clone()))?;
        allocation.listener = handles.listener.clone();
        allocation.backend_group = handles.backend_group.clone();
        Ok(allocation.clone())
    }

    /// Free whatever pair `service` holds. No-op if it holds none.
    pub fn release(&self, service: &ServiceIdentity) -> Option<Allocation> {
        self.state().release(service)
    }

    pub fn get(&self, service: &ServiceIdentity) -> Option<Allocation> {
        self.state().allocations.get(service).cloned()
    }

    pub fn owner_of(&self, load_balancer: &str, port: u16) -> Option<ServiceIdentity> {
        self.state()
            .owners
            .get(&Slot::new(load_balancer, port))
            .cloned()
    }

    pub fn occupied(&self) -> usize {
        self.state().owners.len()
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state();
        let mut allocations: Vec<Allocation> = state.allocations.values().cloned().collect();
        allocations.sort_by(|a, b| a.service.cmp(&b.service));
        let mut blocked: Vec<Slot> = state.blocked.iter().cloned().collect();
        blocked.sort_by(|a, b| (&a.load_balancer, a.port).cmp(&(&b.load_balancer, b.port)));
        LedgerSnapshot {
            capacity: self.pool.capacity(),
            occupied: state.owners.len(),
            allocations,
            blocked,
        }
    }
}
