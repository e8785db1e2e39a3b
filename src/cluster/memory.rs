//! In-memory cluster collaborator
//!
//! Holds service records in a `DashMap` and lets callers queue failures for
//! the next `get`, `update` or finalizer change, which is how the
//! reconciler's failure paths are exercised without a live API server.
//! [`MemoryCluster::delete`] follows the API server: a service holding
//! finalizers is only marked as deleting.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{ClusterClient, ClusterError, ServiceIdentity, ServiceRecord, SERVICE_FINALIZER};

#[derive(Default)]
pub struct MemoryCluster {
    services: DashMap<ServiceIdentity, ServiceRecord>,
    get_failures: Mutex<VecDeque<ClusterError>>,
    update_failures: Mutex<VecDeque<ClusterError>>,
    finalizer_failures: Mutex<VecDeque<ClusterError>>,
    updates: AtomicUsize,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a service
    pub fn apply(&self, record: ServiceRecord) {
        self.services.insert(record.identity.clone(), record);
    }

    /// Drop a service outright, finalizers or not
    pub fn remove(&self, identity: &ServiceIdentity) -> Option<ServiceRecord> {
        self.services.remove(identity).map(|(_, r)| r)
    }

    /// Request deletion. Returns true when the service is gone right away.
    pub fn delete(&self, identity: &ServiceIdentity) -> bool {
        let held = match self.services.get_mut(identity) {
            Some(mut record) if !record.finalizers.is_empty() => {
                record.deleting = true;
                true
            }
            Some(_) => false,
            None => return false,
        };
        if !held {
            self.services.remove(identity);
        }
        !held
    }

    pub fn service(&self, identity: &ServiceIdentity) -> Option<ServiceRecord> {
        self.services.get(identity).map(|r| r.clone())
    }

    /// Number of successful updates so far
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn fail_next_get(&self, error: ClusterError) {
        lock(&self.get_failures).push_back(error);
    }

    pub fn fail_next_update(&self, error: ClusterError) {
        lock(&self.update_failures).push_back(error);
    }

    pub fn fail_next_finalizer(&self, error: ClusterError) {
        lock(&self.finalizer_failures).push_back(error);
    }

    fn take_finalizer_failure(&self) -> Result<(), ClusterError> {
        match lock(&self.finalizer_failures).pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn get(&self, identity: &ServiceIdentity) -> Result<Option<ServiceRecord>, ClusterError> {
        if let Some(err) = lock(&self.get_failures).pop_front() {
            return Err(err);
        }
        Ok(self.service(identity))
    }

    async fn update(&self, record: &ServiceRecord) -> Result<(), ClusterError> {
        if let Some(err) = lock(&self.update_failures).pop_front() {
            return Err(err);
        }

        let mut existing = self
            .services
            .get_mut(&record.identity)
            .ok_or_else(|| ClusterError::NotFound(record.identity.clone()))?;
        existing.annotations = record.annotations.clone();
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn add_finalizer(&self, identity: &ServiceIdentity) -> Result<(), ClusterError> {
        self.take_finalizer_failure()?;
        let mut existing = self
            .services
            .get_mut(identity)
            .ok_or_else(|| ClusterError::NotFound(identity.clone()))?;
        if !existing.has_finalizer() {
            existing.finalizers.push(SERVICE_FINALIZER.to_string());
        }
        Ok(())
    }

    async fn remove_finalizer(&self, identity: &ServiceIdentity) -> Result<(), ClusterError> {
        self.take_finalizer_failure()?;
        let gone = {
            let mut existing = self
                .services
                .get_mut(identity)
                .ok_or_else(|| ClusterError::NotFound(identity.clone()))?;
            existing.finalizers.retain(|f| f != SERVICE_FINALIZER);
            existing.deleting && existing.finalizers.is_empty()
        };
        if gone {
            self.services.remove(identity);
        }
        Ok(())
    }
}
