use std::sync::Arc;

use crate::driver::Incidents;
use crate::ledger::Ledger;

/// Shared state of the status endpoint
#[derive(Clone)]
pub struct StatusState {
    pub ledger: Arc<Ledger>,
    pub incidents: Incidents,
}

impl StatusState {
    pub fn new(ledger: Arc<Ledger>, incidents: Incidents) -> Self {
        Self { ledger, incidents }
    }

    /// Number of identities whose last pass ended fatally
    pub fn incident_count(&self) -> usize {
        self.incidents.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ServiceIdentity;
    use crate::config::{LoadBalancer, PoolConfig, PortRange};
    use crate::reconciler::ReconcileError;
    use dashmap::DashMap;

    #[test]
    fn test_status_state_shares_incidents() {
        let pool = PoolConfig::new(
            vec![LoadBalancer::new("lb1", "lb1.example.com")],
            PortRange::default(),
        )
        .unwrap();
        let incidents: Incidents = Arc::new(DashMap::new());
        let state = StatusState::new(Arc::new(Ledger::new(pool)), incidents.clone());

        let id = ServiceIdentity::new("ns", "a");
        incidents.insert(id.clone(), ReconcileError::CapacityExhausted(id));
        assert_eq!(state.clone().incident_count(), 1);
    }
}
