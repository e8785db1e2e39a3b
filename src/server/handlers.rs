use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::ledger::{Allocation, Slot};
use crate::server::state::StatusState;

#[derive(Debug, Serialize)]
pub struct AllocationsResponse {
    pub capacity: usize,
    pub occupied: usize,
    pub allocations: Vec<Allocation>,
    /// Free pairs carrying a listener no service owns
    pub blocked: Vec<Slot>,
    pub incidents: Vec<IncidentView>,
}

#[derive(Debug, Serialize)]
pub struct IncidentView {
    pub service: String,
    pub error: String,
}

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

/// Ledger contents and fatal incidents
pub async fn allocations(State(state): State<StatusState>) -> impl IntoResponse {
    let snapshot = state.ledger.snapshot();
    let mut incidents: Vec<IncidentView> = state
        .incidents
        .iter()
        .map(|entry| IncidentView {
            service: entry.key().to_string(),
            error: entry.value().to_string(),
        })
        .collect();
    incidents.sort_by(|a, b| a.service.cmp(&b.service));

    Json(AllocationsResponse {
        capacity: snapshot.capacity,
        occupied: snapshot.occupied,
        allocations: snapshot.allocations,
        blocked: snapshot.blocked,
        incidents,
    })
}

/// Create the Axum router
pub fn create_router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/allocations", get(allocations))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
