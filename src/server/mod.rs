//! Read-only status endpoint

pub mod handlers;
pub mod state;

pub use handlers::create_router;
pub use state::StatusState;
