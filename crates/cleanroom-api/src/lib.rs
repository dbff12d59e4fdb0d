//! API server for the cleanroom platform.
//!
//! Serves the creator-facing job surface and the status update callback
//! used by the reconciliation monitor.

pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;
