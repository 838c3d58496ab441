//! HTTP API server for dispatchd.
//!
//! Exposes job submission, status/result polling, cancellation and a
//! health check over REST.

pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;
