//! Bulkcast API - REST API server
//!
//! This crate exposes the campaign control surface, the stats query,
//! health checks and Prometheus metrics over HTTP.

pub mod handlers;
pub mod routes;

pub use routes::{create_router, AppState};
