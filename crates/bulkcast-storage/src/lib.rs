//! Bulkcast Storage - Campaign persistence
//!
//! This crate provides the campaign data model and the repository
//! abstraction used by the dispatch engine, with in-memory and
//! PostgreSQL implementations.

pub mod db;
pub mod models;
pub mod repository;

pub use db::DatabasePool;
pub use models::*;
pub use repository::*;
