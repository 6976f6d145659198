//! Database layer for mmp
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations
//! - Per-token preference rows backing the persistent store
//! - The durable pending-message queue

pub mod repo;
pub mod schema;

pub use repo::Database;
