//! # mmp-core
//!
//! Client library for buffering and delivering product analytics.
//!
//! This library provides:
//! - Per-token trackers for events, people and group profile updates
//! - A durable SQLite queue that survives restarts and caps its depth
//! - A background dispatcher that batches records, retries with backoff and
//!   polls the decide endpoint for notifications and experiment variants
//! - Configuration management and logging infrastructure
//!
//! ## Pipeline
//!
//! Records flow through three stages:
//! - **Tracker:** builds the wire message, merging super properties and identity
//! - **Queue:** appends it to the per-token, per-kind table in the database
//! - **Dispatcher:** drains the queue in FIFO batches and removes what the
//!   server accepted or permanently rejected
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use mmp_core::{Config, Registry};
//!
//! let config = Config::load().expect("failed to load config");
//! let registry = Registry::open(config).expect("failed to open registry");
//!
//! let tracker = registry.instance("project-token");
//! tracker.identify("user-42");
//! tracker.track("Signed Up", [("plan", "pro")].into_iter().collect());
//! tracker.flush_blocking(Duration::from_secs(5));
//! ```

// Re-export commonly used items at the crate root
pub use api::{Group, People, Registry, Tracker};
pub use config::Config;
pub use db::Database;
pub use decide::{DecideClient, DecideUpdate, Notification, Variant};
pub use dispatcher::{Dispatcher, FlushDescriptor, FlushReport, TransmitOutcome, Transport};
pub use error::{Error, Result};
pub use queue::EventQueue;
pub use store::PersistentStore;
pub use types::*;

// Public modules
pub mod api;
pub mod config;
pub mod db;
pub mod decide;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod queue;
pub mod store;
pub mod types;
