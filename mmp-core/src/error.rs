//! Error types for mmp-core
//!
//! None of these reach the instrumentation caller: tracking calls log and
//! swallow them. They surface only from constructors and from the internal
//! store, queue and transport layers.

use thiserror::Error;

/// Main error type for the mmp-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Network or HTTP-level failure talking to the ingestion API
    #[error("transport error: {0}")]
    Transport(String),
}

/// Result type alias for mmp-core
pub type Result<T> = std::result::Result<T, Error>;
