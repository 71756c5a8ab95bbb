//! Error types and result handling for pg-reptool.
//!
//! This module defines the main error type [`Error`], a convenience
//! [`Result`] type alias used throughout the crate, and [`SoftError`], the
//! per-query failure recorded by the host prober when a single catalog read
//! fails but the rest of the probe can continue.
//!
//! # Example
//!
//! ```rust
//! use pg_reptool::{Error, Result};
//!
//! fn connect_to_database() -> Result<()> {
//!     // Simulating a connection error
//!     Err(Error::Connection("Failed to connect".to_string()))
//! }
//!
//! match connect_to_database() {
//!     Ok(()) => println!("Connected"),
//!     Err(Error::Connection(msg)) => eprintln!("Connection error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use std::fmt;
use thiserror::Error;

/// The main error type for pg-reptool operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error: missing seed host, missing credentials or an
    /// unreadable configuration file. Always fatal before discovery starts.
    #[error("Configuration error: {0}")]
    Config(String),

    /// PostgreSQL client or protocol error.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// JSON serialization error when encoding the report.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error, typically from writing the report file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection error not covered by the PostgreSQL client error.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation timeout (pool acquire, connect or overall run deadline).
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },

    /// The connection cache for a host was already torn down.
    #[error("Connection pool for {host} is closed")]
    PoolClosed {
        /// Host whose pool was closed
        host: String,
    },

    /// A catalog query returned something the client could not interpret.
    #[error("Query '{query}' failed: {message}")]
    Query {
        /// Short name of the catalog query
        query: &'static str,
        /// Description of the failure
        message: String,
    },
}

/// A convenient Result type alias for pg-reptool operations.
///
/// This is equivalent to `std::result::Result<T, pg_reptool::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// A recoverable failure of a single catalog query.
///
/// The host prober turns every query outcome into a
/// `Result<T, SoftError>`; a soft error leaves the corresponding field of the
/// host status unknown and is reported as a warning instead of aborting the
/// probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftError {
    /// Short name of the query that failed
    pub query: &'static str,
    /// Rendered cause
    pub message: String,
}

impl SoftError {
    pub fn new(query: &'static str, error: impl fmt::Display) -> Self {
        Self {
            query,
            message: error.to_string(),
        }
    }
}

impl fmt::Display for SoftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.query, self.message)
    }
}

impl std::error::Error for SoftError {}

/// Converts a hard [`Result`] from a catalog call into a soft one.
pub trait SoftResultExt<T> {
    fn soft(self, query: &'static str) -> std::result::Result<T, SoftError>;
}

impl<T> SoftResultExt<T> for Result<T> {
    fn soft(self, query: &'static str) -> std::result::Result<T, SoftError> {
        self.map_err(|e| SoftError::new(query, e))
    }
}
