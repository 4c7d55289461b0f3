//! Error types and result handling for pg-change-notifier.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use pg_change_notifier::{Error, Result};
//!
//! fn open_listener() -> Result<()> {
//!     // Simulating a connection error
//!     Err(Error::Connection("Failed to connect".to_string()))
//! }
//!
//! match open_listener() {
//!     Ok(()) => println!("Listening"),
//!     Err(Error::Connection(msg)) => eprintln!("Connection error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for pg-change-notifier operations.
///
/// Every failure surfaced by the public API is one of these variants,
/// never a raw transport error.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or missing configuration. Always fatal to initialization.
    #[error("Configuration error: {0}")]
    Config(String),

    /// PostgreSQL client or protocol error.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Database connectivity failure not covered by a driver error.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A sink failed to initialize, deliver or close.
    #[error("Delivery error ({sink}): {message}")]
    Delivery {
        /// Kind of the sink that failed
        sink: String,
        /// Description of the failure
        message: String,
    },

    /// A delivery method that is declared but has no implementation.
    #[error("Unsupported delivery method: {0}")]
    Unsupported(String),

    /// JSON serialization error when encoding or decoding payloads.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other failure, carrying the original cause.
    #[error("{message}")]
    Wrapped {
        /// What was being attempted
        message: String,
        /// The underlying failure
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl Error {
    /// Builds a [`Error::Delivery`] for the given sink kind.
    pub fn delivery(sink: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Delivery {
            sink: sink.into(),
            message: message.into(),
        }
    }

    /// Wraps any error with a description of what was being attempted.
    pub fn wrap<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Wrapped {
            message: message.into(),
            source: Box::new(source),
        }
    }

    /// Returns `true` for database connectivity failures.
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Postgres(_))
    }

    /// Returns `true` for sink failures.
    pub fn is_delivery(&self) -> bool {
        matches!(self, Error::Delivery { .. } | Error::Unsupported(_))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for Error {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        match err {
            deadpool_postgres::PoolError::Backend(e) => Error::Postgres(e),
            other => Error::Connection(format!("Connection pool error: {}", other)),
        }
    }
}

impl From<deadpool_postgres::BuildError> for Error {
    fn from(err: deadpool_postgres::BuildError) -> Self {
        Error::Config(format!("Failed to create connection pool: {}", err))
    }
}

/// A convenient Result type alias for pg-change-notifier operations.
///
/// This is equivalent to `std::result::Result<T, pg_change_notifier::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_wrapped_keeps_source() {
        let inner = Error::Connection("refused".to_string());
        let err = Error::wrap("Failed to initialize change notifier", inner);

        assert_eq!(err.to_string(), "Failed to initialize change notifier");
        let source = err.source().unwrap();
        assert_eq!(source.to_string(), "Connection error: refused");
    }

    #[test]
    fn test_classification() {
        assert!(Error::Connection("x".into()).is_connection());
        assert!(Error::delivery("sse", "closed").is_delivery());
        assert!(Error::Unsupported("webhook".into()).is_delivery());
        assert!(!Error::Config("x".into()).is_connection());
    }
}
