//! Error types and result handling for pg-cdc-receiver.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! Slot management failures never show up here: those operations log and
//! return a boolean instead. Everything else (transport, configuration,
//! malformed payloads, handler failures) propagates as an [`Error`], after
//! the receiver has released its streaming connection.
//!
//! # Example
//!
//! ```rust
//! use pg_cdc_receiver::{Error, Result};
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

use thiserror::Error;

/// The main error type for pg-cdc-receiver operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, detected before any connection is attempted.
    #[error("Configuration error: {0}")]
    Config(String),

    /// PostgreSQL client error from the slot management connection.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// JSON serialization error when encoding events.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error on the streaming socket.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic connection error not covered by specific types.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Authentication failure with PostgreSQL.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Protocol-level error in the replication stream.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid or malformed replication payload.
    #[error("Invalid message format: {message}")]
    InvalidMessage {
        /// Description of what was invalid
        message: String,
    },

    /// Operation timeout.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },

    /// The application change handler returned an error.
    #[error("Change handler failed: {0}")]
    Handler(#[source] anyhow::Error),
}

impl Error {
    pub(crate) fn invalid_message(message: impl Into<String>) -> Self {
        Error::InvalidMessage {
            message: message.into(),
        }
    }
}

/// A convenient Result type alias for pg-cdc-receiver operations.
///
/// This is equivalent to `std::result::Result<T, pg_cdc_receiver::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
