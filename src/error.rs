//! Error types for the index.

use crate::types::Address;
use thiserror::Error;

/// Result type alias for index operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the index
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error from the underlying file system
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The looked-up key is not bound. The only recoverable error.
    #[error("key not found")]
    NotFound,

    /// Requested page lies outside the file
    #[error("page {0} not found")]
    PageNotFound(Address),

    /// Data corruption detected (bad kind byte, checksum mismatch, broken freelist chain)
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// Database file has an invalid format or incompatible geometry
    #[error("invalid database file: {0}")]
    InvalidDatabaseFile(String),

    /// File was written by a different format version
    #[error("version mismatch: file has version {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    /// An internal invariant was violated; the tree should be considered poisoned
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// Invalid operation for the current state
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl Error {
    /// Create a corruption error with a message
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create an invalid database file error
    pub fn invalid_db(msg: impl Into<String>) -> Self {
        Self::InvalidDatabaseFile(msg.into())
    }

    /// Create an invariant violation error
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    /// Create an invalid operation error
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }
}
