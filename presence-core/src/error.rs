//! Error types for the presence core library.

use thiserror::Error;

/// Top-level error type for core presence operations.
#[derive(Error, Debug)]
pub enum PresenceError {
    /// Configuration is missing or inconsistent. The only process-fatal class.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Roster file is malformed or violates roster invariants.
    #[error("Roster error: {0}")]
    Roster(String),

    /// Serialization or deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// SQLite persistence error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type alias.
pub type Result<T> = std::result::Result<T, PresenceError>;
