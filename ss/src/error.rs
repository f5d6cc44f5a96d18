//! Error types for the statestore crate

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the shared state store, command queue, and cycle journal
#[derive(Debug, Error)]
pub enum StoreError {
    /// A state or cycles file exists but does not parse as JSON
    #[error("state corruption in {path}: {source}")]
    StateCorruption {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A command id was not found in any lifecycle directory
    #[error("command not found: {0}")]
    CommandNotFound(String),

    /// A command file exists but does not parse
    #[error("malformed command file {path}: {source}")]
    MalformedCommand {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Cycle journal (SQLite) failure
    #[error("cycle journal error: {0}")]
    Journal(#[from] rusqlite::Error),

    /// Failed to serialize a record for storage
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Underlying filesystem failure (lock file, rename, read/write)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, StoreError>;
