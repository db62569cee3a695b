//! Error types for the Plexus gateway

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the gateway core
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Plugin manifest could not be read or is invalid
    #[error("invalid plugin manifest at {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    /// Plugin entry point does not exist on disk
    #[error("entry point not found: {}", .0.display())]
    EntryNotFound(PathBuf),

    /// Plugin failed to import or register
    #[error("plugin {id} failed: {reason}")]
    Plugin { id: String, reason: String },

    /// A registered command, method or route handler failed
    #[error("handler {name} failed: {reason}")]
    Handler { name: String, reason: String },

    /// Plugin subprocess protocol violation or transport failure
    #[error("plugin process error: {0}")]
    Process(String),

    /// Channel error
    #[error("channel error: {0}")]
    Channel(String),

    /// Operation requires an external collaborator that is not attached
    #[error("{0} is not available in this gateway")]
    Unavailable(&'static str),

    /// File watcher error
    #[error("watch error: {0}")]
    Watch(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl From<notify::Error> for Error {
    fn from(e: notify::Error) -> Self {
        Self::Watch(e.to_string())
    }
}
