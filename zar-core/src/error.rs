//! Error types for zar-core

use thiserror::Error;

/// Main error type for the zar-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error (SQLite-backed identity storage)
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Network failure before a response was received
    #[error("transport error: {0}")]
    Transport(String),

    /// Backend answered with a non-success HTTP status
    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    /// Scoped storage unavailable or rejected a write
    #[error("storage error: {0}")]
    Storage(String),

    /// Number pool protocol error
    #[error("pool error: {0}")]
    Pool(String),
}

/// Result type alias for zar-core
pub type Result<T> = std::result::Result<T, Error>;
