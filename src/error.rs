//! Error types for forge-harvest
//!
//! A single crate-wide [`Error`] enum with conversions from the underlying
//! transport, serialization and I/O errors. The fetch engine does not use a
//! blanket "is retryable" classification: its retry taxonomy is positional
//! (whether an HTTP response was received at all), so that decision lives in
//! [`crate::fetcher`] rather than here.

use thiserror::Error;

/// Result type alias for forge-harvest operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for forge-harvest
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "date_range")
        key: Option<String>,
    },

    /// Network error (no HTTP response was received)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed date range expression
    #[error("invalid date range: {0}")]
    InvalidDateRange(String),

    /// Repository cache failure (git missing, clone failed, ...)
    #[error("repo cache error: {0}")]
    RepoCache(String),

    /// Output path escapes the store root
    #[error("unsafe output path: {0}")]
    UnsafePath(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}
