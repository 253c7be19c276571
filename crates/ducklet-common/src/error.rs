//! Error types for the ducklet client

use std::fmt;

/// Result type alias using DuckletError
pub type Result<T> = std::result::Result<T, DuckletError>;

/// Message reported when a streaming result was preempted by a newer one on the same connection.
pub const STREAM_SUPERSEDED_MESSAGE: &str = "Attempting to fetch from an unsuccessful or closed streaming query result: only one stream can be active on one connection at a time";

/// Main error type for ducklet
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DuckletError {
    /// Operation on a cursor with no attached or active native result
    #[error("Result closed")]
    ResultClosed,

    /// Streaming result preempted by a newer streaming execute on the same connection
    #[error("{}", STREAM_SUPERSEDED_MESSAGE)]
    StreamSuperseded,

    /// Error raised by the query engine, message preserved verbatim
    #[error("{0}")]
    Engine(String),

    /// Connection or database used after close
    #[error("{0} closed")]
    ConnectionClosed(String),

    /// Engine produced a column type with no coercion rule
    #[error("Unsupported column type: {0}")]
    UnsupportedType(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DuckletError {
    /// Wrap any engine-side error, keeping its message
    pub fn engine<E: fmt::Display>(err: E) -> Self {
        DuckletError::Engine(err.to_string())
    }

    /// Create an internal error from any error type
    pub fn internal<E: fmt::Display>(err: E) -> Self {
        DuckletError::Internal(err.to_string())
    }

    /// Get the error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            DuckletError::ResultClosed => "RESULT_CLOSED",
            DuckletError::StreamSuperseded => "STREAM_SUPERSEDED",
            DuckletError::Engine(_) => "ENGINE_ERROR",
            DuckletError::ConnectionClosed(_) => "CONNECTION_CLOSED",
            DuckletError::UnsupportedType(_) => "UNSUPPORTED_TYPE",
            DuckletError::Config(_) => "CONFIG_ERROR",
            DuckletError::Internal(_) => "INTERNAL",
        }
    }

    /// Whether this error means the result can no longer be read
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            DuckletError::ResultClosed | DuckletError::StreamSuperseded
        )
    }
}

impl From<config::ConfigError> for DuckletError {
    fn from(err: config::ConfigError) -> Self {
        DuckletError::Config(err.to_string())
    }
}
