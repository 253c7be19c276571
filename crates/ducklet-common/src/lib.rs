//! Ducklet Common Library
//!
//! Shared error and configuration types for the ducklet crates.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{BigIntMode, ClientConfig, DatabaseConfig, RowFormat};
pub use error::{DuckletError, Result, STREAM_SUPERSEDED_MESSAGE};
