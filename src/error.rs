//! Error types for Catalyst.
//!
//! This module provides a unified error type [`CatalystError`] for all
//! Catalyst operations, along with a convenient [`Result`] type alias.
//!
//! Errors fall into a few categories: descriptor loading and validation,
//! request-scoped failures (schema validation, template rendering), fan-out
//! call failures, batcher backpressure, and supervisor/restart failures.

use std::io;
use thiserror::Error;

/// Main error type for Catalyst operations.
#[derive(Error, Debug)]
pub enum CatalystError {
    // Descriptor errors
    #[error("Failed to load descriptor {path}: {reason}")]
    Load { path: String, reason: String },

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("No descriptors found in {0}")]
    NoDescriptors(String),

    // Request-scoped errors
    #[error("Schema validation failed: {0}")]
    Validation(String),

    #[error("Schema compile error for {path} {method}: {reason}")]
    SchemaCompile {
        path: String,
        method: String,
        reason: String,
    },

    #[error("Template error: {0}")]
    Template(String),

    #[error("Fan-out call to {url} failed: {reason}")]
    FanOut { url: String, reason: String },

    // Batcher errors
    #[error("Capture queue is full")]
    QueueFull,

    #[error("Batcher is not running")]
    NotRunning,

    // Supervisor / control-plane errors
    #[error("Restart channel is full")]
    ChannelFull,

    #[error("Restart controller is closed")]
    ControllerClosed,

    #[error("Restart of {0} timed out")]
    RestartTimeout(String),

    #[error("Port {0} is busy")]
    PortBusy(u16),

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Configuration file not found for server: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CatalystError {
    /// Whether the operation that produced this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CatalystError::QueueFull
                | CatalystError::ChannelFull
                | CatalystError::PortBusy(_)
                | CatalystError::FanOut { .. }
        )
    }
}

impl From<rusqlite::Error> for CatalystError {
    fn from(e: rusqlite::Error) -> Self {
        CatalystError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for CatalystError {
    fn from(e: serde_json::Error) -> Self {
        CatalystError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for CatalystError {
    fn from(e: serde_yaml::Error) -> Self {
        CatalystError::Serialization(e.to_string())
    }
}

/// Result type alias for Catalyst operations.
pub type Result<T> = std::result::Result<T, CatalystError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(CatalystError::QueueFull.is_retryable());
        assert!(CatalystError::ChannelFull.is_retryable());
        assert!(CatalystError::PortBusy(8080).is_retryable());
        assert!(!CatalystError::NotRunning.is_retryable());
        assert!(!CatalystError::Validation("bad".into()).is_retryable());
    }

    #[test]
    fn test_field_qualified_config_error() {
        let err = CatalystError::InvalidConfig {
            field: "http.servers[0].listen".to_string(),
            reason: "port must be non-zero".to_string(),
        };
        assert!(err.to_string().contains("http.servers[0].listen"));
    }
}
