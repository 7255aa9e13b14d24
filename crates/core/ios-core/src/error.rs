//! Error handling types and utilities for the IOS pipeline.
//!
//! Every crate in the workspace converts its local failures into [`IosError`]
//! at its public boundary so stages can propagate startup faults with `?`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The main error type for the IOS pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IosError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Bus client errors (publish, subscribe, unsubscribe)
    #[error("Bus error: {0}")]
    Bus(String),

    /// Connection establishment or loss
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed topic or topic pattern
    #[error("Topic error: {0}")]
    Topic(String),

    /// Failure raised inside a message handler
    #[error("Handler error: {0}")]
    Handler(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Invalid input parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Internal system errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IosError {
    /// Create a new configuration error
    pub fn config<T: fmt::Display>(msg: T) -> Self {
        Self::Configuration(msg.to_string())
    }

    /// Create a new bus error
    pub fn bus<T: fmt::Display>(msg: T) -> Self {
        Self::Bus(msg.to_string())
    }

    /// Create a new connection error
    pub fn connection<T: fmt::Display>(msg: T) -> Self {
        Self::Connection(msg.to_string())
    }

    /// Create a new topic error
    pub fn topic<T: fmt::Display>(msg: T) -> Self {
        Self::Topic(msg.to_string())
    }

    /// Create a new handler error
    pub fn handler<T: fmt::Display>(msg: T) -> Self {
        Self::Handler(msg.to_string())
    }

    /// Create a new serialization error
    pub fn serialization<T: fmt::Display>(msg: T) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a new timeout error
    pub fn timeout<T: fmt::Display>(msg: T) -> Self {
        Self::Timeout(msg.to_string())
    }

    /// Create a new invalid input error
    pub fn invalid_input<T: fmt::Display>(msg: T) -> Self {
        Self::InvalidInput(msg.to_string())
    }

    /// Create a new not found error
    pub fn not_found<T: fmt::Display>(msg: T) -> Self {
        Self::NotFound(msg.to_string())
    }

    /// Create a new internal error
    pub fn internal<T: fmt::Display>(msg: T) -> Self {
        Self::Internal(msg.to_string())
    }

    /// Transient I/O class: worth another attempt after a delay
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Bus(_) | Self::Connection(_) | Self::Timeout(_)
        )
    }

    /// Errors that abort a stage while it is starting
    #[must_use]
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::Connection(_) | Self::Topic(_) | Self::Timeout(_)
        )
    }
}

/// Result type alias for IOS operations
pub type IosResult<T> = Result<T, IosError>;

impl From<std::io::Error> for IosError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for IosError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<uuid::Error> for IosError {
    fn from(err: uuid::Error) -> Self {
        Self::InvalidInput(err.to_string())
    }
}

impl From<config::ConfigError> for IosError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = IosError::config("missing broker");
        assert_eq!(err, IosError::Configuration("missing broker".to_string()));
        assert!(err.to_string().contains("missing broker"));
    }

    #[test]
    fn test_error_classification() {
        let bus_err = IosError::bus("publish failed");
        assert!(bus_err.is_retryable());
        assert!(!bus_err.is_startup_fatal());

        let conn_err = IosError::connection("broker unreachable");
        assert!(conn_err.is_retryable());
        assert!(conn_err.is_startup_fatal());

        let handler_err = IosError::handler("bad payload");
        assert!(!handler_err.is_retryable());
        assert!(!handler_err.is_startup_fatal());
    }

    #[test]
    fn test_error_conversions() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: IosError = io_err.into();
        assert!(matches!(err, IosError::Internal(_)));

        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: IosError = json_err.into();
        assert!(matches!(err, IosError::Serialization(_)));
    }
}
