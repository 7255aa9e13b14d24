//! Error types for the device gateway.

use thiserror::Error;

/// Type alias for Results in this crate.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Main error type for gateway operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The listener could not be bound
    #[error("Failed to bind {address}: {source}")]
    Bind {
        /// Address that was tried
        address: String,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// The listen address does not parse
    #[error("Invalid listen address: {0}")]
    InvalidAddress(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation requires a running gateway
    #[error("Gateway is not running")]
    NotRunning,

    /// No registered connection with this id
    #[error("Client not found: {0}")]
    ClientNotFound(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<GatewayError> for ios_core::IosError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Bind { .. } | GatewayError::Io(_) => Self::connection(err),
            GatewayError::InvalidAddress(_) | GatewayError::Configuration(_) => Self::config(err),
            GatewayError::NotRunning => Self::internal(err),
            GatewayError::ClientNotFound(_) => Self::not_found(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ios_core::IosError;

    #[test]
    fn test_bind_failure_is_startup_fatal() {
        let err = GatewayError::Bind {
            address: "0.0.0.0:80".into(),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        let converted: IosError = err.into();
        assert!(matches!(converted, IosError::Connection(_)));
        assert!(converted.is_startup_fatal());
    }

    #[test]
    fn test_client_not_found_maps_to_not_found() {
        let converted: IosError = GatewayError::ClientNotFound("abc".into()).into();
        assert_eq!(converted, IosError::NotFound("Client not found: abc".into()));
    }
}
