//! Unified error types for the tetherproxy core library.
//!
//! This module provides a unified error type [`TetherProxyError`] that covers the
//! failure modes surfaced by the core. The configuration module keeps its own
//! [`ConfigError`](crate::config::ConfigError) for internal use and converts into
//! the unified type at the crate boundary.
//!
//! # Design Principles
//!
//! - **Specific variants**: Each error variant captures exactly one failure mode
//! - **Actionable messages**: Error messages guide users toward resolution
//! - **Data, not exceptions**: Network and proxy failures observed at runtime are
//!   carried inside [`RunningStatus::Error`](crate::status::RunningStatus) values,
//!   never raised through this type
//! - **HTTP-ready**: Error types include HTTP status codes and error codes
//!
//! Contract violations (calling the proxy factory from the foreground thread)
//! are assertions and have no variant here.
//!
//! # Example
//!
//! ```rust
//! use tetherproxy_core::error::{Result, TetherProxyError};
//! use tetherproxy_core::types::TransportType;
//!
//! fn require_tcp(transport: TransportType) -> Result<()> {
//!     if transport != TransportType::Tcp {
//!         return Err(TetherProxyError::UnsupportedTransport(transport));
//!     }
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

use crate::types::TransportType;

/// The unified error type for all tetherproxy operations.
#[derive(Debug, Error)]
pub enum TetherProxyError {
    // =========================================================================
    // PROXY ERRORS
    // =========================================================================
    /// The requested transport has no proxy manager implementation.
    #[error("Transport '{0}' is not supported. Only TCP proxying is implemented.")]
    UnsupportedTransport(TransportType),

    /// The proxy listener could not be bound.
    #[error("Failed to bind proxy listener on {addr}: {source}")]
    ProxyBindFailed {
        /// Address the listener tried to bind.
        addr: SocketAddr,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// The listen port preference source closed before yielding a port.
    #[error("No proxy listen port is available. Set proxy.listen_port in the configuration.")]
    PortUnavailable,

    // =========================================================================
    // NETWORK ERRORS
    // =========================================================================
    /// Starting the hotspot network failed.
    #[error("Network start failed: {0}")]
    NetworkStartFailed(String),

    /// An operation required an established peer group but none exists.
    #[error("No hotspot group is established. Start the network first.")]
    NoConnection,

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // I/O ERRORS
    // =========================================================================
    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for tetherproxy operations.
pub type Result<T> = std::result::Result<T, TetherProxyError>;

/// Short alias for [`TetherProxyError`].
pub type Error = TetherProxyError;

impl TetherProxyError {
    /// Returns an HTTP-appropriate status code for this error.
    #[inline]
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 404 Not Found
            Self::ConfigNotFound(_) => 404,

            // 409 Conflict - not valid in the current state
            Self::NoConnection => 409,

            // 422 Unprocessable Entity - semantic errors
            Self::ConfigParseError(_) | Self::ConfigValidationError(_) => 422,

            // 500 Internal Server Error
            Self::IoError(_) => 500,

            // 501 Not Implemented
            Self::UnsupportedTransport(_) => 501,

            // 503 Service Unavailable - network or proxy could not come up
            Self::ProxyBindFailed { .. } | Self::PortUnavailable | Self::NetworkStartFailed(_) => {
                503
            }
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::UnsupportedTransport(_) => "UNSUPPORTED_TRANSPORT",
            Self::ProxyBindFailed { .. } => "PROXY_BIND_FAILED",
            Self::PortUnavailable => "PORT_UNAVAILABLE",
            Self::NetworkStartFailed(_) => "NETWORK_START_FAILED",
            Self::NoConnection => "NO_CONNECTION",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::IoError(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for TetherProxyError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path),
            ConfigError::WriteError { path, source } => Self::IoError(std::io::Error::new(
                source.kind(),
                format!("Failed to write {}: {}", path.display(), source),
            )),
            ConfigError::ParseError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoErr, ErrorKind};

    #[test]
    fn test_unsupported_transport_maps_to_501() {
        let err = TetherProxyError::UnsupportedTransport(TransportType::Udp);
        assert_eq!(err.http_status_code(), 501);
        assert_eq!(err.error_code(), "UNSUPPORTED_TRANSPORT");
        assert!(err.to_string().contains("udp"));
    }

    #[test]
    fn test_http_status_codes() {
        assert_eq!(
            TetherProxyError::ConfigNotFound(PathBuf::new()).http_status_code(),
            404
        );
        assert_eq!(TetherProxyError::NoConnection.http_status_code(), 409);
        assert_eq!(
            TetherProxyError::ConfigValidationError("x".into()).http_status_code(),
            422
        );
        assert_eq!(TetherProxyError::PortUnavailable.http_status_code(), 503);
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoErr::new(ErrorKind::NotFound, "file not found");
        let err: TetherProxyError = io_err.into();
        assert!(matches!(err, TetherProxyError::IoError(_)));
        assert_eq!(err.error_code(), "IO_ERROR");
    }

    #[test]
    fn test_from_config_validation_errors() {
        use crate::config::ConfigError;

        let err: TetherProxyError = ConfigError::MultipleValidationErrors(vec![
            ConfigError::ValidationError {
                field: "proxy.listen_port".into(),
                message: "must not be 0".into(),
            },
            ConfigError::ValidationError {
                field: "server.api_port".into(),
                message: "must not be 0".into(),
            },
        ])
        .into();

        let message = err.to_string();
        assert!(message.contains("proxy.listen_port"));
        assert!(message.contains("server.api_port"));
        assert!(matches!(err, TetherProxyError::ConfigValidationError(_)));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<TetherProxyError>();
        assert_sync::<TetherProxyError>();
    }
}
