//! Error types for the hostlink bus.
//!
//! Every failure inside the bus is a `HostlinkError`. At the wire boundary the
//! error is converted into an [`RpcError`] whose code belongs to the closed set
//! in [`ErrorCode`].

use crate::protocol::{ErrorCode, RpcError};
use std::time::Duration;
use thiserror::Error;

/// Main error type for the hostlink bus.
#[derive(Debug, Error)]
pub enum HostlinkError {
    /// The peer answered with an error Response.
    #[error("Remote error {}: {}", .0.code, .0.message)]
    Remote(RpcError),

    // Correlation errors
    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Request id {id} is already pending")]
    DuplicateId { id: String },

    #[error("Request {id} was cancelled")]
    Cancelled { id: String },

    // Connection errors
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Transport error: {message}")]
    Transport { message: String },

    // Ambient errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for hostlink operations.
pub type Result<T> = std::result::Result<T, HostlinkError>;

impl From<std::io::Error> for HostlinkError {
    fn from(err: std::io::Error) -> Self {
        HostlinkError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for HostlinkError {
    fn from(err: serde_json::Error) -> Self {
        HostlinkError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for HostlinkError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => HostlinkError::ConnectionClosed,
            WsError::Io(io) => HostlinkError::Connection {
                message: io.to_string(),
            },
            other => HostlinkError::Transport {
                message: other.to_string(),
            },
        }
    }
}

impl From<axum::Error> for HostlinkError {
    fn from(err: axum::Error) -> Self {
        HostlinkError::Transport {
            message: err.to_string(),
        }
    }
}

impl From<RpcError> for HostlinkError {
    fn from(err: RpcError) -> Self {
        HostlinkError::Remote(err)
    }
}

impl HostlinkError {
    /// The closed-set error code this error maps onto.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            HostlinkError::Remote(err) => err.kind().unwrap_or(ErrorCode::ServerError),
            HostlinkError::Timeout(_) => ErrorCode::Timeout,

            HostlinkError::ConnectionClosed
            | HostlinkError::Connection { .. }
            | HostlinkError::Transport { .. } => ErrorCode::ConnectionError,

            HostlinkError::Cancelled { .. } => ErrorCode::ServerError,

            // Everything else is a bug or an environment failure on our side
            _ => ErrorCode::InternalError,
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Remote errors keep the code the peer sent, even when it lies outside
    /// the set this bus defines.
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            HostlinkError::Remote(err) => err.code,
            other => other.error_code().code(),
        }
    }

    /// Whether this error means the transport is gone.
    pub fn is_connection_error(&self) -> bool {
        self.to_rpc_error_code() == ErrorCode::ConnectionError.code()
    }

    /// Whether this error is a request deadline expiring.
    pub fn is_timeout(&self) -> bool {
        matches!(self, HostlinkError::Timeout(_))
    }
}

impl From<HostlinkError> for RpcError {
    fn from(err: HostlinkError) -> Self {
        match err {
            HostlinkError::Remote(inner) => inner,
            other => RpcError::new(other.error_code(), other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HostlinkError::DuplicateId { id: "7".into() };
        assert_eq!(err.to_string(), "Request id 7 is already pending");

        let err = HostlinkError::Timeout(Duration::from_secs(30));
        assert_eq!(err.to_string(), "Request timeout after 30s");
    }

    #[test]
    fn test_rpc_error_codes() {
        assert_eq!(
            HostlinkError::Remote(RpcError::parse_error("eof")).to_rpc_error_code(),
            -32700
        );
        assert_eq!(HostlinkError::ConnectionClosed.to_rpc_error_code(), -32002);
        assert_eq!(
            HostlinkError::Timeout(Duration::from_millis(5)).to_rpc_error_code(),
            -32001
        );
        assert_eq!(
            HostlinkError::Config {
                message: "bad port".into()
            }
            .to_rpc_error_code(),
            -32603
        );
    }

    #[test]
    fn test_remote_error_keeps_peer_code() {
        let err = HostlinkError::Remote(RpcError {
            code: -32050,
            message: "custom".into(),
            data: None,
        });
        assert_eq!(err.to_rpc_error_code(), -32050);
        assert_eq!(err.error_code(), ErrorCode::ServerError);
    }

    #[test]
    fn test_connection_errors_are_classified() {
        assert!(HostlinkError::ConnectionClosed.is_connection_error());
        assert!(HostlinkError::Transport {
            message: "reset".into()
        }
        .is_connection_error());
        assert!(!HostlinkError::Timeout(Duration::from_secs(1)).is_connection_error());
        assert!(HostlinkError::Timeout(Duration::from_secs(1)).is_timeout());
    }

    #[test]
    fn test_into_rpc_error() {
        let rpc: RpcError = HostlinkError::Config {
            message: "bad port".into(),
        }
        .into();
        assert_eq!(rpc.code, -32603);
        assert_eq!(rpc.message, "Configuration error: bad port");
        assert!(rpc.data.is_none());

        let remote = RpcError::invalid_params("missing id");
        let rpc: RpcError = HostlinkError::Remote(remote.clone()).into();
        assert_eq!(rpc, remote);
    }
}
