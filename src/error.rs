//! Error types for tunnelcore

use std::time::Duration;

use thiserror::Error;

use crate::router::RouteDecisionError;

/// Main error type for tunnelcore
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    RouteDecision(#[from] RouteDecisionError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Reactor is not running")]
    ReactorClosed,
}

/// Result type alias for tunnelcore
pub type Result<T> = std::result::Result<T, Error>;

/// Terminal failure of a single tunnel.
///
/// Reported once through the tunnel's [`TunnelReport`](crate::tunnel::TunnelReport);
/// never retried inside the core. Cloneable so the report can be shared with
/// every handle watching the tunnel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
    /// Upstream unreachable while connecting
    #[error("Connect to {target} failed: {reason}")]
    Connect {
        target: String,
        kind: std::io::ErrorKind,
        reason: String,
    },

    /// Connecting exceeded its bound
    #[error("Connect to {target} timed out after {timeout:?}")]
    ConnectTimeout { target: String, timeout: Duration },

    /// Malformed or unsuccessful CONNECT response
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Read/write failure once relaying
    #[error("Relay I/O error: {reason}")]
    Io {
        kind: std::io::ErrorKind,
        reason: String,
    },
}

impl TunnelError {
    pub fn connect(target: impl ToString, err: &std::io::Error) -> Self {
        TunnelError::Connect {
            target: target.to_string(),
            kind: err.kind(),
            reason: err.to_string(),
        }
    }

    pub fn io(err: &std::io::Error) -> Self {
        TunnelError::Io {
            kind: err.kind(),
            reason: err.to_string(),
        }
    }

    /// Short label used for metrics and log fields
    pub fn label(&self) -> &'static str {
        match self {
            TunnelError::Connect { .. } => "connect",
            TunnelError::ConnectTimeout { .. } => "connect_timeout",
            TunnelError::Protocol(_) => "protocol",
            TunnelError::Io { .. } => "io",
        }
    }
}
