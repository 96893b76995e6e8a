//! Error types for the proxy engine.
//!
//! Per-connection faults are contained in the task that raised them. The
//! variants here let that task decide how loudly to report a failure:
//! a peer hanging up is routine, a shutdown is silent, anything else is an
//! error.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use snare_id::SessionId;
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Configuration validation failures. Any one of these aborts startup.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no endpoints configured")]
    NoEndpoints,

    #[error("endpoint {index}: invalid port range {start}-{end}")]
    InvalidPortRange { index: usize, start: u16, end: u16 },

    #[error("endpoint {index}: invalid listening address '{address}'")]
    InvalidAddress { index: usize, address: String },

    #[error("endpoint {index}: forward endpoint requires a target host")]
    MissingTargetHost { index: usize },

    #[error("endpoint {index}: forward endpoint requires a target port between 1 and 65535")]
    MissingTargetPort { index: usize },

    #[error("buffer size must be at least 1 byte")]
    InvalidBufferSize,

    #[error("socket timeout must be at least 1 second")]
    InvalidTimeout,

    #[error("invalid log level '{0}'")]
    InvalidLogLevel(String),
}

/// Runtime errors raised while accepting, capturing or relaying.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// No data and no cancellation within the receive timeout.
    #[error("no data received within {0:?}")]
    Timeout(Duration),

    /// A write to the peer did not complete within the send timeout.
    #[error("no data sent within {0:?}")]
    SendTimeout(Duration),

    /// The shutdown signal fired while the operation was suspended.
    #[error("operation cancelled by shutdown")]
    Cancelled,

    /// The peer reset or aborted the connection.
    #[error("peer disconnected: {0}")]
    Disconnected(#[source] io::Error),

    /// The outbound connection to the forward target failed.
    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },

    /// A listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// A session id was inserted into the registry twice.
    #[error("session {0} is already registered")]
    DuplicateSession(SessionId),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

impl ProxyError {
    /// Returns true for peer-initiated disconnects that end a session cleanly.
    pub fn is_benign(&self) -> bool {
        matches!(self, ProxyError::Disconnected(_))
    }

    /// Returns true if the error is the shutdown signal unwinding a task.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProxyError::Cancelled)
    }

    /// Returns true for a receive or send timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProxyError::Timeout(_) | ProxyError::SendTimeout(_))
    }
}

impl From<io::Error> for ProxyError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => ProxyError::Disconnected(err),
            _ => ProxyError::Io(err),
        }
    }
}
