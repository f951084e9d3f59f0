//! Server error types.

use std::net::SocketAddr;

use thiserror::Error;

/// Result type for server setup and supervision.
pub type ServerResult<T> = Result<T, ServerError>;

/// Fatal errors raised while bringing the server up or tearing it down.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Listen address did not parse.
    #[error("invalid listen address '{addr}': {source}")]
    InvalidAddress {
        addr: String,
        source: std::net::AddrParseError,
    },

    /// Socket creation, bind or listen failed.
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// Detaching from the terminal failed.
    #[error("failed to daemonize: {0}")]
    Daemonize(std::io::Error),

    /// Signal handlers could not be installed.
    #[error("failed to install signal handlers: {0}")]
    Signal(std::io::Error),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from a single shared-log operation.
///
/// These never escape a connection worker or the heartbeat.
#[derive(Debug, Error)]
pub enum LogError {
    /// Opening, writing or reading the data file failed.
    #[error("data file error: {0}")]
    Store(std::io::Error),

    /// Streaming the log to the client failed.
    #[error("send to client failed: {0}")]
    Sink(std::io::Error),
}

/// Reasons a connection worker stops before the peer closes cleanly.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Receiving from the client failed.
    #[error("receive failed: {0}")]
    Receive(std::io::Error),

    /// Appending to or streaming the shared log failed.
    #[error(transparent)]
    Log(#[from] LogError),
}
