//! Error types shared by the connection manager and the broadcast server.

use std::io;
use std::net::SocketAddr;

/// Failure while establishing a client connection.
///
/// Whichever step fails, nothing the attempt created outlives the error: no socket,
/// no runtime, no receiver thread.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("failed to resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        source: io::Error,
    },

    #[error("no addresses found for {host}:{port}")]
    NoAddress { host: String, port: u16 },

    #[error("failed to connect to {target}: {source}")]
    Connect { target: String, source: io::Error },

    #[error("failed to switch connection to non-blocking mode: {0}")]
    NonBlocking(#[source] io::Error),

    #[error("failed to start network runtime: {0}")]
    Runtime(#[source] io::Error),

    #[error("failed to spawn receiver thread: {0}")]
    Spawn(#[source] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("message is empty")]
    EmptyMessage,

    #[error("not connected")]
    NotConnected,

    /// The peer reset or aborted the connection; the manager is now disconnected.
    #[error("connection reset by peer: {0}")]
    ConnectionReset(#[source] io::Error),

    /// Transient write failure; the connection state is unchanged.
    #[error("write failed: {0}")]
    Io(#[source] io::Error),
}

impl SendError {
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, SendError::ConnectionReset(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to listen on {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),
}

/// Whether an I/O error means the peer is gone for good.
pub fn is_connection_lost(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe
    )
}

/// Errors a non-blocking read may report without anything being wrong.
pub fn is_retryable(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
