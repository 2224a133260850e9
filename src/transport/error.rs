//! Error taxonomy for the transport layer.
//!
//! Construction-time failures (bad port or address, bind/listen failures)
//! are fatal for the listener or connector that produced them. Soft
//! conditions on an established connection (`NoDataAvailable`,
//! `PeerClosed`, `AcceptTimedOut`) are reported as errors too, but callers
//! are expected to retry or close and move on.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid port {0}")]
    InvalidPort(u16),

    #[error("invalid address '{host}': {reason}")]
    InvalidAddress { host: String, reason: String },

    #[error("failed to bind {addr}: {source}")]
    BindFailure {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to listen: {0}")]
    ListenFailure(#[source] io::Error),

    #[error("failed to accept connection: {0}")]
    AcceptFailure(#[source] io::Error),

    /// No client arrived within the accept window.
    #[error("no pending client within the accept window")]
    AcceptTimedOut,

    #[error("failed to connect to {addr}: {source}")]
    ConnectFailure {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Read or write attempted before any connection was accepted.
    #[error("no accepted connection, call accept first")]
    NotListening,

    /// The bounded wait for data expired with nothing received.
    #[error("no data available")]
    NoDataAvailable,

    /// The peer shut down its sending side (zero-byte receive).
    #[error("connection closed by peer")]
    PeerClosed,

    /// The handle or connection has already been released.
    #[error("socket is closed")]
    Closed,

    #[error("failed to register descriptor {fd} with the poller: {source}")]
    RegistrationFailure {
        fd: i32,
        #[source]
        source: io::Error,
    },

    #[error("{op} failed: {source}")]
    SocketFailure {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl TransportError {
    pub(crate) fn socket(op: &'static str, source: io::Error) -> Self {
        TransportError::SocketFailure { op, source }
    }

    /// Whether the caller may retry or close and carry on.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TransportError::NoDataAvailable
                | TransportError::PeerClosed
                | TransportError::AcceptTimedOut
        )
    }

    /// The OS error code captured from the failing syscall, if any.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            TransportError::BindFailure { source, .. }
            | TransportError::ConnectFailure { source, .. }
            | TransportError::RegistrationFailure { source, .. }
            | TransportError::SocketFailure { source, .. } => source.raw_os_error(),
            TransportError::ListenFailure(source) | TransportError::AcceptFailure(source) => {
                source.raw_os_error()
            }
            _ => None,
        }
    }
}
