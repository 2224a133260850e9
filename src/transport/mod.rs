//! Non-blocking TCP transport.
//!
//! Components, leaves first:
//! - `addr`: host/port resolution
//! - `socket`: `SocketHandle`, an exclusively owned descriptor
//! - `poller`: `Multiplexer`, the edge-triggered readiness facility
//! - `connection`: `Connection`, the read/write engine
//! - `server`: `Server`, binds, listens and accepts
//! - `client`: `Client`, connects and exchanges
//!
//! Server and client both wait through a `Multiplexer` with a bounded
//! timeout; no call blocks indefinitely apart from an explicit accept wait.

mod addr;
mod client;
mod connection;
mod error;
mod poller;
mod server;
mod socket;

pub use addr::resolve;
pub use client::Client;
pub use connection::Connection;
pub use error::{Result, TransportError};
pub use poller::{Multiplexer, Readiness, ReadyEvent};
pub use server::{ConnectionId, Server, ServerEvent};
pub use socket::{ConnectProgress, SocketHandle, SocketState};

use serde::Deserialize;
use std::time::Duration;

/// Default listening/connecting port of the edge connector.
pub const DEFAULT_PORT: u16 = 5300;

/// What closing a served connection does to the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoopMode {
    /// Closing the connection closes the listener as well.
    SingleShot,
    /// The listener stays open for the next client.
    #[default]
    Looping,
}

/// Tunables shared by server and client.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Receive buffer size; larger messages are truncated per read.
    pub buffer_size: usize,
    pub backlog: i32,
    /// Events collected per multiplexer wait.
    pub max_events: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub accept_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            backlog: 16,
            max_events: 32,
            read_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
            accept_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

/// A loopback port nothing is listening on right now.
#[cfg(test)]
pub(crate) fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .unwrap()
}
