//! Connector role: resolve, connect, exchange, close.

use super::addr::resolve;
use super::connection::Connection;
use super::error::{Result, TransportError};
use super::poller::Multiplexer;
use super::socket::{ConnectProgress, SocketHandle, SocketState};
use super::TransportConfig;
use bytes::Bytes;
use mio::Interest;
use std::io;
use std::net::SocketAddr;
use tracing::{debug, info};

/// A single client connection with its own private multiplexer.
///
/// The connect is issued non-blocking. If it does not complete at once the
/// client is returned in the `Connecting` state; the first read or write
/// (or `finish_connect`) waits for the handshake to finish.
pub struct Client {
    conn: Connection,
    mux: Multiplexer,
    config: TransportConfig,
}

impl Client {
    /// Connect to `host:port`, trying each resolved address in order.
    ///
    /// Fails with `ConnectFailure` when resolution or socket creation fails
    /// or every candidate refuses immediately; a connect that is merely in
    /// progress is not a failure.
    pub fn connect(host: &str, port: u16, config: TransportConfig) -> Result<Self> {
        let target = format!("{host}:{port}");
        let addrs = resolve(host, port).map_err(|e| match e {
            TransportError::InvalidPort(_) => e,
            other => connect_failure(&target, other),
        })?;

        let mut last_err = None;
        for addr in addrs {
            match open_and_connect(&addr) {
                Ok((handle, progress)) => {
                    let client = Self::with_handle(handle, addr, config)
                        .map_err(|e| connect_failure(&target, e))?;
                    match progress {
                        ConnectProgress::Connected => {
                            info!(peer = %addr, fd = client.conn.fd(), "Connected")
                        }
                        ConnectProgress::InProgress => {
                            debug!(peer = %addr, fd = client.conn.fd(), "Connect in progress")
                        }
                    }
                    return Ok(client);
                }
                Err(e) => {
                    debug!(peer = %addr, error = %e, "Connect attempt failed");
                    last_err = Some(e);
                }
            }
        }

        Err(connect_failure(
            &target,
            last_err.unwrap_or_else(|| TransportError::InvalidAddress {
                host: host.to_string(),
                reason: "no candidate addresses".to_string(),
            }),
        ))
    }

    fn with_handle(
        mut handle: SocketHandle,
        peer: SocketAddr,
        config: TransportConfig,
    ) -> Result<Self> {
        let mut mux = match Multiplexer::new(config.max_events) {
            Ok(mux) => mux,
            Err(e) => {
                handle.close();
                return Err(e);
            }
        };
        if let Err(e) = mux.register(handle.fd(), Interest::READABLE | Interest::WRITABLE) {
            handle.close();
            return Err(e);
        }

        Ok(Self {
            conn: Connection::new(handle, peer, config.buffer_size),
            mux,
            config,
        })
    }

    pub fn state(&self) -> SocketState {
        self.conn.state()
    }

    pub fn is_connected(&self) -> bool {
        self.conn.state() == SocketState::Connected
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer_addr()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.conn.local_addr()
    }

    /// Wait up to the connect timeout for a pending handshake.
    pub fn finish_connect(&mut self) -> Result<()> {
        self.conn
            .finish_connect(&mut self.mux, self.config.connect_timeout)
    }

    /// Read one message, waiting up to the read timeout.
    pub fn read(&mut self, max_bytes: usize) -> Result<Bytes> {
        self.conn
            .read(&mut self.mux, max_bytes, self.config.read_timeout)
    }

    /// Write all of `payload`, returning it back.
    pub fn write<'a>(&mut self, payload: &'a [u8]) -> Result<&'a [u8]> {
        self.conn
            .write(&mut self.mux, payload, self.config.write_timeout)
    }

    /// Release the connection. Calling it again is a no-op.
    pub fn close(&mut self) -> Result<()> {
        self.conn.close(&mut self.mux)
    }
}

fn open_and_connect(addr: &SocketAddr) -> Result<(SocketHandle, ConnectProgress)> {
    let mut handle = SocketHandle::open(addr)?;
    let progress = handle.set_nonblocking().and_then(|()| {
        handle
            .connect(addr)
            .map_err(|e| TransportError::socket("connect", e))
    });

    match progress {
        Ok(progress) => Ok((handle, progress)),
        Err(e) => {
            handle.close();
            Err(e)
        }
    }
}

fn connect_failure(target: &str, err: TransportError) -> TransportError {
    let source = match err {
        TransportError::SocketFailure { source, .. } => source,
        other => io::Error::other(other),
    };
    TransportError::ConnectFailure {
        addr: target.to_string(),
        source,
    }
}
