//! Per-socket non-blocking read/write engine.
//!
//! Used identically for server-accepted and client-connected sockets. Every
//! operation first attempts the syscall and only suspends on the
//! multiplexer after it observed `WouldBlock`, which is what edge-triggered
//! registration requires.

use super::error::{Result, TransportError};
use super::poller::{Multiplexer, Readiness};
use super::socket::{SocketHandle, SocketState};
use bytes::{Bytes, BytesMut};
use mio::Interest;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// An established (or establishing) TCP connection.
#[derive(Debug)]
pub struct Connection {
    handle: SocketHandle,
    peer: SocketAddr,
    readiness: Readiness,
    /// A zero-byte receive was seen; never read again.
    read_closed: bool,
    buffer_size: usize,
}

impl Connection {
    pub(crate) fn new(handle: SocketHandle, peer: SocketAddr, buffer_size: usize) -> Self {
        Self {
            handle,
            peer,
            readiness: Readiness::default(),
            read_closed: false,
            buffer_size: buffer_size.max(1),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.handle.fd()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.handle.local_addr()
    }

    pub fn state(&self) -> SocketState {
        self.handle.state()
    }

    /// Readiness last reported for this descriptor.
    pub fn readiness(&self) -> Readiness {
        self.readiness
    }

    pub(crate) fn set_readiness(&mut self, readiness: Readiness) {
        self.readiness = readiness;
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Whether the peer has shut down its sending side.
    pub fn is_read_closed(&self) -> bool {
        self.read_closed
    }

    /// Receive one message of at most `max_bytes` (0 means a full buffer).
    ///
    /// One receive is one message: anything beyond the buffer size stays in
    /// the socket and is returned by the next call. Waits up to `timeout`
    /// for data and then fails with `NoDataAvailable`. A zero-byte receive
    /// yields `PeerClosed` now and on every later call. Any other socket
    /// error tears the connection down.
    pub fn read(
        &mut self,
        mux: &mut Multiplexer,
        max_bytes: usize,
        timeout: Duration,
    ) -> Result<Bytes> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.read_closed {
            return Err(TransportError::PeerClosed);
        }

        let deadline = Instant::now() + timeout;
        if !self.ensure_connected(mux, deadline)? {
            return Err(TransportError::NoDataAvailable);
        }

        let len = match max_bytes {
            0 => self.buffer_size,
            n => n.min(self.buffer_size),
        };
        let mut buf = BytesMut::zeroed(len);

        loop {
            match self.handle.recv(&mut buf) {
                Ok(0) => {
                    debug!(fd = self.fd(), peer = %self.peer, "Peer closed connection");
                    self.read_closed = true;
                    return Err(TransportError::PeerClosed);
                }
                Ok(n) => {
                    buf.truncate(n);
                    debug!(fd = self.fd(), bytes = n, "Received");
                    return Ok(buf.freeze());
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.teardown(mux, "recv", &e);
                    return Err(TransportError::socket("recv", e));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::NoDataAvailable);
            }
            match mux.wait_for(self.fd(), Interest::READABLE, deadline - now)? {
                Some(readiness) => self.readiness = readiness,
                None => return Err(TransportError::NoDataAvailable),
            }
        }
    }

    /// Send all of `payload`, returning it back to the caller.
    ///
    /// Partial writes are continued after waiting for writability. If the
    /// socket does not drain within `timeout`, or any send fails, the
    /// connection is torn down.
    pub fn write<'a>(
        &mut self,
        mux: &mut Multiplexer,
        payload: &'a [u8],
        timeout: Duration,
    ) -> Result<&'a [u8]> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let deadline = Instant::now() + timeout;
        if !self.ensure_connected(mux, deadline)? {
            return Err(self.connect_timed_out(mux));
        }

        let mut written = 0;
        while written < payload.len() {
            match self.handle.send(&payload[written..]) {
                Ok(0) => {
                    let e = io::Error::from(io::ErrorKind::WriteZero);
                    self.teardown(mux, "send", &e);
                    return Err(TransportError::socket("send", e));
                }
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match mux.wait_for(self.fd(), Interest::WRITABLE, remaining)? {
                        Some(readiness) => self.readiness = readiness,
                        None => {
                            let e = io::Error::new(
                                io::ErrorKind::TimedOut,
                                format!("{written} of {} bytes sent", payload.len()),
                            );
                            self.teardown(mux, "send", &e);
                            return Err(TransportError::socket("send", e));
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.teardown(mux, "send", &e);
                    return Err(TransportError::socket("send", e));
                }
            }
        }

        debug!(fd = self.fd(), bytes = written, "Sent");
        Ok(payload)
    }

    /// Wait up to `timeout` for a pending connect to complete.
    pub fn finish_connect(&mut self, mux: &mut Multiplexer, timeout: Duration) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.ensure_connected(mux, Instant::now() + timeout)? {
            Ok(())
        } else {
            Err(self.connect_timed_out(mux))
        }
    }

    /// Deregister and release the descriptor. Calling it again is a no-op.
    pub fn close(&mut self, mux: &mut Multiplexer) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let deregistered = mux.deregister(self.fd());
        self.handle.close();
        debug!(fd = self.fd(), peer = %self.peer, "Connection closed");
        deregistered
    }

    /// Drive a non-blocking connect to completion.
    ///
    /// Returns `Ok(false)` if the handshake is still pending at `deadline`.
    fn ensure_connected(&mut self, mux: &mut Multiplexer, deadline: Instant) -> Result<bool> {
        while self.handle.state() == SocketState::Connecting {
            match self.handle.finish_connect() {
                Ok(true) => {
                    debug!(fd = self.fd(), peer = %self.peer, "Connection established");
                    return Ok(true);
                }
                Ok(false) => {}
                Err(e) => {
                    self.teardown(mux, "connect", &e);
                    return Err(TransportError::ConnectFailure {
                        addr: self.peer.to_string(),
                        source: e,
                    });
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            if let Some(readiness) = mux.wait_for(self.fd(), Interest::WRITABLE, deadline - now)? {
                self.readiness = readiness;
            }
        }
        Ok(true)
    }

    fn connect_timed_out(&mut self, mux: &mut Multiplexer) -> TransportError {
        let e = io::Error::new(io::ErrorKind::TimedOut, "connect still in progress");
        self.teardown(mux, "connect", &e);
        TransportError::ConnectFailure {
            addr: self.peer.to_string(),
            source: e,
        }
    }

    /// Hard failure: close this connection only.
    fn teardown(&mut self, mux: &mut Multiplexer, op: &'static str, error: &io::Error) {
        warn!(fd = self.fd(), peer = %self.peer, op, error = %error, "Tearing down connection");
        if let Err(e) = self.close(mux) {
            debug!(fd = self.fd(), error = %e, "Deregistration failed during teardown");
        }
    }
}
