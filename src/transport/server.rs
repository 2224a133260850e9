//! Listener role: bind, listen, accept and serve connections.
//!
//! Accepted connections live in a slab keyed by `ConnectionId`; a second
//! map from descriptor to slot lets multiplexer events be dispatched to the
//! connection that owns them.

use super::addr::resolve;
use super::connection::Connection;
use super::error::{Result, TransportError};
use super::poller::{Multiplexer, Readiness, ReadyEvent};
use super::socket::SocketHandle;
use super::{LoopMode, TransportConfig};
use bytes::Bytes;
use mio::Interest;
use slab::Slab;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Identifies one accepted connection.
///
/// Slab slots are reused, so the id also carries the accept sequence number;
/// a stale id never resolves to a newer connection in the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    slot: usize,
    seq: u64,
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.seq)
    }
}

struct Entry {
    seq: u64,
    conn: Connection,
}

/// Readiness reported by `Server::poll`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    /// A client is waiting to be accepted.
    Incoming,
    Ready {
        id: ConnectionId,
        readiness: Readiness,
    },
}

pub struct Server {
    listener: SocketHandle,
    local_addr: SocketAddr,
    mux: Multiplexer,
    connections: Slab<Entry>,
    by_fd: HashMap<RawFd, usize>,
    loop_mode: LoopMode,
    accepted: u64,
    config: TransportConfig,
}

impl Server {
    /// Open, bind, listen and register a listening socket on `host:port`.
    ///
    /// Every resolved candidate is tried in order until one binds.
    pub fn bind(host: &str, port: u16, config: TransportConfig) -> Result<Self> {
        let mut last_err = None;

        for addr in resolve(host, port)? {
            match open_listener(&addr, config.backlog) {
                Ok(listener) => return Self::with_listener(listener, config),
                Err(e @ TransportError::BindFailure { .. }) => {
                    debug!(%addr, error = %e, "Bind attempt failed");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| TransportError::InvalidAddress {
            host: host.to_string(),
            reason: "no candidate addresses".to_string(),
        }))
    }

    fn with_listener(mut listener: SocketHandle, config: TransportConfig) -> Result<Self> {
        let setup = listener.local_addr().and_then(|local_addr| {
            let mut mux = Multiplexer::new(config.max_events)?;
            mux.register(listener.fd(), Interest::READABLE | Interest::WRITABLE)?;
            Ok((local_addr, mux))
        });
        let (local_addr, mux) = match setup {
            Ok(parts) => parts,
            Err(e) => {
                listener.close();
                return Err(e);
            }
        };

        info!(addr = %local_addr, fd = listener.fd(), "Server listening");

        Ok(Self {
            listener,
            local_addr,
            mux,
            connections: Slab::new(),
            by_fd: HashMap::new(),
            loop_mode: LoopMode::default(),
            accepted: 0,
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn is_listening(&self) -> bool {
        !self.listener.is_closed()
    }

    /// Number of open accepted connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of descriptors registered with the multiplexer, listener included.
    pub fn registered_count(&self) -> usize {
        self.mux.len()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections
            .get(id.slot)
            .filter(|entry| entry.seq == id.seq)
            .map(|entry| &entry.conn)
    }

    /// Accept the next client, waiting up to the accept timeout.
    ///
    /// Would-block on the listener means "no client yet" and is waited out
    /// rather than treated as fatal. On success `loop_mode` decides what a
    /// later `close` does to the listener.
    pub fn accept(&mut self, loop_mode: LoopMode) -> Result<ConnectionId> {
        if self.listener.is_closed() {
            return Err(TransportError::Closed);
        }

        let deadline = Instant::now() + self.config.accept_timeout;
        loop {
            match self.listener.accept() {
                Ok((handle, peer)) => return self.track(handle, peer, loop_mode),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    return Err(TransportError::AcceptFailure(e));
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero()
                || self
                    .mux
                    .wait_for(self.listener.fd(), Interest::READABLE, remaining)?
                    .is_none()
            {
                return Err(TransportError::AcceptTimedOut);
            }
        }
    }

    fn track(
        &mut self,
        handle: SocketHandle,
        peer: SocketAddr,
        loop_mode: LoopMode,
    ) -> Result<ConnectionId> {
        let fd = handle.fd();
        let mut conn = Connection::new(handle, peer, self.config.buffer_size);
        if let Err(e) = self.mux.register(fd, Interest::READABLE | Interest::WRITABLE) {
            conn.close(&mut self.mux)?;
            return Err(e);
        }

        self.loop_mode = loop_mode;
        self.accepted += 1;
        let seq = self.accepted;
        let slot = self.connections.insert(Entry { seq, conn });
        self.by_fd.insert(fd, slot);
        info!(conn_id = seq, fd, peer = %peer, "Accepted connection");
        Ok(ConnectionId { slot, seq })
    }

    /// Read one message from `id`, waiting up to the read timeout.
    pub fn read(&mut self, id: ConnectionId, max_bytes: usize) -> Result<Bytes> {
        let timeout = self.config.read_timeout;
        let accepted = self.accepted;
        let Some(entry) = self.connections.get_mut(id.slot).filter(|e| e.seq == id.seq) else {
            return Err(missing(accepted));
        };
        let result = entry.conn.read(&mut self.mux, max_bytes, timeout);
        self.reap(id);
        result
    }

    /// Write all of `payload` to `id`, returning it back.
    pub fn write<'a>(&mut self, id: ConnectionId, payload: &'a [u8]) -> Result<&'a [u8]> {
        let timeout = self.config.write_timeout;
        let accepted = self.accepted;
        let Some(entry) = self.connections.get_mut(id.slot).filter(|e| e.seq == id.seq) else {
            return Err(missing(accepted));
        };
        let result = entry.conn.write(&mut self.mux, payload, timeout);
        self.reap(id);
        result
    }

    /// Close `id`. In single-shot mode the listener is closed too.
    ///
    /// Closing an already closed connection is a no-op.
    pub fn close(&mut self, id: ConnectionId) -> Result<()> {
        let closed = if self.connection(id).is_some() {
            let Entry { mut conn, .. } = self.connections.remove(id.slot);
            self.by_fd.remove(&conn.fd());
            conn.close(&mut self.mux)
        } else {
            Ok(())
        };

        if self.loop_mode == LoopMode::SingleShot {
            self.close_listener()?;
        }
        closed
    }

    /// Wait up to `timeout` and dispatch readiness to its owners.
    ///
    /// Each connection's readiness flags are updated in place; an empty
    /// result means no activity within the window.
    pub fn poll(&mut self, timeout: Duration) -> Result<Vec<ServerEvent>> {
        let batch = self.mux.poll(self.config.max_events, Some(timeout))?;
        let mut dispatched = Vec::with_capacity(batch.len());

        for ReadyEvent { fd, readiness } in batch {
            if let Some(&slot) = self.by_fd.get(&fd) {
                if let Some(entry) = self.connections.get_mut(slot) {
                    entry.conn.set_readiness(readiness);
                    dispatched.push(ServerEvent::Ready {
                        id: ConnectionId {
                            slot,
                            seq: entry.seq,
                        },
                        readiness,
                    });
                }
            } else if fd == self.listener.fd() && !self.listener.is_closed() {
                dispatched.push(ServerEvent::Incoming);
            }
        }
        Ok(dispatched)
    }

    /// Close every connection and the listener.
    pub fn shutdown(&mut self) -> Result<()> {
        let mut first_err = None;
        for Entry { mut conn, .. } in self.connections.drain() {
            if let Err(e) = conn.close(&mut self.mux) {
                first_err.get_or_insert(e);
            }
        }
        self.by_fd.clear();

        self.close_listener()?;
        first_err.map_or(Ok(()), Err)
    }

    fn close_listener(&mut self) -> Result<()> {
        if self.listener.is_closed() {
            return Ok(());
        }
        let deregistered = self.mux.deregister(self.listener.fd());
        self.listener.close();
        info!(addr = %self.local_addr, "Listener closed");
        deregistered
    }

    /// Forget a connection that tore itself down after a hard failure.
    fn reap(&mut self, id: ConnectionId) {
        if self.connection(id).is_some_and(Connection::is_closed) {
            let entry = self.connections.remove(id.slot);
            self.by_fd.remove(&entry.conn.fd());
        }
    }
}

fn missing(accepted: u64) -> TransportError {
    if accepted == 0 {
        TransportError::NotListening
    } else {
        TransportError::Closed
    }
}

fn open_listener(addr: &SocketAddr, backlog: i32) -> Result<SocketHandle> {
    let mut handle = SocketHandle::open(addr)?;
    let result = handle
        .set_reuse_address()
        .and_then(|()| handle.set_nonblocking())
        .and_then(|()| handle.bind(addr))
        .and_then(|()| handle.listen(backlog));

    match result {
        Ok(()) => Ok(handle),
        Err(e) => {
            handle.close();
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{free_port, Client, SocketState};
    use std::thread;

    fn quick() -> TransportConfig {
        TransportConfig {
            read_timeout: Duration::from_millis(100),
            accept_timeout: Duration::from_millis(200),
            ..TransportConfig::default()
        }
    }

    #[test]
    fn test_bind_then_close_releases_port() {
        let port = free_port();
        let mut server = Server::bind("127.0.0.1", port, TransportConfig::default()).unwrap();
        assert!(server.is_listening());
        assert_eq!(server.local_addr().port(), port);
        assert_eq!(server.registered_count(), 1);

        server.shutdown().unwrap();
        assert!(!server.is_listening());
        assert_eq!(server.registered_count(), 0);

        // The port is free for a new listener
        let mut again = Server::bind("127.0.0.1", port, TransportConfig::default()).unwrap();
        again.shutdown().unwrap();
    }

    #[test]
    fn test_bind_rejects_zero_port() {
        assert!(matches!(
            Server::bind("127.0.0.1", 0, TransportConfig::default()),
            Err(TransportError::InvalidPort(0))
        ));
    }

    #[test]
    fn test_bind_in_use_port_fails() {
        let port = free_port();
        let _first = Server::bind("127.0.0.1", port, TransportConfig::default()).unwrap();
        assert!(matches!(
            Server::bind("127.0.0.1", port, TransportConfig::default()),
            Err(TransportError::BindFailure { .. })
        ));
    }

    #[test]
    fn test_io_before_accept_is_not_listening() {
        let mut server = Server::bind("127.0.0.1", free_port(), quick()).unwrap();
        assert!(matches!(
            server.read(ConnectionId { slot: 0, seq: 1 }, 0),
            Err(TransportError::NotListening)
        ));
        assert!(matches!(
            server.write(ConnectionId { slot: 0, seq: 1 }, b"x"),
            Err(TransportError::NotListening)
        ));
    }

    #[test]
    fn test_accept_without_client_times_out() {
        let mut server = Server::bind("127.0.0.1", free_port(), quick()).unwrap();
        let err = server.accept(LoopMode::Looping).unwrap_err();
        assert!(matches!(err, TransportError::AcceptTimedOut));
        assert!(err.is_recoverable());
        assert!(server.is_listening());
    }

    #[test]
    fn test_ping_pong_exchange() {
        let port = free_port();
        let mut server = Server::bind("127.0.0.1", port, TransportConfig::default()).unwrap();

        let client = thread::spawn(move || {
            let mut client = Client::connect("127.0.0.1", port, TransportConfig::default()).unwrap();
            assert_eq!(client.write(b"ping").unwrap(), b"ping");
            let reply = client.read(0).unwrap();
            client.close().unwrap();
            assert_eq!(client.state(), SocketState::Closed);
            reply
        });

        let id = server.accept(LoopMode::SingleShot).unwrap();
        let request = server.read(id, 0).unwrap();
        assert_eq!(&request[..], b"ping");
        server.write(id, b"pong").unwrap();

        assert_eq!(&client.join().unwrap()[..], b"pong");

        server.close(id).unwrap();
        assert_eq!(server.connection_count(), 0);
        assert!(!server.is_listening());
        assert_eq!(server.registered_count(), 0);
    }

    #[test]
    fn test_close_twice_is_harmless() {
        let port = free_port();
        let mut server = Server::bind("127.0.0.1", port, TransportConfig::default()).unwrap();
        let client = thread::spawn(move || {
            Client::connect("127.0.0.1", port, TransportConfig::default()).unwrap()
        });

        let id = server.accept(LoopMode::Looping).unwrap();
        let _client = client.join().unwrap();

        server.close(id).unwrap();
        server.close(id).unwrap();
        assert!(server.is_listening());
        assert_eq!(server.registered_count(), 1);
        assert!(matches!(server.read(id, 0), Err(TransportError::Closed)));
    }

    #[test]
    fn test_sequential_accept_cycles_are_independent() {
        let port = free_port();
        let mut server = Server::bind("127.0.0.1", port, TransportConfig::default()).unwrap();

        for round in 0..2u8 {
            let client = thread::spawn(move || {
                let mut client =
                    Client::connect("127.0.0.1", port, TransportConfig::default()).unwrap();
                client.write(&[b'a' + round]).unwrap();
                let reply = client.read(0).unwrap();
                client.close().unwrap();
                reply
            });

            let id = server.accept(LoopMode::Looping).unwrap();
            assert_eq!(server.connection_count(), 1);
            let request = server.read(id, 0).unwrap();
            assert_eq!(&request[..], &[b'a' + round]);
            server.write(id, &request).unwrap();
            assert_eq!(client.join().unwrap(), request);
            server.close(id).unwrap();

            assert!(server.is_listening());
            assert_eq!(server.connection_count(), 0);
        }
    }

    #[test]
    fn test_single_shot_cycles_on_the_same_port() {
        let port = free_port();

        for round in 0..2u8 {
            let mut server = Server::bind("127.0.0.1", port, TransportConfig::default()).unwrap();
            let client = thread::spawn(move || {
                let mut client =
                    Client::connect("127.0.0.1", port, TransportConfig::default()).unwrap();
                client.write(&[b'a' + round]).unwrap();
                let reply = client.read(0).unwrap();
                client.close().unwrap();
                reply
            });

            let id = server.accept(LoopMode::SingleShot).unwrap();
            let request = server.read(id, 0).unwrap();
            assert_eq!(&request[..], &[b'a' + round]);
            server.write(id, &request).unwrap();
            assert_eq!(client.join().unwrap(), request);

            server.close(id).unwrap();
            assert!(!server.is_listening());
            assert_eq!(server.connection_count(), 0);
            assert_eq!(server.registered_count(), 0);
        }
    }

    #[test]
    fn test_timed_out_accept_keeps_loop_mode() {
        let port = free_port();
        let mut server = Server::bind("127.0.0.1", port, quick()).unwrap();
        let client = thread::spawn(move || {
            Client::connect("127.0.0.1", port, TransportConfig::default()).unwrap()
        });

        let id = server.accept(LoopMode::Looping).unwrap();
        let _client = client.join().unwrap();
        assert!(matches!(
            server.accept(LoopMode::SingleShot),
            Err(TransportError::AcceptTimedOut)
        ));
        assert_eq!(server.loop_mode(), LoopMode::Looping);

        server.close(id).unwrap();
        assert!(server.is_listening());
        assert_eq!(server.registered_count(), 1);
    }

    #[test]
    fn test_concurrent_connections_do_not_interfere() {
        let port = free_port();
        let mut server = Server::bind("127.0.0.1", port, TransportConfig::default()).unwrap();

        let mut first = Client::connect("127.0.0.1", port, TransportConfig::default()).unwrap();
        let a = server.accept(LoopMode::Looping).unwrap();
        let mut second = Client::connect("127.0.0.1", port, TransportConfig::default()).unwrap();
        let b = server.accept(LoopMode::Looping).unwrap();
        assert_ne!(a, b);

        first.write(b"first").unwrap();
        second.write(b"second").unwrap();

        // Reading b first must not swallow a's readiness
        assert_eq!(&server.read(b, 0).unwrap()[..], b"second");
        assert_eq!(&server.read(a, 0).unwrap()[..], b"first");

        server.close(a).unwrap();
        assert_eq!(&server.write(b, b"still here").unwrap()[..], b"still here");
        assert_eq!(&second.read(0).unwrap()[..], b"still here");

        server.shutdown().unwrap();
        assert_eq!(server.registered_count(), 0);
    }

    #[test]
    fn test_peer_close_then_close() {
        let port = free_port();
        let mut server = Server::bind("127.0.0.1", port, quick()).unwrap();

        let mut client = Client::connect("127.0.0.1", port, TransportConfig::default()).unwrap();
        let id = server.accept(LoopMode::Looping).unwrap();
        client.finish_connect().unwrap();
        client.close().unwrap();

        let mut outcome = server.read(id, 0);
        for _ in 0..20 {
            if !matches!(outcome, Err(TransportError::NoDataAvailable)) {
                break;
            }
            outcome = server.read(id, 0);
        }
        assert!(matches!(outcome, Err(TransportError::PeerClosed)));
        assert!(server.connection(id).unwrap().is_read_closed());

        server.close(id).unwrap();
        assert!(server.connection(id).is_none());
    }

    #[test]
    fn test_read_waits_then_gives_up() {
        let port = free_port();
        let mut server = Server::bind("127.0.0.1", port, quick()).unwrap();

        let client = thread::spawn(move || {
            let mut client = Client::connect("127.0.0.1", port, TransportConfig::default()).unwrap();
            thread::sleep(Duration::from_millis(300));
            client.write(b"late").unwrap();
            thread::sleep(Duration::from_millis(200));
            client.close().unwrap();
        });

        let id = server.accept(LoopMode::Looping).unwrap();
        assert!(matches!(
            server.read(id, 0),
            Err(TransportError::NoDataAvailable)
        ));

        let mut data = None;
        for _ in 0..30 {
            match server.read(id, 0) {
                Ok(bytes) => {
                    data = Some(bytes);
                    break;
                }
                Err(TransportError::NoDataAvailable) => continue,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(&data.expect("late data should arrive")[..], b"late");
        client.join().unwrap();
    }

    #[test]
    fn test_poll_dispatches_to_owner() {
        let port = free_port();
        let mut server = Server::bind("127.0.0.1", port, TransportConfig::default()).unwrap();

        let mut client = Client::connect("127.0.0.1", port, TransportConfig::default()).unwrap();
        let mut incoming = false;
        for _ in 0..20 {
            let events = server.poll(Duration::from_millis(100)).unwrap();
            if events.contains(&ServerEvent::Incoming) {
                incoming = true;
                break;
            }
        }
        assert!(incoming);

        let id = server.accept(LoopMode::Looping).unwrap();
        client.write(b"hi").unwrap();

        let mut readable = false;
        for _ in 0..20 {
            let events = server.poll(Duration::from_millis(100)).unwrap();
            if events.iter().any(|e| {
                matches!(e, ServerEvent::Ready { id: ready, readiness } if *ready == id && readiness.readable)
            }) {
                readable = true;
                break;
            }
        }
        assert!(readable);
        assert!(server.connection(id).unwrap().readiness().readable);
        assert_eq!(&server.read(id, 0).unwrap()[..], b"hi");
    }
}
