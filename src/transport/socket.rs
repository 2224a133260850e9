//! Owned OS socket with an explicit lifecycle.
//!
//! A `SocketHandle` is the only owner of its descriptor. It is moved into a
//! `Connection` at accept/connect time and never duplicated. `close()` drops
//! the underlying `socket2::Socket`, so the descriptor is released exactly
//! once no matter how many times `close()` is called.

use super::error::{Result, TransportError};
use socket2::{Domain, SockAddr, Socket, Type};
use std::io::{self, Read};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

/// Lifecycle state of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Created,
    Bound,
    Listening,
    /// Non-blocking connect issued, handshake not yet confirmed.
    Connecting,
    Connected,
    Closed,
}

/// Outcome of a connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectProgress {
    Connected,
    InProgress,
}

#[derive(Debug)]
pub struct SocketHandle {
    socket: Option<Socket>,
    fd: RawFd,
    state: SocketState,
}

impl SocketHandle {
    /// Open a TCP socket for the address family of `addr`.
    pub fn open(addr: &SocketAddr) -> Result<Self> {
        let socket = Socket::new(
            Domain::for_address(*addr),
            Type::STREAM,
            Some(socket2::Protocol::TCP),
        )
        .map_err(|e| TransportError::socket("socket", e))?;

        Ok(Self::from_socket(socket, SocketState::Created))
    }

    /// Wrap an already-open socket.
    fn from_socket(socket: Socket, state: SocketState) -> Self {
        let fd = socket.as_raw_fd();
        Self {
            socket: Some(socket),
            fd,
            state,
        }
    }

    fn socket(&self) -> Result<&Socket> {
        self.socket.as_ref().ok_or(TransportError::Closed)
    }

    /// Like `socket()` but for the I/O paths, which report `EBADF`.
    fn raw(&self) -> io::Result<&Socket> {
        self.socket
            .as_ref()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }

    /// Raw descriptor value. Stays readable after close for logging only.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SocketState::Closed
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let addr = self
            .socket()?
            .local_addr()
            .map_err(|e| TransportError::socket("getsockname", e))?;
        as_inet(addr)
    }

    pub fn set_reuse_address(&self) -> Result<()> {
        self.socket()?
            .set_reuse_address(true)
            .map_err(|e| TransportError::socket("setsockopt(SO_REUSEADDR)", e))
    }

    pub fn set_nonblocking(&self) -> Result<()> {
        self.socket()?
            .set_nonblocking(true)
            .map_err(|e| TransportError::socket("fcntl(O_NONBLOCK)", e))
    }

    pub fn bind(&mut self, addr: &SocketAddr) -> Result<()> {
        self.socket()?
            .bind(&SockAddr::from(*addr))
            .map_err(|source| TransportError::BindFailure {
                addr: *addr,
                source,
            })?;
        self.state = SocketState::Bound;
        Ok(())
    }

    pub fn listen(&mut self, backlog: i32) -> Result<()> {
        self.socket()?
            .listen(backlog)
            .map_err(TransportError::ListenFailure)?;
        self.state = SocketState::Listening;
        Ok(())
    }

    /// Accept one pending connection.
    ///
    /// The returned handle is already non-blocking. `WouldBlock` is passed
    /// through untouched so the caller can wait for listener readiness.
    pub fn accept(&self) -> io::Result<(SocketHandle, SocketAddr)> {
        let socket = self.raw()?;
        let (conn, peer) = socket.accept()?;
        conn.set_nonblocking(true)?;
        let peer = peer.as_socket().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "peer is not an inet address")
        })?;
        Ok((SocketHandle::from_socket(conn, SocketState::Connected), peer))
    }

    /// Start connecting to `addr`. The socket must already be non-blocking.
    pub fn connect(&mut self, addr: &SocketAddr) -> io::Result<ConnectProgress> {
        let socket = self.raw()?;
        match socket.connect(&SockAddr::from(*addr)) {
            Ok(()) => {
                self.state = SocketState::Connected;
                Ok(ConnectProgress::Connected)
            }
            Err(e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                self.state = SocketState::Connecting;
                Ok(ConnectProgress::InProgress)
            }
            Err(e) => Err(e),
        }
    }

    /// Check a pending connect after the descriptor reported writable.
    ///
    /// Returns `Ok(true)` once the handshake completed, `Ok(false)` if it
    /// is still in flight, or the socket error that failed it.
    pub fn finish_connect(&mut self) -> io::Result<bool> {
        let socket = self.raw()?;
        if let Some(err) = socket.take_error()? {
            return Err(err);
        }
        match socket.peer_addr() {
            Ok(_) => {
                self.state = SocketState::Connected;
                Ok(true)
            }
            Err(e) if e.raw_os_error() == Some(libc::ENOTCONN) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Single non-blocking receive.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut socket = self.raw()?;
        socket.read(buf)
    }

    /// Single non-blocking send. Never raises SIGPIPE on Linux.
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let socket = self.raw()?;
        socket.send_with_flags(buf, SEND_FLAGS)
    }

    /// Release the descriptor. Subsequent calls are no-ops.
    pub fn close(&mut self) {
        if self.socket.take().is_some() {
            self.state = SocketState::Closed;
        }
    }
}

fn as_inet(addr: SockAddr) -> Result<SocketAddr> {
    addr.as_socket().ok_or_else(|| {
        TransportError::socket(
            "getsockname",
            io::Error::new(io::ErrorKind::InvalidData, "not an inet address"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn fd_is_open(fd: RawFd) -> bool {
        unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
    }

    #[test]
    fn test_lifecycle_states() {
        let mut handle = SocketHandle::open(&loopback()).unwrap();
        assert_eq!(handle.state(), SocketState::Created);

        handle.set_reuse_address().unwrap();
        handle.bind(&loopback()).unwrap();
        assert_eq!(handle.state(), SocketState::Bound);

        handle.listen(16).unwrap();
        assert_eq!(handle.state(), SocketState::Listening);
        assert_ne!(handle.local_addr().unwrap().port(), 0);

        handle.close();
        assert_eq!(handle.state(), SocketState::Closed);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut handle = SocketHandle::open(&loopback()).unwrap();
        let fd = handle.fd();
        assert!(fd_is_open(fd));

        handle.close();
        assert!(handle.is_closed());
        handle.close();
        assert!(handle.is_closed());
    }

    #[test]
    fn test_operations_after_close_fail_cleanly() {
        let mut handle = SocketHandle::open(&loopback()).unwrap();
        handle.close();

        assert!(matches!(handle.set_nonblocking(), Err(TransportError::Closed)));
        assert!(matches!(handle.listen(1), Err(TransportError::Closed)));
        assert!(handle.local_addr().is_err());

        let mut buf = [0u8; 8];
        let err = handle.recv(&mut buf).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
        let err = handle.send(b"x").unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn test_accept_would_block_on_idle_listener() {
        let mut handle = SocketHandle::open(&loopback()).unwrap();
        handle.bind(&loopback()).unwrap();
        handle.listen(4).unwrap();
        handle.set_nonblocking().unwrap();

        let err = handle.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
