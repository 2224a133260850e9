//! Edge-triggered readiness multiplexer.
//!
//! Wraps a mio `Poll` (epoll on Linux, kqueue on macOS). mio registers
//! every source edge-triggered, so once a condition has been reported for a
//! descriptor it is not reported again until a read or write on that
//! descriptor has observed `WouldBlock`.
//!
//! Registrations are keyed by descriptor. Events that arrive for a
//! descriptor other than the one a caller is waiting on are parked in a
//! per-descriptor pending set and handed out to that descriptor's owner
//! later, so an edge is never lost and never delivered twice.

use super::error::{Result, TransportError};
use mio::event::Event;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};
use tracing::trace;

/// Readiness bits reported for a descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Both directions are gone (EPOLLHUP).
    pub hangup: bool,
    /// The peer shut down its write side (EPOLLRDHUP).
    pub peer_closed: bool,
    pub error: bool,
}

impl Readiness {
    fn from_event(event: &Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            hangup: event.is_write_closed(),
            peer_closed: event.is_read_closed(),
            error: event.is_error(),
        }
    }

    fn merge(&mut self, other: Readiness) {
        self.readable |= other.readable;
        self.writable |= other.writable;
        self.hangup |= other.hangup;
        self.peer_closed |= other.peer_closed;
        self.error |= other.error;
    }

    /// Whether this readiness should wake a caller waiting on `interest`.
    ///
    /// Hang-up and error always wake the caller so the next syscall can
    /// observe the terminal condition.
    pub fn satisfies(&self, interest: Interest) -> bool {
        (interest.is_readable() && (self.readable || self.peer_closed))
            || (interest.is_writable() && self.writable)
            || self.hangup
            || self.error
    }
}

/// One entry of a poll batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    pub fd: RawFd,
    pub readiness: Readiness,
}

pub struct Multiplexer {
    poll: Poll,
    events: Events,
    registrations: HashMap<RawFd, Interest>,
    pending: HashMap<RawFd, Readiness>,
}

impl Multiplexer {
    /// Create a multiplexer able to collect up to `max_events` per wait.
    pub fn new(max_events: usize) -> Result<Self> {
        let poll = Poll::new().map_err(|e| TransportError::socket("epoll_create", e))?;
        Ok(Self {
            poll,
            events: Events::with_capacity(max_events.max(1)),
            registrations: HashMap::new(),
            pending: HashMap::new(),
        })
    }

    /// Add `fd` with the given interest. A descriptor is registered at most once.
    pub fn register(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        if self.registrations.contains_key(&fd) {
            return Err(TransportError::RegistrationFailure {
                fd,
                source: io::Error::from(io::ErrorKind::AlreadyExists),
            });
        }

        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(fd as usize), interest)
            .map_err(|source| TransportError::RegistrationFailure { fd, source })?;
        self.registrations.insert(fd, interest);
        trace!(fd, ?interest, "Registered descriptor");
        Ok(())
    }

    /// Remove `fd`. Must run before the descriptor is closed. Removing an
    /// unknown descriptor is a no-op.
    pub fn deregister(&mut self, fd: RawFd) -> Result<()> {
        if self.registrations.remove(&fd).is_none() {
            return Ok(());
        }
        self.pending.remove(&fd);

        self.poll
            .registry()
            .deregister(&mut SourceFd(&fd))
            .map_err(|source| TransportError::RegistrationFailure { fd, source })?;
        trace!(fd, "Deregistered descriptor");
        Ok(())
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.registrations.contains_key(&fd)
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Wait up to `timeout` and return at most `max_events` ready descriptors.
    ///
    /// Readiness parked by earlier waits is returned first without blocking.
    /// An empty batch means no activity within the window.
    pub fn poll(&mut self, max_events: usize, timeout: Option<Duration>) -> Result<Vec<ReadyEvent>> {
        if self.events.capacity() < max_events {
            self.events = Events::with_capacity(max_events);
        }
        if self.pending.is_empty() {
            self.poll_once(timeout)?;
        }

        let fds: Vec<RawFd> = self.pending.keys().copied().take(max_events).collect();
        Ok(fds
            .into_iter()
            .filter_map(|fd| {
                self.pending
                    .remove(&fd)
                    .map(|readiness| ReadyEvent { fd, readiness })
            })
            .collect())
    }

    /// Suspend until `fd` is ready for `interest` or `timeout` elapses.
    ///
    /// Returns `None` on timeout. Readiness for other descriptors observed
    /// while waiting stays parked for their owners.
    pub fn wait_for(
        &mut self,
        fd: RawFd,
        interest: Interest,
        timeout: Duration,
    ) -> Result<Option<Readiness>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(readiness) = self.take_ready(fd, interest) {
                return Ok(Some(readiness));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.poll_once(Some(deadline - now))?;
        }
    }

    /// Take parked readiness for `fd` if it satisfies `interest`.
    pub fn take_ready(&mut self, fd: RawFd, interest: Interest) -> Option<Readiness> {
        match self.pending.get(&fd) {
            Some(readiness) if readiness.satisfies(interest) => self.pending.remove(&fd),
            _ => None,
        }
    }

    fn poll_once(&mut self, timeout: Option<Duration>) -> Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(TransportError::socket("epoll_wait", e)),
        }

        for event in self.events.iter() {
            let fd = event.token().0 as RawFd;
            // Deregistered between the kernel reporting and us reading it.
            if !self.registrations.contains_key(&fd) {
                continue;
            }
            let readiness = Readiness::from_event(event);
            trace!(fd, ?readiness, "Readiness");
            self.pending.entry(fd).or_default().merge(readiness);
        }
        Ok(())
    }
}
