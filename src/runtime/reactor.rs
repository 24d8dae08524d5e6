//! Readiness multiplexing contract shared by the event-loop back-ends.
//!
//! Sockets are registered by raw descriptor and tagged with a `Token` that
//! the owner maps back to its connection table. A socket carries exactly one
//! `InterestSet` at a time; switching direction is always a `modify`.

use mio::Token;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Readiness a registered socket is currently waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterestSet {
    /// Waiting to be able to send.
    WriteWait,
    /// Waiting for bytes (or, for a listener, connections) to arrive.
    ReadWait,
}

impl InterestSet {
    pub(crate) fn to_mio(self) -> mio::Interest {
        match self {
            InterestSet::WriteWait => mio::Interest::WRITABLE,
            InterestSet::ReadWait => mio::Interest::READABLE,
        }
    }

    pub(crate) fn to_poll_events(self) -> libc::c_short {
        match self {
            InterestSet::WriteWait => libc::POLLOUT,
            InterestSet::ReadWait => libc::POLLIN,
        }
    }
}

/// One readiness notification for a registered socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    /// Error or hangup reported on the socket; the owner should close it.
    pub closed: bool,
}

/// A single-threaded readiness multiplexer.
pub trait Reactor {
    /// Start watching `fd` for `interest`.
    fn register(&mut self, fd: RawFd, token: Token, interest: InterestSet) -> io::Result<()>;

    /// Replace the interest of an already registered `fd`.
    fn modify(&mut self, fd: RawFd, token: Token, interest: InterestSet) -> io::Result<()>;

    /// Stop watching `fd`. Must happen before the descriptor is closed.
    fn deregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Block until at least one socket is ready or `timeout` elapses.
    ///
    /// `ready` is cleared and refilled. A wait interrupted by a signal
    /// returns successfully with no events so callers can check for stop.
    fn wait(&mut self, timeout: Option<Duration>, ready: &mut Vec<Readiness>) -> io::Result<()>;

    /// Whether readiness is only reported on transitions. When true, callers
    /// must drain a ready socket until it would block.
    fn is_edge_triggered(&self) -> bool;
}
