//! Edge-triggered reactor backed by mio (epoll).
//!
//! mio always registers with `EPOLLET`, so every notification is a
//! transition. Re-registering a socket re-arms it: if the new interest is
//! already satisfied, the next wait reports it.

use super::reactor::{InterestSet, Reactor, Readiness};
use mio::unix::SourceFd;
use mio::{Events, Poll, Token};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub struct EdgeReactor {
    poll: Poll,
    events: Events,
}

impl EdgeReactor {
    /// Create a reactor returning at most `capacity` events per wait.
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity.max(1)),
        })
    }
}

impl Reactor for EdgeReactor {
    fn register(&mut self, fd: RawFd, token: Token, interest: InterestSet) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, interest.to_mio())
    }

    fn modify(&mut self, fd: RawFd, token: Token, interest: InterestSet) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), token, interest.to_mio())
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    fn wait(&mut self, timeout: Option<Duration>, ready: &mut Vec<Readiness>) -> io::Result<()> {
        ready.clear();

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        ready.extend(self.events.iter().map(|event| Readiness {
            token: event.token(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            closed: event.is_error() || (event.is_read_closed() && event.is_write_closed()),
        }));

        Ok(())
    }

    fn is_edge_triggered(&self) -> bool {
        true
    }
}
