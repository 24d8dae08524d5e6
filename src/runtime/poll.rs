//! Level-triggered reactor backed by poll(2).
//!
//! Readiness is reported for as long as the condition holds, so draining is
//! optional here. Keeps a dense pollfd table with a descriptor index for
//! O(1) modify and swap-remove deregistration.

use super::reactor::{InterestSet, Reactor, Readiness};
use mio::Token;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

#[derive(Default)]
pub struct LevelReactor {
    fds: Vec<libc::pollfd>,
    tokens: Vec<Token>,
    index: HashMap<RawFd, usize>,
}

impl LevelReactor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Reactor for LevelReactor {
    fn register(&mut self, fd: RawFd, token: Token, interest: InterestSet) -> io::Result<()> {
        if self.index.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "descriptor already registered",
            ));
        }

        self.index.insert(fd, self.fds.len());
        self.fds.push(libc::pollfd {
            fd,
            events: interest.to_poll_events(),
            revents: 0,
        });
        self.tokens.push(token);
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, token: Token, interest: InterestSet) -> io::Result<()> {
        let idx = *self
            .index
            .get(&fd)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "descriptor not registered"))?;

        self.fds[idx].events = interest.to_poll_events();
        self.tokens[idx] = token;
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        let idx = self
            .index
            .remove(&fd)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "descriptor not registered"))?;

        self.fds.swap_remove(idx);
        self.tokens.swap_remove(idx);
        if let Some(moved) = self.fds.get(idx) {
            self.index.insert(moved.fd, idx);
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>, ready: &mut Vec<Readiness>) -> io::Result<()> {
        ready.clear();

        let timeout_ms = match timeout {
            Some(d) => d.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
            None => -1,
        };

        for pfd in &mut self.fds {
            pfd.revents = 0;
        }

        // SAFETY: `fds` is a valid, exclusively borrowed pollfd array of the given length.
        let rc = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        for (pfd, token) in self.fds.iter().zip(&self.tokens) {
            if pfd.revents == 0 {
                continue;
            }
            ready.push(Readiness {
                token: *token,
                readable: pfd.revents & libc::POLLIN != 0,
                writable: pfd.revents & libc::POLLOUT != 0,
                closed: pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0,
            });
        }

        Ok(())
    }

    fn is_edge_triggered(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_deregister_keeps_index_consistent() {
        let mut reactor = LevelReactor::new();
        reactor.register(10, Token(0), InterestSet::ReadWait).unwrap();
        reactor.register(11, Token(1), InterestSet::ReadWait).unwrap();
        reactor.register(12, Token(2), InterestSet::WriteWait).unwrap();

        reactor.deregister(10).unwrap();
        assert_eq!(reactor.fds.len(), 2);

        // fd 12 was swapped into slot 0 and must still be addressable
        reactor.modify(12, Token(2), InterestSet::ReadWait).unwrap();
        reactor.deregister(12).unwrap();
        reactor.deregister(11).unwrap();
        assert!(reactor.fds.is_empty());
        assert!(reactor.deregister(11).is_err());
    }

    #[test]
    fn test_duplicate_register_rejected() {
        let mut reactor = LevelReactor::new();
        reactor.register(5, Token(0), InterestSet::ReadWait).unwrap();
        let err = reactor
            .register(5, Token(1), InterestSet::WriteWait)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_level_readiness_repeats_until_drained() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();

        let mut reactor = LevelReactor::new();
        let mut ready = Vec::new();
        reactor
            .register(server.as_raw_fd(), Token(4), InterestSet::ReadWait)
            .unwrap();
        client.write_all(b"ping").unwrap();

        for _ in 0..2 {
            reactor
                .wait(Some(Duration::from_secs(5)), &mut ready)
                .unwrap();
            assert_eq!(ready.len(), 1);
            assert_eq!(ready[0].token, Token(4));
            assert!(ready[0].readable);
        }
    }
}
