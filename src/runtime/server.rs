//! Echo responder event loop.
//!
//! Every worker process registers the same inherited listening descriptor
//! with its own reactor. When a connection arrives all workers may wake;
//! the ones that lose the accept race see `WouldBlock` and move on.

use super::connection::{EchoConnection, EchoStep};
use super::reactor::{InterestSet, Reactor, Readiness};
use super::STOP_POLL_INTERVAL;
use crate::error::{Error, OsContext};
use mio::Token;
use slab::Slab;
use std::io;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Read-ahead allowed per connection before its echo is flushed, in buffers.
const PENDING_BUFFERS: usize = 64;

pub struct EchoServer<'a, R> {
    worker_id: usize,
    reactor: R,
    listener: &'a TcpListener,
    connections: Slab<EchoConnection<TcpStream>>,
    scratch: Vec<u8>,
    max_pending: usize,
}

impl<'a, R: Reactor> EchoServer<'a, R> {
    pub fn new(worker_id: usize, reactor: R, listener: &'a TcpListener, buffer_size: usize) -> Self {
        let buffer_size = buffer_size.max(1);
        Self {
            worker_id,
            reactor,
            listener,
            connections: Slab::new(),
            scratch: vec![0u8; buffer_size],
            max_pending: buffer_size * PENDING_BUFFERS,
        }
    }

    /// Serve connections until `stop` is raised. A failed `accept` other
    /// than a lost race ends the worker.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), Error> {
        self.reactor
            .register(self.listener.as_raw_fd(), LISTENER_TOKEN, InterestSet::ReadWait)
            .os_context("register")?;

        info!(
            worker = self.worker_id,
            edge_triggered = self.reactor.is_edge_triggered(),
            "Worker accepting connections"
        );

        let mut ready = Vec::new();
        while !stop.load(Ordering::Relaxed) {
            self.reactor
                .wait(Some(STOP_POLL_INTERVAL), &mut ready)
                .os_context("wait")?;

            for readiness in &ready {
                match readiness.token {
                    LISTENER_TOKEN => self.accept_connections().os_context("accept")?,
                    Token(conn_id) => {
                        if let Err(e) = self.handle_connection_event(conn_id, *readiness) {
                            debug!(conn_id, error = %e, "Connection error");
                            self.close_connection(conn_id);
                        }
                    }
                }
            }
        }

        info!(
            worker = self.worker_id,
            open_connections = self.connection_count(),
            "Worker stopping"
        );
        Ok(())
    }

    /// Number of connections currently open in this worker.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn accept_connections(&mut self) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    stream.set_nonblocking(true)?;

                    let entry = self.connections.vacant_entry();
                    let conn_id = entry.key();
                    self.reactor
                        .register(stream.as_raw_fd(), Token(conn_id), InterestSet::ReadWait)?;
                    entry.insert(EchoConnection::new(stream, self.max_pending));

                    debug!(
                        worker = self.worker_id,
                        conn_id,
                        peer = %peer_addr,
                        "Accepted connection"
                    );
                }
                // Drained, or another worker won the race for this connection.
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionAborted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn handle_connection_event(&mut self, conn_id: usize, readiness: Readiness) -> io::Result<()> {
        if !self.connections.contains(conn_id) {
            return Ok(());
        }

        if readiness.closed {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "hangup"));
        }

        if readiness.readable {
            let conn = &mut self.connections[conn_id];
            let step = conn.on_readable(&mut self.scratch)?;
            self.apply(conn_id, step)?;
        }

        // Re-check connection exists (may have been removed)
        if readiness.writable && self.connections.contains(conn_id) {
            let step = self.connections[conn_id].on_writable()?;
            self.apply(conn_id, step)?;
        }

        Ok(())
    }

    fn apply(&mut self, conn_id: usize, step: EchoStep) -> io::Result<()> {
        match step {
            EchoStep::Stay => Ok(()),
            EchoStep::Switch(interest) => {
                let fd = self.connections[conn_id].stream().as_raw_fd();
                self.reactor.modify(fd, Token(conn_id), interest)
            }
            EchoStep::Close => {
                self.close_connection(conn_id);
                Ok(())
            }
        }
    }

    fn close_connection(&mut self, conn_id: usize) {
        if let Some(conn) = self.connections.try_remove(conn_id) {
            let _ = self.reactor.deregister(conn.stream().as_raw_fd());
            debug!(
                worker = self.worker_id,
                conn_id,
                unflushed = conn.pending(),
                "Connection closed"
            );
        }
    }
}
