//! Thread-per-connection responder.
//!
//! The worker only multiplexes the shared listener; each accepted connection
//! gets its own OS thread doing blocking read-then-echo until the peer
//! leaves. Connection threads are detached and die with the process.

use super::poll::LevelReactor;
use super::reactor::{InterestSet, Reactor};
use super::STOP_POLL_INTERVAL;
use crate::error::{Error, OsContext};
use mio::Token;
use std::io::{self, Read, Write};
use std::net::TcpListener;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::{debug, info};

/// Accept connections until `stop` is raised, one thread per connection.
/// A failed `accept` other than a lost race ends the worker.
pub fn run(
    worker_id: usize,
    listener: &TcpListener,
    buffer_size: usize,
    stop: &AtomicBool,
) -> Result<(), Error> {
    let mut reactor = LevelReactor::new();
    reactor
        .register(listener.as_raw_fd(), Token(0), InterestSet::ReadWait)
        .os_context("register")?;

    info!(worker = worker_id, "Worker accepting connections (thread per connection)");

    let mut ready = Vec::new();
    let mut spawned: u64 = 0;

    while !stop.load(Ordering::Relaxed) {
        reactor
            .wait(Some(STOP_POLL_INTERVAL), &mut ready)
            .os_context("wait")?;
        if ready.is_empty() {
            continue;
        }

        loop {
            match listener.accept() {
                Ok((stream, peer_addr)) => {
                    stream.set_nonblocking(false).os_context("fcntl")?;
                    spawned += 1;

                    thread::Builder::new()
                        .name(format!("echo-{worker_id}-{spawned}"))
                        .spawn(move || match echo_until_closed(stream, buffer_size) {
                            Ok(bytes) => debug!(peer = %peer_addr, bytes, "Connection closed"),
                            Err(e) => debug!(peer = %peer_addr, error = %e, "Connection error"),
                        })
                        .os_context("pthread_create")?;
                }
                // Drained, or another worker won the race for this connection.
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionAborted => continue,
                Err(e) => return Err(e).os_context("accept"),
            }
        }
    }

    info!(worker = worker_id, connections_served = spawned, "Worker stopping");
    Ok(())
}

/// Blocking echo loop. Returns the number of bytes echoed once the peer
/// closes or resets the connection.
pub fn echo_until_closed<S: Read + Write>(mut stream: S, buffer_size: usize) -> io::Result<u64> {
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut total = 0u64;

    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => return Ok(total),
            Err(e) => return Err(e),
        };
        stream.write_all(&buf[..n])?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::create_listening_socket_on;
    use std::io::Cursor;
    use std::net::TcpStream;
    use std::sync::Arc;
    use std::time::Duration;

    /// In-memory duplex: reads from `input`, collects writes in `output`.
    struct Duplex {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_echo_until_closed() {
        let mut duplex = Duplex {
            input: Cursor::new(b"echo me please".to_vec()),
            output: Vec::new(),
        };

        let bytes = echo_until_closed(&mut duplex, 4).unwrap();
        assert_eq!(bytes, 14);
        assert_eq!(duplex.output, b"echo me please");
    }

    #[test]
    fn test_threaded_echo() {
        let listener = create_listening_socket_on("127.0.0.1:0".parse().unwrap(), true).unwrap();
        let addr = listener.local_addr().unwrap();
        let stop = Arc::new(AtomicBool::new(false));

        let server = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || run(0, &listener, 1024, &stop).unwrap())
        };

        for _ in 0..3 {
            let mut client = TcpStream::connect(addr).unwrap();
            client
                .set_read_timeout(Some(Duration::from_secs(10)))
                .unwrap();
            client.write_all(b"PING").unwrap();
            let mut buf = [0u8; 4];
            client.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"PING");
        }

        stop.store(true, Ordering::SeqCst);
        server.join().unwrap();
    }

    #[test]
    fn test_accept_failure_is_fatal() {
        // Bound but never listening, so accept fails with EINVAL.
        let socket =
            socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None).unwrap();
        socket.set_nonblocking(true).unwrap();
        let addr: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
        socket.bind(&addr.into()).unwrap();
        let listener: TcpListener = socket.into();

        let stop = AtomicBool::new(false);
        let done = AtomicBool::new(false);
        let result = thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..50 {
                    if done.load(Ordering::SeqCst) {
                        return;
                    }
                    thread::sleep(Duration::from_millis(100));
                }
                stop.store(true, Ordering::SeqCst);
            });
            let result = run(0, &listener, 64, &stop);
            done.store(true, Ordering::SeqCst);
            result
        });

        match result.expect_err("accept failure must end the worker") {
            Error::Os { context, source } => {
                assert_eq!(context, "accept");
                assert_eq!(source.raw_os_error(), Some(libc::EINVAL));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
