//! TCP socket construction.
//!
//! The responder binds its listener once in the supervisor so every forked
//! worker inherits the same descriptor. Client sockets are created by each
//! worker independently and never cross a process boundary.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};

const LISTEN_BACKLOG: i32 = 1024;

/// Create a listening socket on all interfaces.
pub fn create_listening_socket(port: u16, nonblocking: bool) -> io::Result<TcpListener> {
    create_listening_socket_on(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)), nonblocking)
}

/// Create a listening socket bound to `addr`.
pub fn create_listening_socket_on(addr: SocketAddr, nonblocking: bool) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(nonblocking)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

/// Resolve `host:port` to the first usable address.
pub fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no address found for {host}:{port}"),
        )
    })
}

/// Create a socket and start connecting it to `addr`.
///
/// In non-blocking mode the connect is usually still in progress on return;
/// completion shows up as writability, failure as an error event.
pub fn create_connecting_socket(addr: SocketAddr, nonblocking: bool) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_nonblocking(nonblocking)?;
    socket.set_nodelay(true)?;

    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if nonblocking && e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if nonblocking && e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }

    Ok(socket.into())
}
