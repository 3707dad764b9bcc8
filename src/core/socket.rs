use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use tracing::debug;

use crate::core::constants::LISTEN_BACKLOG;

/// Socket utility functions for the proxy
///
/// This module provides low-level socket operations including:
/// - Backend and peer link connection setup
/// - SO_REUSEPORT listener setup for multi-core workers

/// Connect to a backend or peer and hand back a nonblocking stream.
///
/// Uses a blocking connect, then switches to non-blocking for the dispatcher.
pub fn connect_nonblocking(addr: SocketAddr) -> io::Result<TcpStream> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    sock.set_tcp_nodelay(true)?;
    sock.connect(&addr.into())?;
    sock.set_nonblocking(true)?;
    debug!(%addr, "connected");
    Ok(sock.into())
}

/// Create a SO_REUSEPORT listening socket
///
/// This creates a nonblocking TCP listener with SO_REUSEPORT enabled, allowing
/// multiple workers to bind to the same address for load distribution.
///
/// Each worker gets its own listener, and the kernel distributes incoming
/// connections across all workers bound to the same port.
pub fn make_reuseport_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    sock.set_reuse_address(true)?;
    sock.set_reuse_port(true)?; // requires socket2 = { version="0.6", features=["all"] }
    sock.set_nonblocking(true)?;
    sock.bind(&addr.into())?;
    sock.listen(LISTEN_BACKLOG)?;
    Ok(sock.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_connect_disables_nagle() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = connect_nonblocking(listener.local_addr().unwrap()).unwrap();
        assert!(stream.nodelay().unwrap());
    }

    #[test]
    fn reuseport_listeners_share_an_address() {
        let first = make_reuseport_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = first.local_addr().unwrap();
        assert!(make_reuseport_listener(addr).is_ok());
    }
}
