use std::io;
use std::net::SocketAddr;

use tracing::debug;

use crate::cluster::Datastore;
use crate::core::conn::{ConnRole, Transport};
use crate::core::socket::connect_nonblocking;
use crate::protocol::LineTransport;

/// Storage backend reached over TCP, speaking the line protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpDatastore {
    pub address: SocketAddr,
    buf_capacity: usize,
}

impl TcpDatastore {
    pub fn new(address: SocketAddr, buf_capacity: usize) -> Self {
        Self {
            address,
            buf_capacity,
        }
    }
}

impl Datastore for TcpDatastore {
    fn connect(&self) -> io::Result<Box<dyn Transport>> {
        let stream = connect_nonblocking(self.address)?;
        debug!(address = %self.address, "datastore link up");
        Ok(Box::new(LineTransport::new(
            stream,
            ConnRole::Server,
            self.buf_capacity,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn connects_to_a_listening_backend() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let ds = TcpDatastore::new(listener.local_addr().unwrap(), 256);
        let transport = ds.connect().unwrap();
        assert!(transport.fd() >= 0);
        assert!(!transport.has_pending());
    }

    #[test]
    fn refused_connect_is_an_error() {
        // bind then drop to get a port nobody listens on
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let ds = TcpDatastore::new(addr, 256);
        assert!(ds.connect().is_err());
    }
}
