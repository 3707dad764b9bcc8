use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::os::fd::RawFd;

use crate::core::envelope::Envelope;

pub type WorkerId = usize;

/// Handle to a pollable on one worker: a connection table slot plus the
/// generation it was allocated with, so a stale handle never aliases a
/// connection that later reused the slot.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Token(u64);

impl Token {
    /// The worker's cross-worker channel endpoint.
    pub const IPC: Token = Token(u64::MAX);

    pub fn new(index: u32, generation: u32) -> Self {
        Token(((generation as u64) << 32) | index as u64)
    }

    pub fn index(self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Token::IPC {
            return f.write_str("Token(ipc)");
        }
        write!(f, "Token({}:{})", self.index(), self.generation())
    }
}

/// A connection anywhere in the process: the worker that owns it and its
/// token on that worker.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ConnRef {
    pub worker: WorkerId,
    pub token: Token,
}

impl ConnRef {
    pub fn new(worker: WorkerId, token: Token) -> Self {
        Self { worker, token }
    }
}

/// Readiness bits, used both for registered interest and for reported events.
#[derive(Copy, Clone, Default, Eq, PartialEq)]
pub struct Events(u8);

impl Events {
    pub const NONE: Events = Events(0);
    pub const ERR: Events = Events(1);
    pub const READ: Events = Events(2);
    pub const WRITE: Events = Events(4);

    pub fn contains(self, other: Events) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_err(self) -> bool {
        self.contains(Events::ERR)
    }

    pub fn is_read(self) -> bool {
        self.contains(Events::READ)
    }

    pub fn is_write(self) -> bool {
        self.contains(Events::WRITE)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn without(self, other: Events) -> Events {
        Events(self.0 & !other.0)
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for Events {
    type Output = Events;

    fn bitor(self, rhs: Events) -> Events {
        Events(self.0 | rhs.0)
    }
}

impl BitOrAssign for Events {
    fn bitor_assign(&mut self, rhs: Events) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnRole {
    /// Client-facing listener.
    Proxy,
    /// Accepted client.
    Client,
    /// Link to the storage backend.
    Server,
    /// Listener for peer nodes.
    PeerProxy,
    /// Inbound link from a peer node.
    PeerClient,
    /// Outbound link to a peer node.
    PeerServer,
}

impl ConnRole {
    /// Peer-protocol (node-to-node) connection.
    pub fn dyn_mode(self) -> bool {
        matches!(
            self,
            ConnRole::PeerProxy | ConnRole::PeerClient | ConnRole::PeerServer
        )
    }

    pub fn is_listener(self) -> bool {
        matches!(self, ConnRole::Proxy | ConnRole::PeerProxy)
    }

    /// Role of connections accepted on a listener of this role.
    pub fn accepted_role(self) -> Option<ConnRole> {
        match self {
            ConnRole::Proxy => Some(ConnRole::Client),
            ConnRole::PeerProxy => Some(ConnRole::PeerClient),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnRole::Proxy => "proxy",
            ConnRole::Client => "client",
            ConnRole::Server => "server",
            ConnRole::PeerProxy => "peer-proxy",
            ConnRole::PeerClient => "peer-client",
            ConnRole::PeerServer => "peer-server",
        }
    }
}

impl fmt::Display for ConnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Progress {
    /// More may come later.
    Open,
    /// Remote end finished.
    Closed,
}

/// Something a transport read produced.
pub enum Inbound {
    Message(Envelope),
    Accepted {
        transport: Box<dyn Transport>,
        same_dc: bool,
    },
}

/// The byte-level side of a connection. Framing and parsing live behind this
/// trait; the worker only moves envelopes in and out.
pub trait Transport: Send {
    fn fd(&self) -> RawFd;

    /// Read everything currently available. Running out of data for now is
    /// not an error.
    fn recv(&mut self, inbound: &mut Vec<Inbound>) -> io::Result<Progress>;

    /// Queue an envelope's bytes for the next `send`.
    fn stage(&mut self, msg: &Envelope);

    /// Flush as much staged output as the socket takes.
    fn send(&mut self) -> io::Result<Progress>;

    fn has_pending(&self) -> bool;
}

pub struct Conn {
    pub token: Token,
    pub role: ConnRole,
    /// Set at creation, never reassigned.
    pub owner: WorkerId,
    pub interest: Events,
    pub events: Events,
    pub err: Option<i32>,
    pub done: bool,
    pub same_dc: bool,
    pub dyn_mode: bool,
    /// Requests written on this link that still wait for a response, in send order.
    pub outstanding: VecDeque<Envelope>,
    transport: Box<dyn Transport>,
}

impl Conn {
    pub fn new(
        token: Token,
        role: ConnRole,
        owner: WorkerId,
        transport: Box<dyn Transport>,
        same_dc: bool,
    ) -> Self {
        Self {
            token,
            role,
            owner,
            interest: Events::NONE,
            events: Events::NONE,
            err: None,
            done: false,
            same_dc,
            dyn_mode: role.dyn_mode(),
            outstanding: VecDeque::new(),
            transport,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.transport.fd()
    }

    pub fn conn_ref(&self) -> ConnRef {
        ConnRef::new(self.owner, self.token)
    }

    /// Drain readable bytes, recording failure or end of stream on the conn.
    pub fn recv(&mut self, inbound: &mut Vec<Inbound>) -> io::Result<()> {
        match self.transport.recv(inbound) {
            Ok(Progress::Open) => Ok(()),
            Ok(Progress::Closed) => {
                self.done = true;
                Ok(())
            }
            Err(e) => {
                self.err = Some(e.raw_os_error().unwrap_or(libc::EIO));
                Err(e)
            }
        }
    }

    pub fn send(&mut self) -> io::Result<()> {
        match self.transport.send() {
            Ok(Progress::Open) => Ok(()),
            Ok(Progress::Closed) => {
                self.done = true;
                Ok(())
            }
            Err(e) => {
                self.err = Some(e.raw_os_error().unwrap_or(libc::EIO));
                Err(e)
            }
        }
    }

    pub fn stage(&mut self, msg: &Envelope) {
        self.transport.stage(msg);
    }

    pub fn has_pending(&self) -> bool {
        self.transport.has_pending()
    }

    /// Healthy enough to take more traffic.
    pub fn is_active(&self) -> bool {
        self.err.is_none() && !self.done
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("token", &self.token)
            .field("role", &self.role)
            .field("owner", &self.owner)
            .field("fd", &self.fd())
            .field("err", &self.err)
            .field("done", &self.done)
            .field("outstanding", &self.outstanding.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_keeps_index_and_generation() {
        let t = Token::new(12, 7);
        assert_eq!(t.index(), 12);
        assert_eq!(t.generation(), 7);
        assert_ne!(t, Token::new(12, 8));
        assert_ne!(t, Token::IPC);
    }

    #[test]
    fn event_bits() {
        let ev = Events::READ | Events::ERR;
        assert!(ev.is_read());
        assert!(ev.is_err());
        assert!(!ev.is_write());
        assert!(!Events::NONE.is_read());
        assert_eq!(ev.without(Events::ERR), Events::READ);
    }

    #[test]
    fn roles() {
        assert!(ConnRole::PeerServer.dyn_mode());
        assert!(!ConnRole::Server.dyn_mode());
        assert_eq!(ConnRole::Proxy.accepted_role(), Some(ConnRole::Client));
        assert_eq!(ConnRole::PeerProxy.accepted_role(), Some(ConnRole::PeerClient));
        assert_eq!(ConnRole::Client.accepted_role(), None);
    }
}
