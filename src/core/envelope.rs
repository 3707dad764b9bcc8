use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::conn::{ConnRef, Token};
use crate::worker::timeout::TimeoutKey;

pub type MsgId = u64;

static NEXT_MSG_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-wide unique message id.
///
/// Ids must not collide across workers: a request created on one worker can
/// end up tracked in another worker's timeout queue.
pub fn next_msg_id() -> MsgId {
    NEXT_MSG_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MsgKind {
    Request,
    Response,
}

/// One request or response in flight.
///
/// An envelope has exactly one owner at a time: the connection that read it,
/// the outstanding queue of the link it was sent on (while tracked for
/// timeout), the cross-worker channel, or the connection that writes it out.
/// It moves between them, it is never shared.
pub struct Envelope {
    pub id: MsgId,
    /// Id of the client request this one was split from, or its own id.
    pub parent_id: MsgId,
    pub kind: MsgKind,
    pub done: bool,
    /// errno describing why the request failed.
    pub error: Option<i32>,
    /// Client connection a response must be delivered to.
    pub client: Option<ConnRef>,
    /// Peer link a request is being forwarded to.
    pub dst_peer: Option<ConnRef>,
    /// Link the request was written on, on the worker that owns it.
    pub peer: Option<Token>,
    pub(crate) timeout: Option<TimeoutKey>,
    pub payload: Vec<u8>,
}

impl Envelope {
    fn with_kind(kind: MsgKind, payload: Vec<u8>) -> Self {
        let id = next_msg_id();
        Self {
            id,
            parent_id: id,
            kind,
            done: false,
            error: None,
            client: None,
            dst_peer: None,
            peer: None,
            timeout: None,
            payload,
        }
    }

    pub fn request(payload: Vec<u8>) -> Self {
        Self::with_kind(MsgKind::Request, payload)
    }

    /// A response as read off a backend or peer link, before it is matched to
    /// its request.
    pub fn response(payload: Vec<u8>) -> Self {
        Self::with_kind(MsgKind::Response, payload)
    }

    /// Sub-request of `self` headed for `peer`, with a fresh id.
    pub fn fork(&self, peer: ConnRef) -> Self {
        let mut sub = Self::request(self.payload.clone());
        sub.parent_id = self.id;
        sub.client = self.client;
        sub.dst_peer = Some(peer);
        sub
    }

    /// Turn a raw response into the answer to `req`.
    pub fn answer(&mut self, req: &Envelope) {
        self.kind = MsgKind::Response;
        self.id = req.id;
        self.parent_id = req.parent_id;
        self.client = req.client;
        self.dst_peer = req.dst_peer;
        self.peer = req.peer;
        self.done = true;
    }

    /// Error response for `req`.
    pub fn error_for(req: &Envelope, errno: i32) -> Self {
        let mut rsp = Self::response(Vec::new());
        rsp.answer(req);
        rsp.error = Some(errno);
        rsp
    }

    pub fn is_request(&self) -> bool {
        self.kind == MsgKind::Request
    }

    pub fn is_tracked(&self) -> bool {
        self.timeout.is_some()
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("id", &self.id)
            .field("parent_id", &self.parent_id)
            .field("kind", &self.kind)
            .field("done", &self.done)
            .field("error", &self.error)
            .field("client", &self.client)
            .field("dst_peer", &self.dst_peer)
            .field("len", &self.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answer_takes_request_identity() {
        let mut req = Envelope::request(b"get k".to_vec());
        req.client = Some(ConnRef::new(1, Token::new(4, 2)));

        let mut rsp = Envelope::response(b"v".to_vec());
        assert_ne!(rsp.id, req.id);
        rsp.answer(&req);

        assert_eq!(rsp.id, req.id);
        assert_eq!(rsp.client, req.client);
        assert!(!rsp.is_request());
        assert_eq!(rsp.payload, b"v");
    }

    #[test]
    fn fork_links_back_to_parent() {
        let mut req = Envelope::request(b"set k v".to_vec());
        req.client = Some(ConnRef::new(0, Token::new(1, 0)));
        let peer = ConnRef::new(2, Token::new(9, 1));

        let sub = req.fork(peer);
        assert_ne!(sub.id, req.id);
        assert_eq!(sub.parent_id, req.id);
        assert_eq!(sub.dst_peer, Some(peer));
        assert_eq!(sub.client, req.client);
    }
}
