use tracing::debug;

use crate::core::conn::WorkerId;
use crate::core::envelope::Envelope;

use super::channel::{ChannelSender, SendError};

/// What other threads hold of a worker: its id and the producer side of its
/// inbound channel.
#[derive(Clone, Debug)]
pub struct WorkerHandle {
    id: WorkerId,
    sender: ChannelSender,
}

impl WorkerHandle {
    pub(crate) fn new(id: WorkerId, sender: ChannelSender) -> Self {
        Self { id, sender }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Hand a request to this worker, which owns its destination peer link.
    pub fn forward_request(&self, req: Envelope) -> Result<(), SendError> {
        let dst = req.dst_peer.map(|p| p.worker);
        assert_eq!(
            dst,
            Some(self.id),
            "req {}:{} forwarded to worker {} but its peer belongs to {:?}",
            req.id,
            req.parent_id,
            self.id,
            dst
        );
        debug!(worker = self.id, id = req.id, parent = req.parent_id, "forwarding req");
        self.sender.send(req)
    }

    /// Hand a response to this worker, which owns its client connection.
    pub fn forward_response(&self, rsp: Envelope) -> Result<(), SendError> {
        assert!(!rsp.is_request(), "forward_response called with request {}", rsp.id);
        let owner = rsp.client.map(|c| c.worker);
        assert_eq!(
            owner,
            Some(self.id),
            "rsp {} forwarded to worker {} but its client belongs to {:?}",
            rsp.id,
            self.id,
            owner
        );
        debug!(worker = self.id, id = rsp.id, parent = rsp.parent_id, "forwarding rsp");
        self.sender.send(rsp)
    }

    pub fn wake(&self) {
        self.sender.wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::conn::{ConnRef, Token};
    use crate::worker::channel::channel;

    #[test]
    fn request_reaches_owner_of_peer() {
        let (tx, rx) = channel(1, 8).unwrap();
        let handle = WorkerHandle::new(1, tx);

        let mut req = Envelope::request(b"get a".to_vec());
        req.dst_peer = Some(ConnRef::new(1, Token::new(3, 0)));
        let id = req.id;
        handle.forward_request(req).unwrap();

        let mut batch = Vec::new();
        assert_eq!(rx.receive(&mut batch), 1);
        assert_eq!(batch[0].id, id);
    }

    #[test]
    #[should_panic(expected = "but its peer belongs to")]
    fn request_for_foreign_peer_is_a_defect() {
        let (tx, _rx) = channel(1, 8).unwrap();
        let handle = WorkerHandle::new(1, tx);
        let mut req = Envelope::request(Vec::new());
        req.dst_peer = Some(ConnRef::new(0, Token::new(3, 0)));
        let _ = handle.forward_request(req);
    }

    #[test]
    #[should_panic(expected = "forward_response called with request")]
    fn forwarding_a_request_as_response_is_a_defect() {
        let (tx, _rx) = channel(0, 8).unwrap();
        let handle = WorkerHandle::new(0, tx);
        let _ = handle.forward_response(Envelope::request(Vec::new()));
    }
}
