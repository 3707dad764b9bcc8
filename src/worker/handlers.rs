use tracing::{debug, error, info, trace, warn};

use crate::cluster::{Counter, Route};
use crate::core::conn::{ConnRef, ConnRole, Events, Inbound, Token};
use crate::core::envelope::Envelope;
use crate::error::{Error, Result};
use crate::util::fd::socket_error;
use crate::util::msec_now;

use super::context::Worker;

impl Worker {
    /// Route one readiness event to the handler for what the token names.
    pub(super) fn core(&mut self, token: Token, events: Events) -> Result<()> {
        if token == Token::IPC {
            return self.handle_ipc_events(events);
        }
        self.handle_connection_events(token, events)
    }

    fn handle_ipc_events(&mut self, events: Events) -> Result<()> {
        trace!(worker = self.id, ?events, "event on ipc");

        // error takes precedence over read | write
        if events.is_err() {
            error!(worker = self.id, "error on ipc channel");
            return Err(Error::ChannelFailure(self.id));
        }

        // read takes precedence over write
        if events.is_read() {
            let mut inbox = std::mem::take(&mut self.inbox);
            let mut count = 0;
            loop {
                let n = self.channel.receive(&mut inbox);
                if n == 0 {
                    break;
                }
                count += n;
                for env in inbox.drain(..) {
                    self.handle_handoff(env);
                }
            }
            self.inbox = inbox;
            debug!(worker = self.id, count, "handled messages");
        }

        assert!(
            !events.is_write(),
            "worker {} received write notification on ipc, but never registered for one",
            self.id
        );
        Ok(())
    }

    /// An envelope another worker handed over.
    fn handle_handoff(&mut self, mut env: Envelope) {
        if env.is_request() {
            let Some(dst) = env.dst_peer else {
                panic!("req {}:{} arrived on worker {} without a destination peer", env.id, env.parent_id, self.id);
            };
            assert_eq!(
                dst.worker, self.id,
                "req {}:{} delivered to worker {} but its peer belongs to worker {}",
                env.id, env.parent_id, self.id, dst.worker
            );
            debug!(worker = self.id, id = env.id, parent = env.parent_id, peer = ?dst.token, "forward req to peer");
            self.peer_req_forward(env);
        } else {
            // the client may be expecting this as part of a quorum or as the
            // answer to a request forwarded to a remote datacenter
            let owner = env.client.map(|c| c.worker);
            assert_eq!(
                owner,
                Some(self.id),
                "rsp {} delivered to worker {} but its client belongs to {:?}",
                env.id,
                self.id,
                owner
            );
            debug!(worker = self.id, id = env.id, parent = env.parent_id, "sending rsp upstream");
            env.peer = None;
            self.handle_response(env);
        }
    }

    fn handle_connection_events(&mut self, token: Token, events: Events) -> Result<()> {
        // closed earlier in this batch
        let Some(conn) = self.conns.get_mut(token) else {
            return Ok(());
        };
        trace!(worker = self.id, ?events, role = %conn.role, fd = conn.fd(), "event on conn");
        conn.events = events;

        // error takes precedence over read | write
        if events.is_err() {
            let errno = socket_error(conn.fd()).unwrap_or(libc::EIO);
            conn.err = Some(errno);

            if conn.dyn_mode {
                warn!(worker = self.id, role = %conn.role, fd = conn.fd(), errno, "conn err on dnode EVENT_ERR");
                if !conn.outstanding.is_empty() {
                    // mid-forward: stop polling and leave the close to the
                    // timeout sweep
                    let writing = conn.interest.is_write();
                    self.del_in(token)?;
                    if writing {
                        self.del_out(token)?;
                    }
                    return Err(Error::Connection { token, errno });
                }
            }
            self.close_conn(token);
            return Err(Error::Connection { token, errno });
        }

        // read takes precedence over write
        if events.is_read() {
            let mut inbound = std::mem::take(&mut self.inbound);
            let status = conn.recv(&mut inbound);
            let role = conn.role;

            for item in inbound.drain(..) {
                self.handle_inbound(token, role, item);
            }
            self.inbound = inbound;

            if let Some(result) = self.check_conn(token, status.is_ok(), "EVENT_READ") {
                return result;
            }
        }

        if events.is_write() {
            let Some(conn) = self.conns.get_mut(token) else {
                return Ok(());
            };
            let status = conn.send();
            let drained = !conn.has_pending();

            if let Some(result) = self.check_conn(token, status.is_ok(), "EVENT_WRITE") {
                return result;
            }
            if drained {
                self.del_out(token)?;
            }
        }

        Ok(())
    }

    /// After a read or write: close the connection when the operation failed,
    /// the remote end is done, or the connection is in error.
    fn check_conn(&mut self, token: Token, ok: bool, path: &str) -> Option<Result<()>> {
        let conn = self.conns.get(token)?;
        if ok && !conn.done && conn.err.is_none() {
            return None;
        }

        let errno = conn.err;
        if conn.dyn_mode {
            match errno {
                Some(errno) => warn!(worker = self.id, role = %conn.role, fd = conn.fd(), errno, "conn err on dnode {path}"),
                None => info!(worker = self.id, role = %conn.role, fd = conn.fd(), "dnode conn done on {path}"),
            }
        }
        self.close_conn(token);
        Some(match errno {
            Some(errno) => Err(Error::Connection { token, errno }),
            None => Ok(()),
        })
    }

    fn handle_inbound(&mut self, token: Token, role: ConnRole, item: Inbound) {
        match item {
            Inbound::Accepted { transport, same_dc } => {
                let Some(accepted) = role.accepted_role() else {
                    warn!(worker = self.id, %role, "accept on non-listener");
                    return;
                };
                if let Err(e) = self.attach(accepted, transport, same_dc) {
                    warn!(worker = self.id, %e, "failed to attach accepted conn");
                }
            }
            Inbound::Message(mut env) => match role {
                ConnRole::Client => {
                    env.client = Some(ConnRef::new(self.id, token));
                    self.route_request(env);
                }
                ConnRole::PeerClient => {
                    // a peer asks for data this node stores
                    env.client = Some(ConnRef::new(self.id, token));
                    self.forward_to_datastore(env);
                }
                ConnRole::Server | ConnRole::PeerServer => self.handle_server_response(token, env),
                ConnRole::Proxy | ConnRole::PeerProxy => {
                    warn!(worker = self.id, %role, id = env.id, "message on listener dropped");
                }
            },
        }
    }

    fn route_request(&mut self, req: Envelope) {
        match self.ctx.router().route(&req) {
            Route::Datastore => self.forward_to_datastore(req),
            Route::Peers(peers) if peers.is_empty() => self.fail_request(req, libc::EHOSTUNREACH),
            Route::Peers(peers) if peers.len() == 1 => {
                let mut req = req;
                req.dst_peer = Some(peers[0]);
                self.dispatch_to_peer(req);
            }
            Route::Peers(peers) => {
                for peer in peers {
                    let sub = req.fork(peer);
                    self.dispatch_to_peer(sub);
                }
            }
        }
    }

    /// Send a request toward its destination peer, directly when this worker
    /// owns the link, otherwise through the owner's channel.
    fn dispatch_to_peer(&mut self, req: Envelope) {
        let Some(dst) = req.dst_peer else {
            self.fail_request(req, libc::EHOSTUNREACH);
            return;
        };
        if dst.worker == self.id {
            self.peer_req_forward(req);
            return;
        }

        let Some(handle) = self.ctx.worker(dst.worker).cloned() else {
            warn!(worker = self.id, target = dst.worker, id = req.id, "no such worker");
            self.fail_request(req, libc::EHOSTUNREACH);
            return;
        };
        if let Err(e) = handle.forward_request(req) {
            self.ctx.stats.incr(Counter::ChannelSendFailures);
            warn!(worker = self.id, %e, "failed to hand off request");
            let errno = e.errno();
            self.fail_request(e.into_inner(), errno);
        }
    }

    /// Forward a request on a peer link this worker owns.
    pub(super) fn peer_req_forward(&mut self, req: Envelope) {
        let Some(dst) = req.dst_peer else {
            self.fail_request(req, libc::EHOSTUNREACH);
            return;
        };
        assert_eq!(dst.worker, self.id, "peer link {:?} is not owned by worker {}", dst.token, self.id);
        self.req_forward(dst.token, req);
    }

    pub(super) fn forward_to_datastore(&mut self, req: Envelope) {
        match self.datastore_conn() {
            Some(token) => self.req_forward(token, req),
            None => self.fail_request(req, libc::ECONNREFUSED),
        }
    }

    /// Write a request on a backend or peer link and start its timeout.
    fn req_forward(&mut self, token: Token, mut req: Envelope) {
        let Some(conn) = self.conns.get_mut(token) else {
            debug!(worker = self.id, ?token, id = req.id, "link gone");
            self.fail_request(req, libc::ENOTCONN);
            return;
        };
        if let Some(errno) = conn.err {
            self.fail_request(req, errno);
            return;
        }

        conn.stage(&req);
        req.peer = Some(token);
        let deadline = msec_now() + self.ctx.config.request_timeout_ms;
        self.tmo.track(deadline, token, &mut req);
        trace!(worker = self.id, id = req.id, parent = req.parent_id, ?token, deadline, "req forwarded");
        conn.outstanding.push_back(req);

        if let Err(e) = self.add_out(token) {
            warn!(worker = self.id, ?token, %e, "failed to watch link for output");
        }
    }

    /// A response read from a backend or peer link answers the oldest request
    /// still outstanding on it.
    fn handle_server_response(&mut self, token: Token, mut rsp: Envelope) {
        let Some(conn) = self.conns.get_mut(token) else {
            return;
        };
        let Some(mut req) = conn.outstanding.pop_front() else {
            warn!(worker = self.id, role = %conn.role, fd = conn.fd(), "unsolicited rsp dropped");
            return;
        };
        self.tmo.untrack(&mut req);
        req.done = true;

        rsp.answer(&req);
        trace!(worker = self.id, id = rsp.id, parent = rsp.parent_id, "rsp matched");
        self.route_response(rsp);
    }

    /// Deliver a response to its client, here or on the client's worker.
    fn route_response(&mut self, mut rsp: Envelope) {
        let Some(client) = rsp.client else {
            debug!(worker = self.id, id = rsp.id, "rsp without client dropped");
            return;
        };
        if client.worker == self.id {
            rsp.peer = None;
            self.handle_response(rsp);
            return;
        }

        let Some(handle) = self.ctx.worker(client.worker).cloned() else {
            warn!(worker = self.id, target = client.worker, id = rsp.id, "no such worker");
            return;
        };
        if let Err(e) = handle.forward_response(rsp) {
            self.ctx.stats.incr(Counter::ChannelSendFailures);
            warn!(worker = self.id, %e, "failed to hand off response, dropping");
        }
    }

    /// Response completion on the client connection. Tolerates the client
    /// having gone away.
    pub(super) fn handle_response(&mut self, rsp: Envelope) {
        let Some(client) = rsp.client else {
            return;
        };
        let Some(conn) = self.conns.get_mut(client.token).filter(|c| c.is_active()) else {
            self.ctx.stats.incr(Counter::SwallowedResponses);
            debug!(worker = self.id, id = rsp.id, parent = rsp.parent_id, "swallowing rsp for closed client");
            return;
        };
        debug_assert_eq!(conn.owner, self.id);

        conn.stage(&rsp);
        if let Err(e) = self.add_out(client.token) {
            warn!(worker = self.id, token = ?client.token, %e, "failed to watch client for output");
        }
    }

    /// Give up on a request and answer its client with an error.
    pub(super) fn fail_request(&mut self, mut req: Envelope, errno: i32) {
        self.tmo.untrack(&mut req);
        req.error = Some(errno);
        debug!(worker = self.id, id = req.id, parent = req.parent_id, errno, "req failed");
        let rsp = Envelope::error_for(&req, errno);
        self.route_response(rsp);
    }
}
