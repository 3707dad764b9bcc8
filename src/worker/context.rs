use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Barrier};

use tracing::{debug, error, info, trace, warn};

use crate::cluster::{Counter, ProcessContext};
use crate::core::conn::{Conn, ConnRef, ConnRole, Events, Inbound, Token, Transport, WorkerId};
use crate::core::envelope::Envelope;
use crate::error::{Error, Result};
use crate::util::{Msec, msec_now};

use super::channel::{ChannelEndpoint, channel};
use super::connection_pool::ConnectionTable;
use super::dispatcher::Dispatcher;
use super::handle::WorkerHandle;
use super::timeout::{Expiry, TimeoutEntry, TimeoutQueue};

/// One worker: an event loop and every connection it owns.
///
/// Nothing in here is shared. Other threads reach a worker only through its
/// [`WorkerHandle`].
pub struct Worker {
    pub(super) id: WorkerId,
    pub(super) ctx: Arc<ProcessContext>,
    pub(super) dispatcher: Dispatcher,
    pub(super) channel: ChannelEndpoint,
    pub(super) handle: WorkerHandle,
    pub(super) tmo: TimeoutQueue,
    pub(super) conns: ConnectionTable,
    /// Link to this worker's shard of the storage backend.
    pub(super) datastore: Option<Token>,
    /// How long the next `wait` may block, in ms.
    pub(super) timeout: Msec,
    pub(super) ready: Vec<(Token, Events)>,
    pub(super) inbound: Vec<Inbound>,
    pub(super) inbox: Vec<Envelope>,
}

impl Worker {
    pub fn init(ctx: &Arc<ProcessContext>) -> Result<Self> {
        let config = &ctx.config;
        let id = ctx.next_worker_id();
        let dispatcher = Dispatcher::new(config.ring_size)?;
        let (sender, channel) = channel(id, config.channel_capacity)?;

        let mut worker = Self {
            id,
            ctx: Arc::clone(ctx),
            dispatcher,
            channel,
            handle: WorkerHandle::new(id, sender),
            tmo: TimeoutQueue::new(),
            conns: ConnectionTable::new(config.pool_capacity),
            datastore: None,
            timeout: config.max_timeout_ms,
            ready: Vec::new(),
            inbound: Vec::new(),
            inbox: Vec::new(),
        };

        let fd = worker.channel.as_raw_fd();
        worker.dispatcher.register(Token::IPC, fd, Events::READ)?;
        debug!(worker = id, fd, "worker initialized");
        Ok(worker)
    }

    /// Create `config.workers` workers and publish their handles.
    pub fn init_all(ctx: &Arc<ProcessContext>) -> Result<Vec<Self>> {
        let workers = (0..ctx.config.workers)
            .map(|_| Worker::init(ctx))
            .collect::<Result<Vec<_>>>()?;
        ctx.publish_workers(workers.iter().map(|w| w.handle()).collect())?;
        Ok(workers)
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    pub fn context(&self) -> &Arc<ProcessContext> {
        &self.ctx
    }

    pub fn conn(&self, token: Token) -> Option<&Conn> {
        self.conns.get(token)
    }

    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }

    pub fn tracked_requests(&self) -> usize {
        self.tmo.len()
    }

    pub fn poll_timeout(&self) -> Msec {
        self.timeout
    }

    pub fn datastore_token(&self) -> Option<Token> {
        self.datastore
    }

    // --- connection interest: the only way it changes ---

    pub fn add_conn(&mut self, token: Token, fd: RawFd) -> Result<()> {
        trace!(worker = self.id, ?token, fd, "adding conn");
        self.dispatcher.register(token, fd, Events::READ)
    }

    pub fn del_conn(&mut self, token: Token) -> Result<()> {
        trace!(worker = self.id, ?token, "deleting conn");
        self.dispatcher.deregister(token)
    }

    pub fn add_out(&mut self, token: Token) -> Result<()> {
        trace!(worker = self.id, ?token, "adding out");
        self.dispatcher.add_write_interest(token)?;
        self.set_interest(token);
        Ok(())
    }

    pub fn del_out(&mut self, token: Token) -> Result<()> {
        trace!(worker = self.id, ?token, "deleting out");
        self.dispatcher.remove_write_interest(token)?;
        self.set_interest(token);
        Ok(())
    }

    pub fn add_in(&mut self, token: Token) -> Result<()> {
        trace!(worker = self.id, ?token, "adding in");
        self.dispatcher.add_read_interest(token)?;
        self.set_interest(token);
        Ok(())
    }

    pub fn del_in(&mut self, token: Token) -> Result<()> {
        trace!(worker = self.id, ?token, "deleting in");
        self.dispatcher.remove_read_interest(token)?;
        self.set_interest(token);
        Ok(())
    }

    fn set_interest(&mut self, token: Token) {
        let interest = self.dispatcher.interest(token).unwrap_or_default();
        if let Some(conn) = self.conns.get_mut(token) {
            conn.interest = interest;
        }
    }

    /// Take ownership of a transport as a connection of `role` and start
    /// watching it for input.
    pub fn attach(
        &mut self,
        role: ConnRole,
        transport: Box<dyn Transport>,
        same_dc: bool,
    ) -> Result<Token> {
        let token = self.conns.alloc();
        let fd = transport.fd();
        if let Err(e) = self.add_conn(token, fd) {
            self.conns.release(token);
            return Err(e);
        }
        let mut conn = Conn::new(token, role, self.id, transport, same_dc);
        conn.interest = Events::READ;
        self.conns.insert(conn);
        debug!(worker = self.id, ?token, fd, %role, same_dc, "attached conn");
        Ok(token)
    }

    /// Attach an outbound link to a peer node. The returned reference is what
    /// the routing layer hands out so other workers can forward to it.
    pub fn connect_peer(&mut self, transport: Box<dyn Transport>, same_dc: bool) -> Result<ConnRef> {
        let token = self.attach(ConnRole::PeerServer, transport, same_dc)?;
        Ok(ConnRef::new(self.id, token))
    }

    /// Connect to the datastore now, if not connected already.
    pub fn preconnect(&mut self) -> Result<()> {
        match self.datastore_conn() {
            Some(_) => Ok(()),
            None => Err(Error::DatastoreUnavailable),
        }
    }

    /// The datastore link, connecting lazily.
    pub(super) fn datastore_conn(&mut self) -> Option<Token> {
        if let Some(token) = self.datastore
            && self.conns.get(token).is_some_and(Conn::is_active)
        {
            return Some(token);
        }

        let transport = match self.ctx.datastore().connect() {
            Ok(t) => t,
            Err(e) => {
                warn!(worker = self.id, %e, "datastore connect failed");
                return None;
            }
        };
        match self.attach(ConnRole::Server, transport, true) {
            Ok(token) => {
                self.datastore = Some(token);
                Some(token)
            }
            Err(e) => {
                warn!(worker = self.id, %e, "datastore link registration failed");
                None
            }
        }
    }

    /// Serve until the process shuts down.
    ///
    /// `ready` is the one-shot startup barrier shared with the coordinating
    /// thread; the worker passes it once preconnect is done.
    pub fn run(mut self, ready: &Barrier) -> Result<()> {
        // not fatal: the link is retried on first use
        if self.ctx.config.preconnect
            && let Err(e) = self.preconnect()
        {
            error!(worker = self.id, %e, "failed to preconnect to datastore");
        }

        ready.wait();
        info!(worker = self.id, "worker serving");

        let outcome = loop {
            if self.ctx.is_shutting_down() {
                break Ok(());
            }
            if let Err(e) = self.run_once() {
                error!(worker = self.id, %e, "worker loop failed");
                break Err(e);
            }
        };

        self.deinit();
        outcome
    }

    /// One turn of the loop: wait for readiness, dispatch, sweep timeouts.
    pub fn run_once(&mut self) -> Result<usize> {
        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();

        let nsd = match self.dispatcher.wait(self.timeout as i64, &mut ready) {
            Ok(n) => n,
            Err(e) => {
                self.ready = ready;
                return Err(Error::Io(e));
            }
        };

        let mut outcome = Ok(nsd);
        for &(token, events) in &ready {
            if let Err(e) = self.core(token, events) {
                if matches!(e, Error::ChannelFailure(_)) {
                    outcome = Err(e);
                    break;
                }
                trace!(worker = self.id, %e, "dispatch error");
            }
        }
        self.ready = ready;

        self.sweep_timeouts(msec_now());
        outcome
    }

    /// Expire overdue requests and work out how long the next wait may block.
    pub fn sweep_timeouts(&mut self, now: Msec) {
        let max_timeout = self.ctx.config.max_timeout_ms;
        loop {
            let conns = &self.conns;
            let expiry = self.tmo.next_expired(now, max_timeout, |entry| {
                request_settled(conns, entry)
            });

            let entry = match expiry {
                Expiry::Idle(timeout) => {
                    self.timeout = timeout;
                    return;
                }
                Expiry::Expired(entry) => entry,
            };
            self.expire(entry);
        }
    }

    fn expire(&mut self, entry: TimeoutEntry) {
        let Some(conn) = self.conns.get_mut(entry.conn) else {
            return;
        };
        // the entry is gone from the queue; forget the key on the envelope too
        if let Some(req) = conn.outstanding.iter_mut().find(|r| r.id == entry.msg) {
            req.timeout = None;
        }

        warn!(
            worker = self.id,
            id = entry.msg,
            role = %conn.role,
            fd = conn.fd(),
            timeout = self.ctx.config.request_timeout_ms,
            "req timed out"
        );

        match (conn.dyn_mode, conn.role) {
            (true, ConnRole::PeerServer) if conn.same_dc => {
                self.ctx.stats.incr(Counter::PeerTimedoutRequests)
            }
            (true, ConnRole::PeerServer) => self.ctx.stats.incr(Counter::RemotePeerTimedoutRequests),
            (false, ConnRole::Server) => self.ctx.stats.incr(Counter::ServerDroppedRequests),
            _ => {}
        }

        conn.err = Some(libc::ETIMEDOUT);
        self.close_conn(entry.conn);
    }

    /// Close a connection and fail every request still waiting on it.
    pub fn close_conn(&mut self, token: Token) {
        let Some(mut conn) = self.conns.remove(token) else {
            return;
        };
        if let Err(e) = self.del_conn(token) {
            warn!(worker = self.id, ?token, %e, "deregister on close failed");
        }
        if self.datastore == Some(token) {
            self.datastore = None;
        }

        let errno = conn.err.unwrap_or(libc::ECONNRESET);
        if conn.err.is_some() {
            info!(
                worker = self.id,
                role = %conn.role,
                fd = conn.fd(),
                outstanding = conn.outstanding.len(),
                errno,
                "close conn on error"
            );
        } else {
            debug!(worker = self.id, role = %conn.role, fd = conn.fd(), "close conn");
        }

        for req in conn.outstanding.drain(..) {
            self.fail_request(req, errno);
        }
        // dropping the transport closes the descriptor
    }

    /// Tear down after the loop stopped.
    fn deinit(&mut self) {
        for token in self.conns.tokens() {
            self.close_conn(token);
        }
        if let Err(e) = self.dispatcher.deregister(Token::IPC) {
            warn!(worker = self.id, %e, "failed to deregister channel");
        }
        info!(worker = self.id, "worker stopped");
    }
}

/// True when the request behind a timeout entry no longer needs the entry.
fn request_settled(conns: &ConnectionTable, entry: &TimeoutEntry) -> bool {
    let Some(conn) = conns.get(entry.conn) else {
        return true;
    };
    match conn.outstanding.iter().find(|r| r.id == entry.msg) {
        Some(req) => req.done || req.error.is_some(),
        None => true,
    }
}
