//! Cross-worker handoff.
//!
//! Each worker owns one inbound endpoint. Any worker may push envelopes into
//! it through a [`ChannelSender`]; the push rings an eventfd that the owner
//! has registered with its dispatcher, so a blocked `wait` returns and the
//! owner drains the queue from its own thread. Nothing else crosses workers.

use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use thiserror::Error;
use tracing::error;

use crate::core::conn::WorkerId;
use crate::core::envelope::Envelope;
use crate::util::fd::EventFd;

/// Envelope could not be queued. Ownership goes back to the caller, who picks
/// the policy (retry, answer with an error, drop).
#[derive(Error, Debug)]
pub enum SendError {
    #[error("channel to worker {0} is full")]
    Full(WorkerId, Envelope),
    #[error("channel to worker {0} is closed")]
    Closed(WorkerId, Envelope),
}

impl SendError {
    /// Errno a request refused by the channel is answered with.
    pub fn errno(&self) -> i32 {
        match self {
            SendError::Full(..) => libc::ENOBUFS,
            SendError::Closed(..) => libc::ESHUTDOWN,
        }
    }

    pub fn into_inner(self) -> Envelope {
        match self {
            SendError::Full(_, env) | SendError::Closed(_, env) => env,
        }
    }
}

/// Producer side; cheap to clone and safe to use from any thread.
#[derive(Clone, Debug)]
pub struct ChannelSender {
    worker: WorkerId,
    tx: Sender<Envelope>,
    wake: Arc<EventFd>,
}

impl ChannelSender {
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Queue `env` for the owning worker and wake it.
    pub fn send(&self, env: Envelope) -> Result<(), SendError> {
        match self.tx.try_send(env) {
            Ok(()) => {}
            Err(TrySendError::Full(env)) => return Err(SendError::Full(self.worker, env)),
            Err(TrySendError::Disconnected(env)) => {
                return Err(SendError::Closed(self.worker, env));
            }
        }
        self.wake();
        Ok(())
    }

    /// Ring the doorbell without queueing anything.
    pub fn wake(&self) {
        if let Err(e) = self.wake.notify() {
            // the envelope is queued; the owner still finds it on its next wakeup
            error!(worker = self.worker, %e, "failed to signal channel");
        }
    }
}

/// Consumer side, owned by exactly one worker.
#[derive(Debug)]
pub struct ChannelEndpoint {
    worker: WorkerId,
    rx: Receiver<Envelope>,
    wake: Arc<EventFd>,
}

impl ChannelEndpoint {
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Everything queued right now, in arrival order. Returns how many
    /// envelopes were appended to `batch`.
    pub fn receive(&self, batch: &mut Vec<Envelope>) -> usize {
        // clear the doorbell before draining: a send racing with the drain
        // re-arms it, so nothing is left behind without a wakeup
        if let Err(e) = self.wake.clear() {
            error!(worker = self.worker, %e, "failed to reset channel doorbell");
        }
        let before = batch.len();
        batch.extend(self.rx.try_iter());
        batch.len() - before
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl AsRawFd for ChannelEndpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.wake.as_raw_fd()
    }
}

/// Create the channel for `worker`, holding at most `capacity` envelopes.
pub fn channel(
    worker: WorkerId,
    capacity: usize,
) -> std::io::Result<(ChannelSender, ChannelEndpoint)> {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    let wake = Arc::new(EventFd::new()?);
    Ok((
        ChannelSender {
            worker,
            tx,
            wake: Arc::clone(&wake),
        },
        ChannelEndpoint { worker, rx, wake },
    ))
}
