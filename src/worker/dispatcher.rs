use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::RawFd;

use io_uring::{IoUring, opcode, squeue, types};
use tracing::trace;

use crate::core::conn::{Events, Token};
use crate::core::user_data::{OpCode, next_generation, pack_user_data, unpack_user_data};
use crate::error::{Error, Result};
use crate::util::fd::fd_is_valid;

struct Registration {
    token: Token,
    fd: RawFd,
    interest: Events,
    /// A poll for this registration is in the ring.
    armed: bool,
    generation: u32,
}

impl Registration {
    fn poll_mask(&self) -> u32 {
        let mut mask = 0;
        if self.interest.is_read() {
            mask |= libc::POLLIN as u32;
        }
        if self.interest.is_write() {
            mask |= libc::POLLOUT as u32;
        }
        mask
    }
}

/// Readiness multiplexer for one worker.
///
/// Each registration is watched with a one-shot `POLL_ADD`. A poll that fired
/// is re-armed on the next [`wait`](Dispatcher::wait), which gives
/// level-triggered behaviour. Changing interest cancels the armed poll and
/// bumps the registration's generation so the cancelled completion is
/// recognised and dropped.
pub struct Dispatcher {
    ring: IoUring,
    regs: Vec<Option<Registration>>,
    /// Next generation per slot, carried across reuse so completions of a
    /// previous occupant never match the new one.
    generations: Vec<u32>,
    freelist: VecDeque<usize>,
    slots: HashMap<Token, usize>,
    cqe_batch: Vec<(u64, i32)>,
}

impl Dispatcher {
    pub fn new(entries: u32) -> io::Result<Self> {
        Ok(Self {
            ring: IoUring::new(entries)?,
            regs: Vec::new(),
            generations: Vec::new(),
            freelist: VecDeque::new(),
            slots: HashMap::new(),
            cqe_batch: Vec::with_capacity(entries as usize * 2),
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn interest(&self, token: Token) -> Option<Events> {
        let slot = *self.slots.get(&token)?;
        self.regs[slot].as_ref().map(|r| r.interest)
    }

    pub fn register(&mut self, token: Token, fd: RawFd, interest: Events) -> Result<()> {
        if !fd_is_valid(fd) {
            return Err(Error::Registration {
                fd,
                source: io::Error::from_raw_os_error(libc::EBADF),
            });
        }
        if self.slots.contains_key(&token) {
            return Err(Error::Registration {
                fd,
                source: io::Error::from_raw_os_error(libc::EEXIST),
            });
        }

        let slot = match self.freelist.pop_front() {
            Some(slot) => slot,
            None => {
                self.regs.push(None);
                self.generations.push(0);
                self.regs.len() - 1
            }
        };
        self.regs[slot] = Some(Registration {
            token,
            fd,
            interest: interest.without(Events::ERR),
            armed: false,
            generation: self.generations[slot],
        });
        self.slots.insert(token, slot);
        trace!(?token, fd, ?interest, slot, "registered");
        Ok(())
    }

    pub fn deregister(&mut self, token: Token) -> Result<()> {
        let slot = self.slots.remove(&token).ok_or(Error::UnknownToken(token))?;
        self.disarm(slot)?;
        if let Some(reg) = self.regs[slot].take() {
            self.generations[slot] = next_generation(reg.generation);
        }
        self.freelist.push_back(slot);
        trace!(?token, slot, "deregistered");
        Ok(())
    }

    pub fn add_read_interest(&mut self, token: Token) -> Result<()> {
        self.update(token, |i| i | Events::READ)
    }

    pub fn remove_read_interest(&mut self, token: Token) -> Result<()> {
        self.update(token, |i| i.without(Events::READ))
    }

    pub fn add_write_interest(&mut self, token: Token) -> Result<()> {
        self.update(token, |i| i | Events::WRITE)
    }

    pub fn remove_write_interest(&mut self, token: Token) -> Result<()> {
        self.update(token, |i| i.without(Events::WRITE))
    }

    fn update(&mut self, token: Token, f: impl FnOnce(Events) -> Events) -> Result<()> {
        let slot = *self.slots.get(&token).ok_or(Error::UnknownToken(token))?;
        let Some(reg) = self.regs[slot].as_mut() else {
            return Err(Error::UnknownToken(token));
        };
        let interest = f(reg.interest);
        if interest == reg.interest {
            return Ok(());
        }
        reg.interest = interest;
        self.disarm(slot)
    }

    /// Cancel the armed poll of `slot`, if any.
    fn disarm(&mut self, slot: usize) -> Result<()> {
        let Some(reg) = self.regs[slot].as_mut() else {
            return Ok(());
        };
        if !reg.armed {
            return Ok(());
        }
        let target = pack_user_data(slot, reg.generation, OpCode::Poll);
        let tag = pack_user_data(slot, reg.generation, OpCode::PollRemove);
        reg.armed = false;
        reg.generation = next_generation(reg.generation);

        let sqe = opcode::PollRemove::new(target).build().user_data(tag);
        self.push(&sqe)?;
        Ok(())
    }

    fn push(&mut self, sqe: &squeue::Entry) -> io::Result<()> {
        loop {
            let pushed = unsafe { self.ring.submission().push(sqe) };
            if pushed.is_ok() {
                return Ok(());
            }
            // SQ full: hand what we have to the kernel and retry
            self.ring.submit()?;
        }
    }

    fn arm_all(&mut self) -> io::Result<()> {
        for slot in 0..self.regs.len() {
            let Some(reg) = self.regs[slot].as_mut() else {
                continue;
            };
            if reg.armed || reg.interest.is_empty() {
                continue;
            }
            reg.armed = true;
            let sqe = opcode::PollAdd::new(types::Fd(reg.fd), reg.poll_mask())
                .build()
                .user_data(pack_user_data(slot, reg.generation, OpCode::Poll));
            self.push(&sqe)?;
        }
        Ok(())
    }

    /// Block until at least one registration is ready or `timeout_ms`
    /// elapses (forever when negative). Ready registrations are appended to
    /// `ready` and their count returned; zero is a normal outcome.
    pub fn wait(&mut self, timeout_ms: i64, ready: &mut Vec<(Token, Events)>) -> io::Result<usize> {
        self.arm_all()?;

        let submitted = if timeout_ms < 0 {
            self.ring.submit_and_wait(1)
        } else if timeout_ms == 0 {
            self.ring.submit()
        } else {
            let ts = types::Timespec::new()
                .sec(timeout_ms as u64 / 1_000)
                .nsec((timeout_ms % 1_000) as u32 * 1_000_000);
            let args = types::SubmitArgs::new().timespec(&ts);
            self.ring.submitter().submit_with_args(1, &args)
        };
        match submitted {
            Ok(_) => {}
            Err(e) if matches!(e.raw_os_error(), Some(libc::ETIME | libc::EINTR | libc::EBUSY)) => {}
            Err(e) => return Err(e),
        }

        self.cqe_batch.clear();
        for cqe in self.ring.completion() {
            self.cqe_batch.push((cqe.user_data(), cqe.result()));
        }

        let before = ready.len();
        for &(tag, res) in &self.cqe_batch {
            let Some((slot, generation, op)) = unpack_user_data(tag) else {
                continue;
            };
            if op != OpCode::Poll {
                continue;
            }
            let Some(reg) = self.regs.get_mut(slot).and_then(|r| r.as_mut()) else {
                continue;
            };
            if reg.generation != generation || !reg.armed {
                // cancelled or superseded poll
                continue;
            }
            reg.armed = false;

            let events = revents_to_events(res, reg.interest);
            if !events.is_empty() {
                ready.push((reg.token, events));
            }
        }
        Ok(ready.len() - before)
    }
}

/// Map a poll completion onto the events the registration asked for. Errors
/// are always reported. Hang-up reads as readable, so whatever the remote sent
/// before closing is drained and the zero-byte read then ends the link.
fn revents_to_events(res: i32, interest: Events) -> Events {
    if res < 0 {
        return Events::ERR;
    }
    let mut events = Events::NONE;
    if res & (libc::POLLERR | libc::POLLNVAL) as i32 != 0 {
        events |= Events::ERR;
    }
    if res & libc::POLLHUP as i32 != 0
        || (res & libc::POLLIN as i32 != 0 && interest.is_read())
    {
        events |= Events::READ;
    }
    if res & libc::POLLOUT as i32 != 0 && interest.is_write() {
        events |= Events::WRITE;
    }
    events
}
