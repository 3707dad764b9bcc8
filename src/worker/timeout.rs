use std::collections::BTreeMap;

use crate::core::conn::Token;
use crate::core::envelope::{Envelope, MsgId};
use crate::util::Msec;

/// Position of an entry in the queue. The sequence number keeps keys unique
/// when deadlines collide, and is never reused, so a stale key held by an
/// envelope can only miss.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TimeoutKey {
    deadline: Msec,
    seq: u64,
}

impl TimeoutKey {
    pub fn deadline(&self) -> Msec {
        self.deadline
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TimeoutEntry {
    pub deadline: Msec,
    /// Link the request is waiting on.
    pub conn: Token,
    pub msg: MsgId,
}

/// What the sweep should do next.
#[derive(Debug, Eq, PartialEq)]
pub enum Expiry {
    /// This entry is overdue and was removed.
    Expired(TimeoutEntry),
    /// Nothing is due; block at most this long.
    Idle(Msec),
}

/// Deadline-ordered set of in-flight requests for one worker.
#[derive(Debug, Default)]
pub struct TimeoutQueue {
    entries: BTreeMap<TimeoutKey, TimeoutEntry>,
    seq: u64,
}

impl TimeoutQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `msg` against `conn`. A request holds at most one live
    /// entry, so any previous one is dropped first.
    pub fn track(&mut self, deadline: Msec, conn: Token, msg: &mut Envelope) -> TimeoutKey {
        self.untrack(msg);

        self.seq += 1;
        let key = TimeoutKey {
            deadline,
            seq: self.seq,
        };
        self.entries.insert(
            key,
            TimeoutEntry {
                deadline,
                conn,
                msg: msg.id,
            },
        );
        msg.timeout = Some(key);
        key
    }

    /// Stop tracking `msg`. Safe to call when it is not tracked.
    pub fn untrack(&mut self, msg: &mut Envelope) -> Option<TimeoutEntry> {
        let key = msg.timeout.take()?;
        self.entries.remove(&key)
    }

    pub fn min(&self) -> Option<&TimeoutEntry> {
        self.entries.first_key_value().map(|(_, e)| e)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, msg: &Envelope) -> bool {
        msg.timeout.is_some_and(|k| self.entries.contains_key(&k))
    }

    /// Pull the next overdue entry.
    ///
    /// Entries whose request already finished (`settled` returns true) are
    /// discarded on the way without being reported. Stops at the first entry
    /// still in the future, reporting how long to wait for it, capped at
    /// `max_timeout`; an empty queue waits `max_timeout`.
    pub fn next_expired(
        &mut self,
        now: Msec,
        max_timeout: Msec,
        mut settled: impl FnMut(&TimeoutEntry) -> bool,
    ) -> Expiry {
        loop {
            let Some(entry) = self.entries.first_entry() else {
                return Expiry::Idle(max_timeout);
            };

            if settled(entry.get()) {
                entry.remove();
                continue;
            }

            let then = entry.key().deadline;
            if now < then {
                return Expiry::Idle((then - now).min(max_timeout));
            }

            return Expiry::Expired(entry.remove());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> Envelope {
        Envelope::request(Vec::new())
    }

    fn drain(q: &mut TimeoutQueue, now: Msec) -> (Vec<TimeoutEntry>, Msec) {
        let mut expired = Vec::new();
        loop {
            match q.next_expired(now, 1_000, |_| false) {
                Expiry::Expired(e) => expired.push(e),
                Expiry::Idle(t) => return (expired, t),
            }
        }
    }

    #[test]
    fn empty_queue_waits_max_timeout() {
        let mut q = TimeoutQueue::new();
        assert_eq!(q.next_expired(10, 500, |_| false), Expiry::Idle(500));
    }

    #[test]
    fn future_deadline_sets_poll_timeout() {
        let mut q = TimeoutQueue::new();
        let mut a = req();
        q.track(300, Token::new(0, 0), &mut a);

        assert_eq!(q.next_expired(100, 1_000, |_| false), Expiry::Idle(200));
        // capped by the idle timeout
        assert_eq!(q.next_expired(100, 50, |_| false), Expiry::Idle(50));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn expires_in_deadline_order() {
        let mut q = TimeoutQueue::new();
        let (mut a, mut b, mut c) = (req(), req(), req());
        q.track(30, Token::new(1, 0), &mut a);
        q.track(10, Token::new(2, 0), &mut b);
        q.track(20, Token::new(3, 0), &mut c);

        let (expired, next) = drain(&mut q, 25);
        let ids: Vec<_> = expired.iter().map(|e| e.msg).collect();
        assert_eq!(ids, vec![b.id, c.id]);
        assert_eq!(next, 5);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn settled_entries_are_discarded_silently() {
        let mut q = TimeoutQueue::new();
        let (mut a, mut b) = (req(), req());
        q.track(5, Token::new(1, 0), &mut a);
        q.track(6, Token::new(1, 0), &mut b);

        let done = a.id;
        match q.next_expired(100, 1_000, |e| e.msg == done) {
            Expiry::Expired(e) => assert_eq!(e.msg, b.id),
            other => panic!("unexpected {other:?}"),
        }
        assert!(q.is_empty());
    }

    #[test]
    fn untrack_twice_is_noop() {
        let mut q = TimeoutQueue::new();
        let (mut a, mut b) = (req(), req());
        q.track(10, Token::new(1, 0), &mut a);
        q.track(10, Token::new(1, 0), &mut b);

        assert!(q.untrack(&mut a).is_some());
        assert!(!a.is_tracked());
        assert!(q.untrack(&mut a).is_none());
        assert_eq!(q.len(), 1);
        assert!(q.contains(&b));
        assert_eq!(q.min().map(|e| e.msg), Some(b.id));
    }

    #[test]
    fn retrack_replaces_previous_entry() {
        let mut q = TimeoutQueue::new();
        let mut a = req();
        q.track(10, Token::new(1, 0), &mut a);
        q.track(40, Token::new(1, 0), &mut a);
        assert_eq!(q.len(), 1);
        assert_eq!(q.min().map(|e| e.deadline), Some(40));
    }

    #[test]
    fn sweep_respects_now_for_arbitrary_histories() {
        // xorshift keeps the sequence deterministic
        let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        for _round in 0..50 {
            let mut q = TimeoutQueue::new();
            let mut live: Vec<Envelope> = Vec::new();

            for _ in 0..64 {
                if live.is_empty() || next() % 3 != 0 {
                    let mut m = req();
                    q.track(next() % 1_000, Token::new(0, 0), &mut m);
                    live.push(m);
                } else {
                    let idx = (next() as usize) % live.len();
                    let mut m = live.swap_remove(idx);
                    q.untrack(&mut m);
                    // a second untrack must not disturb anything
                    q.untrack(&mut m);
                }
            }

            let now = next() % 1_000;
            let due: usize = live
                .iter()
                .filter(|m| m.timeout.map(|k| k.deadline()) <= Some(now))
                .count();

            let (expired, _) = drain(&mut q, now);
            assert!(expired.iter().all(|e| e.deadline <= now));
            assert_eq!(expired.len(), due);
            assert!(q.min().is_none_or(|e| e.deadline > now));
            assert_eq!(q.len(), live.len() - due);
        }
    }
}
