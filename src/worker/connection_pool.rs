use std::collections::VecDeque;

use crate::core::conn::{Conn, Token};

struct Slot {
    generation: u32,
    conn: Option<Conn>,
}

/// Connection table using slab allocation with a freelist
///
/// Slots are reused, but every reuse bumps the slot generation, so a token
/// handed out for an earlier connection stops resolving once it is removed.
pub struct ConnectionTable {
    slots: Vec<Slot>,
    freelist: VecDeque<usize>,
    live: usize,
}

impl ConnectionTable {
    pub fn new(initial_capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(initial_capacity),
            freelist: VecDeque::new(),
            live: 0,
        }
    }

    /// Reserve a token for a connection about to be inserted.
    pub fn alloc(&mut self) -> Token {
        if let Some(idx) = self.freelist.pop_front() {
            return Token::new(idx as u32, self.slots[idx].generation);
        }
        let idx = self.slots.len();
        self.slots.push(Slot {
            generation: 0,
            conn: None,
        });
        Token::new(idx as u32, 0)
    }

    /// Fill a slot reserved by `alloc`.
    pub fn insert(&mut self, conn: Conn) {
        let token = conn.token;
        let slot = &mut self.slots[token.index()];
        debug_assert_eq!(slot.generation, token.generation());
        debug_assert!(slot.conn.is_none(), "slot {} already occupied", token.index());
        slot.conn = Some(conn);
        self.live += 1;
    }

    /// Give back a token from `alloc` that was never filled.
    pub fn release(&mut self, token: Token) {
        if let Some(slot) = self.slots.get_mut(token.index())
            && slot.generation == token.generation()
            && slot.conn.is_none()
        {
            slot.generation = slot.generation.wrapping_add(1);
            self.freelist.push_back(token.index());
        }
    }

    pub fn get(&self, token: Token) -> Option<&Conn> {
        let slot = self.slots.get(token.index())?;
        if slot.generation != token.generation() {
            return None;
        }
        slot.conn.as_ref()
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut Conn> {
        let slot = self.slots.get_mut(token.index())?;
        if slot.generation != token.generation() {
            return None;
        }
        slot.conn.as_mut()
    }

    pub fn remove(&mut self, token: Token) -> Option<Conn> {
        let slot = self.slots.get_mut(token.index())?;
        if slot.generation != token.generation() {
            return None;
        }
        let conn = slot.conn.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.freelist.push_back(token.index());
        self.live -= 1;
        Some(conn)
    }

    pub fn tokens(&self) -> Vec<Token> {
        self.slots
            .iter()
            .filter_map(|s| s.conn.as_ref().map(|c| c.token))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::conn::ConnRole;
    use crate::protocol::LineTransport;
    use std::os::unix::net::UnixStream;

    fn conn(token: Token) -> (Conn, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        let transport = LineTransport::new(a, ConnRole::Client, 1024).unwrap();
        (
            Conn::new(token, ConnRole::Client, 0, Box::new(transport), false),
            b,
        )
    }

    #[test]
    fn stale_tokens_do_not_resolve() {
        let mut table = ConnectionTable::new(4);
        let t1 = table.alloc();
        let (c, _peer) = conn(t1);
        table.insert(c);
        assert!(table.get(t1).is_some());
        assert_eq!(table.len(), 1);

        assert!(table.remove(t1).is_some());
        assert!(table.get(t1).is_none());
        assert!(table.remove(t1).is_none());

        // slot is reused under a new generation
        let t2 = table.alloc();
        assert_eq!(t2.index(), t1.index());
        assert_ne!(t2, t1);
        let (c, _peer2) = conn(t2);
        table.insert(c);
        assert!(table.get(t1).is_none());
        assert!(table.get_mut(t2).is_some());
        assert_eq!(table.tokens(), vec![t2]);
    }

    #[test]
    fn released_reservation_is_recycled() {
        let mut table = ConnectionTable::new(1);
        let t1 = table.alloc();
        table.release(t1);
        let t2 = table.alloc();
        assert_eq!(t2.index(), t1.index());
        assert_ne!(t2.generation(), t1.generation());
        assert!(table.is_empty());
    }
}
