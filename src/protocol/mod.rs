//! Wire framing for client, backend and peer links.

pub mod line;

pub use line::{LineTransport, ListenerTransport};
