//! Newline-delimited framing
//!
//! One frame per line, `\n` terminated, a trailing `\r` is dropped. Frames
//! read on a client-side link (`Client`, `PeerClient`) are requests, frames
//! read on a backend or peer link (`Server`, `PeerServer`) are responses.
//! An error response goes out as `-ERR <errno>`.

use std::io::{self, Read, Write};
use std::net::TcpListener;
use std::os::fd::{AsRawFd, RawFd};

use memchr::memchr;
use tracing::{trace, warn};

use crate::core::conn::{ConnRole, Inbound, Progress, Transport};
use crate::core::constants::{MAX_FRAME_LEN, MAX_PENDING_OUTPUT, READ_BUF};
use crate::core::envelope::Envelope;

// ============================================================================
// Buffer Management
// ============================================================================

/// Growable read buffer with a consumed prefix, never larger than `max`
pub struct LineBuf {
    buf: Vec<u8>,
    start: usize,
    end: usize,
    max: usize,
}

impl LineBuf {
    pub fn with_capacity(cap: usize, max: usize) -> Self {
        let max = max.max(1);
        Self {
            buf: vec![0; cap.clamp(1, max)],
            start: 0,
            end: 0,
            max,
        }
    }

    /// Free tail of the buffer for the next read, growing it when full.
    /// `None` once a single unterminated frame fills `max` bytes.
    pub fn spare(&mut self) -> Option<&mut [u8]> {
        if self.end == self.buf.len() {
            if self.start > 0 {
                self.compact();
            } else if self.buf.len() < self.max {
                let grown = (self.buf.len() * 2).min(self.max);
                self.buf.resize(grown, 0);
            } else {
                return None;
            }
        }
        Some(&mut self.buf[self.end..])
    }

    /// Mark that n bytes were written to the buffer
    pub fn wrote(&mut self, n: usize) {
        debug_assert!(self.end + n <= self.buf.len());
        self.end += n;
    }

    /// Next complete line, without its terminator.
    pub fn next_line(&mut self) -> Option<Vec<u8>> {
        let pos = memchr(b'\n', self.window())?;
        let mut line = &self.buf[self.start..self.start + pos];
        if let [head @ .., b'\r'] = line {
            line = head;
        }
        let line = line.to_vec();
        self.consume(pos + 1);
        Some(line)
    }

    /// Consume n bytes of the window. Compacts the buffer if start passes the
    /// halfway point.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(self.start + n <= self.end);
        self.start += n;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        } else if self.start > self.buf.len() / 2 {
            self.compact();
        }
    }

    fn compact(&mut self) {
        let len = self.end - self.start;
        self.buf.copy_within(self.start..self.end, 0);
        self.start = 0;
        self.end = len;
    }

    /// Get the current readable window
    pub fn window(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }
}

// ============================================================================
// Frame Encoding
// ============================================================================

const ERR_PREFIX: &[u8] = b"-ERR ";

pub fn encode(msg: &Envelope, out: &mut Vec<u8>) {
    match msg.error {
        Some(errno) => {
            out.extend_from_slice(ERR_PREFIX);
            out.extend_from_slice(errno.to_string().as_bytes());
        }
        None => out.extend_from_slice(&msg.payload),
    }
    out.push(b'\n');
}

/// Build the envelope for a frame read on a link of `role`.
pub fn decode(role: ConnRole, line: Vec<u8>) -> Envelope {
    match role {
        ConnRole::Server | ConnRole::PeerServer => {
            let errno = line
                .strip_prefix(ERR_PREFIX)
                .and_then(|rest| std::str::from_utf8(rest).ok())
                .and_then(|s| s.trim().parse::<i32>().ok());
            let mut rsp = Envelope::response(line);
            rsp.error = errno;
            rsp
        }
        _ => Envelope::request(line),
    }
}

// ============================================================================
// Stream Transport
// ============================================================================

/// Line framing over a nonblocking stream.
///
/// A frame longer than the frame limit, or more unsent output than the output
/// limit, fails the link: `recv` returns `EMSGSIZE` and `send` returns
/// `ENOBUFS`.
pub struct LineTransport<S> {
    stream: S,
    role: ConnRole,
    input: LineBuf,
    output: Vec<u8>,
    sent: usize,
    max_output: usize,
    overflowed: bool,
}

impl<S: Read + Write + AsRawFd + Send> LineTransport<S> {
    /// Wrap `stream`, switching it to nonblocking mode.
    pub fn new(stream: S, role: ConnRole, buf_capacity: usize) -> io::Result<Self> {
        set_nonblocking(stream.as_raw_fd())?;
        Ok(Self {
            stream,
            role,
            input: LineBuf::with_capacity(buf_capacity.min(READ_BUF), MAX_FRAME_LEN),
            output: Vec::new(),
            sent: 0,
            max_output: MAX_PENDING_OUTPUT,
            overflowed: false,
        })
    }

    /// Override the frame and output limits.
    pub fn with_limits(mut self, max_frame: usize, max_output: usize) -> Self {
        let cap = self.input.buf.len();
        self.input = LineBuf::with_capacity(cap, max_frame);
        self.max_output = max_output;
        self
    }

    pub fn role(&self) -> ConnRole {
        self.role
    }
}

impl<S: Read + Write + AsRawFd + Send> Transport for LineTransport<S> {
    fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn recv(&mut self, inbound: &mut Vec<Inbound>) -> io::Result<Progress> {
        let mut progress = Progress::Open;
        loop {
            let Some(spare) = self.input.spare() else {
                warn!(fd = self.fd(), max = self.input.max, "frame too long");
                return Err(io::Error::from_raw_os_error(libc::EMSGSIZE));
            };
            match self.stream.read(spare) {
                Ok(0) => {
                    progress = Progress::Closed;
                    break;
                }
                Ok(n) => {
                    self.input.wrote(n);
                    self.drain_lines(inbound);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        trace!(fd = self.fd(), buffered = self.input.window().len(), ?progress, "recv");
        Ok(progress)
    }

    fn stage(&mut self, msg: &Envelope) {
        if self.overflowed {
            return;
        }
        let before = self.output.len();
        encode(msg, &mut self.output);
        if self.output.len() - self.sent > self.max_output {
            warn!(fd = self.fd(), pending = before - self.sent, id = msg.id, "output backlog full");
            self.output.truncate(before);
            self.overflowed = true;
        }
    }

    fn send(&mut self) -> io::Result<Progress> {
        if self.overflowed {
            return Err(io::Error::from_raw_os_error(libc::ENOBUFS));
        }
        while self.sent < self.output.len() {
            match self.stream.write(&self.output[self.sent..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if self.sent > self.output.len() / 2 {
                        self.output.drain(..self.sent);
                        self.sent = 0;
                    }
                    return Ok(Progress::Open);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.output.clear();
        self.sent = 0;
        Ok(Progress::Open)
    }

    fn has_pending(&self) -> bool {
        self.overflowed || self.sent < self.output.len()
    }
}

impl<S: Read + Write + AsRawFd + Send> LineTransport<S> {
    fn drain_lines(&mut self, inbound: &mut Vec<Inbound>) {
        while let Some(line) = self.input.next_line() {
            inbound.push(Inbound::Message(decode(self.role, line)));
        }
    }
}

// ============================================================================
// Listener Transport
// ============================================================================

/// Accepts connections on a nonblocking listener. Every accepted stream is
/// wrapped in a [`LineTransport`] for the role the listener's role accepts.
pub struct ListenerTransport {
    listener: TcpListener,
    role: ConnRole,
    same_dc: bool,
    buf_capacity: usize,
}

impl ListenerTransport {
    pub fn new(
        listener: TcpListener,
        role: ConnRole,
        same_dc: bool,
        buf_capacity: usize,
    ) -> io::Result<Self> {
        if !role.is_listener() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{role} is not a listener role"),
            ));
        }
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            role,
            same_dc,
            buf_capacity,
        })
    }
}

impl Transport for ListenerTransport {
    fn fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    fn recv(&mut self, inbound: &mut Vec<Inbound>) -> io::Result<Progress> {
        let Some(accepted_role) = self.role.accepted_role() else {
            return Ok(Progress::Open);
        };
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(%addr, %e, "set_nodelay failed");
                    }
                    let transport = match LineTransport::new(stream, accepted_role, self.buf_capacity) {
                        Ok(t) => t,
                        Err(e) => {
                            warn!(%addr, %e, "failed to set up accepted conn");
                            continue;
                        }
                    };
                    trace!(%addr, role = %accepted_role, "accepted");
                    inbound.push(Inbound::Accepted {
                        transport: Box::new(transport),
                        same_dc: self.same_dc,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.raw_os_error() == Some(libc::ECONNABORTED) => continue,
                Err(e) if matches!(e.raw_os_error(), Some(libc::EMFILE | libc::ENFILE)) => {
                    // out of descriptors: keep listening, retry on next readiness
                    warn!(fd = self.fd(), %e, "accept failed");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Progress::Open)
    }

    fn stage(&mut self, msg: &Envelope) {
        warn!(fd = self.fd(), id = msg.id, "write staged on listener, dropped");
    }

    fn send(&mut self) -> io::Result<Progress> {
        Ok(Progress::Open)
    }

    fn has_pending(&self) -> bool {
        false
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
