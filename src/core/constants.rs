pub const READ_BUF: usize = 16 * 1024;

// longest frame a link may buffer before it is closed
pub const MAX_FRAME_LEN: usize = 1024 * 1024;
// unsent bytes a link may queue before it is closed
pub const MAX_PENDING_OUTPUT: usize = 8 * 1024 * 1024;

pub const RING_SIZE: u32 = 1024;
pub const POOL_CAPACITY: usize = 4096;
pub const IO_BUFFER_CAPACITY: usize = 32 * 1024;

// cross-worker channel depth per worker
pub const CHANNEL_CAPACITY: usize = 64 * 1024;

pub const MAX_TIMEOUT_MS: u64 = 30_000;
pub const REQUEST_TIMEOUT_MS: u64 = 5_000;

pub const LISTEN_BACKLOG: i32 = 1024;
