use std::sync::OnceLock;
use std::time::Instant;

/// Milliseconds on the process-wide monotonic clock.
pub type Msec = u64;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Current time in milliseconds since the first call in this process.
///
/// Deadlines and sweep times share this clock, so they only need to be
/// comparable with each other.
pub fn msec_now() -> Msec {
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as Msec
}
