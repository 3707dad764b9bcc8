pub mod clock;
pub mod fd;

pub use clock::{Msec, msec_now};

/// Report a test that cannot run because io_uring is missing. Setting
/// `RINGPROXY_REQUIRE_URING` turns the skip into a failure.
#[cfg(test)]
pub(crate) fn uring_unavailable(e: &dyn std::fmt::Display) {
    if std::env::var_os("RINGPROXY_REQUIRE_URING").is_some() {
        panic!("io_uring required but unavailable: {e}");
    }
    eprintln!("skipping: io_uring unavailable ({e})");
}
