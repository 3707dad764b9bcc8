//! Per-worker execution core
//!
//! This module provides everything one worker thread runs:
//! - Readiness dispatcher powered by io_uring
//! - Cross-worker channel and the handle other workers reach it through
//! - Timeout queue for forwarded requests
//! - The worker loop and its event handlers

pub mod channel;
pub mod config;
pub mod connection_pool;
pub mod context;
pub mod dispatcher;
pub mod handle;
mod handlers;
pub mod timeout;

use std::sync::{Arc, Barrier};
use std::thread::{self, JoinHandle};

use core_affinity::CoreId;
use tracing::{info, warn};

use crate::error::Result;

pub use config::ProxyConfig;
pub use context::Worker;
pub use handle::WorkerHandle;

/// Start one thread per worker and return once all of them finished startup
/// (preconnect included) and are about to serve.
///
/// Threads are pinned to cores round-robin when the core list is available.
pub fn spawn_workers(workers: Vec<Worker>) -> Result<Vec<JoinHandle<Result<()>>>> {
    let ready = Arc::new(Barrier::new(workers.len() + 1));
    let cores: Vec<CoreId> = core_affinity::get_core_ids().unwrap_or_default();

    let mut handles = Vec::with_capacity(workers.len());
    for worker in workers {
        let id = worker.id();
        let core = (!cores.is_empty()).then(|| cores[id % cores.len()]);
        let ready = Arc::clone(&ready);

        let spawned = thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || {
                if let Some(core) = core {
                    if core_affinity::set_for_current(core) {
                        info!(worker = id, core = core.id, "pinned to core");
                    } else {
                        warn!(worker = id, core = core.id, "failed to pin to core");
                    }
                }
                worker.run(&ready)
            });
        // threads already started stay parked on the barrier; the caller exits
        handles.push(spawned?);
    }

    ready.wait();
    info!(workers = handles.len(), "all workers started");
    Ok(handles)
}
