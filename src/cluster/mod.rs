//! Process-wide state shared by all workers, and the seams to the layers
//! around the worker core: request routing and the storage backend.

pub mod stats;

use std::io;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tracing::info;

use crate::core::conn::{ConnRef, Transport, WorkerId};
use crate::core::envelope::Envelope;
use crate::error::{Error, Result};
use crate::worker::WorkerHandle;
use crate::worker::config::ProxyConfig;

pub use stats::{Counter, Stats};

/// Where a client request goes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Route {
    /// Serve from this node's storage backend.
    Datastore,
    /// Forward to these peer links. More than one fans the request out into
    /// sub-requests; each answer goes back to the client connection, whose
    /// protocol layer decides when enough have arrived.
    Peers(Vec<ConnRef>),
}

/// Topology and consistency decisions, made outside the worker core.
pub trait Router: Send + Sync {
    fn route(&self, req: &Envelope) -> Route;
}

/// Everything goes to the local datastore.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalRouter;

impl Router for LocalRouter {
    fn route(&self, _req: &Envelope) -> Route {
        Route::Datastore
    }
}

/// Storage backend driver.
pub trait Datastore: Send + Sync {
    fn connect(&self) -> io::Result<Box<dyn Transport>>;
}

/// Read-mostly state every worker holds a handle to.
pub struct ProcessContext {
    pub config: ProxyConfig,
    pub stats: Stats,
    router: Box<dyn Router>,
    datastore: Box<dyn Datastore>,
    next_worker_id: AtomicUsize,
    workers: OnceLock<Vec<WorkerHandle>>,
    shutdown: AtomicBool,
}

impl ProcessContext {
    pub fn new(
        config: ProxyConfig,
        router: Box<dyn Router>,
        datastore: Box<dyn Datastore>,
    ) -> Self {
        Self {
            config,
            stats: Stats::default(),
            router,
            datastore,
            next_worker_id: AtomicUsize::new(0),
            workers: OnceLock::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn router(&self) -> &dyn Router {
        self.router.as_ref()
    }

    pub fn datastore(&self) -> &dyn Datastore {
        self.datastore.as_ref()
    }

    pub(crate) fn next_worker_id(&self) -> WorkerId {
        self.next_worker_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Make every worker reachable from every other one. Called once, after
    /// all workers are created and before any of them runs.
    pub fn publish_workers(&self, mut handles: Vec<WorkerHandle>) -> Result<()> {
        handles.sort_by_key(|h| h.id());
        for (idx, h) in handles.iter().enumerate() {
            assert_eq!(idx, h.id(), "worker ids must be dense");
        }
        let count = handles.len();
        self.workers
            .set(handles)
            .map_err(|_| Error::WorkersPublished)?;
        info!(workers = count, "worker handles published");
        Ok(())
    }

    pub fn worker(&self, id: WorkerId) -> Option<&WorkerHandle> {
        self.workers.get()?.get(id)
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        self.workers.get().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Ask every worker to leave its loop.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        for h in self.workers() {
            h.wake();
        }
    }
}
