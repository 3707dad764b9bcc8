use std::net::SocketAddr;

use crate::core::constants;

/// Process-wide settings every worker reads.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Number of worker threads
    pub workers: usize,
    /// Client-facing listen address, bound by every worker (SO_REUSEPORT)
    pub listen: SocketAddr,
    /// Listen address for peer nodes, if this node takes peer traffic
    pub peer_listen: Option<SocketAddr>,
    /// Storage backend for this node's shard
    pub datastore: SocketAddr,
    /// Upper bound on how long a worker blocks waiting for readiness
    pub max_timeout_ms: u64,
    /// How long a forwarded request may stay unanswered
    pub request_timeout_ms: u64,
    /// Connect to the datastore before serving instead of on first use
    pub preconnect: bool,
    /// Size of the io_uring submission/completion queue
    pub ring_size: u32,
    /// Depth of each worker's inbound cross-worker channel
    pub channel_capacity: usize,
    /// Initial capacity for the connection table
    pub pool_capacity: usize,
    /// Read chunk for transports
    pub io_buffer_capacity: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            listen: SocketAddr::from(([0, 0, 0, 0], 8102)),
            peer_listen: None,
            datastore: SocketAddr::from(([127, 0, 0, 1], 6379)),
            max_timeout_ms: constants::MAX_TIMEOUT_MS,
            request_timeout_ms: constants::REQUEST_TIMEOUT_MS,
            preconnect: true,
            ring_size: constants::RING_SIZE,
            channel_capacity: constants::CHANNEL_CAPACITY,
            pool_capacity: constants::POOL_CAPACITY,
            io_buffer_capacity: constants::IO_BUFFER_CAPACITY,
        }
    }
}

impl ProxyConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_listen(mut self, listen: SocketAddr) -> Self {
        self.listen = listen;
        self
    }

    pub fn with_peer_listen(mut self, peer_listen: SocketAddr) -> Self {
        self.peer_listen = Some(peer_listen);
        self
    }

    pub fn with_datastore(mut self, datastore: SocketAddr) -> Self {
        self.datastore = datastore;
        self
    }

    pub fn with_timeouts(mut self, request_timeout_ms: u64, max_timeout_ms: u64) -> Self {
        self.request_timeout_ms = request_timeout_ms;
        self.max_timeout_ms = max_timeout_ms;
        self
    }

    pub fn with_preconnect(mut self, preconnect: bool) -> Self {
        self.preconnect = preconnect;
        self
    }

    pub fn with_channel_capacity(mut self, channel_capacity: usize) -> Self {
        self.channel_capacity = channel_capacity.max(1);
        self
    }
}
