use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Counter {
    /// Requests to a peer in this datacenter that timed out.
    PeerTimedoutRequests,
    /// Requests to a peer in another datacenter that timed out.
    RemotePeerTimedoutRequests,
    /// Requests to the storage backend dropped on timeout.
    ServerDroppedRequests,
    /// Responses that arrived after their client went away.
    SwallowedResponses,
    /// Envelopes a worker could not hand to another worker.
    ChannelSendFailures,
}

impl Counter {
    pub const ALL: [Counter; 5] = [
        Counter::PeerTimedoutRequests,
        Counter::RemotePeerTimedoutRequests,
        Counter::ServerDroppedRequests,
        Counter::SwallowedResponses,
        Counter::ChannelSendFailures,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Counter::PeerTimedoutRequests => "peer_timedout_requests",
            Counter::RemotePeerTimedoutRequests => "remote_peer_timedout_requests",
            Counter::ServerDroppedRequests => "server_dropped_requests",
            Counter::SwallowedResponses => "swallowed_responses",
            Counter::ChannelSendFailures => "channel_send_failures",
        }
    }
}

/// Process-wide named counters, bumped from any worker.
#[derive(Debug, Default)]
pub struct Stats {
    counters: [AtomicU64; 5],
}

impl Stats {
    pub fn incr(&self, counter: Counter) {
        self.counters[counter as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        Counter::ALL.iter().map(|c| (c.name(), self.get(*c))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_independent() {
        let stats = Stats::default();
        stats.incr(Counter::ServerDroppedRequests);
        stats.incr(Counter::ServerDroppedRequests);
        stats.incr(Counter::PeerTimedoutRequests);

        assert_eq!(stats.get(Counter::ServerDroppedRequests), 2);
        assert_eq!(stats.get(Counter::PeerTimedoutRequests), 1);
        assert_eq!(stats.get(Counter::RemotePeerTimedoutRequests), 0);
        assert!(stats.snapshot().contains(&("server_dropped_requests", 2)));
    }
}
