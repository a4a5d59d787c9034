//! Overlay runtime configuration.
//!
//! Every interval, threshold, and probability the runtime consults lives
//! here so deployments and tests can inject their own values — tests in
//! particular run with compressed time scales and pinned probabilities
//! rather than the production defaults.

use std::time::Duration;

/// Tunables for the overlay runtime.
///
/// The defaults are the canonical production values. Components hold a
/// clone of this struct at construction time; changing a config after a
/// component is built has no effect on it.
#[derive(Clone, Debug)]
pub struct OverlayConfig {
    /// How often the record store sweeps expired records.
    pub store_gc_interval: Duration,
    /// How often the SRDI index sweeps expired and removed-peer entries.
    pub srdi_gc_interval: Duration,
    /// Delay between SRDI pushes while connected to a rendezvous.
    pub push_interval: Duration,
    /// How often the membership watchdog evaluates promotion/demotion.
    pub watchdog_interval: Duration,

    /// Minimum peer-view size before index replication is attempted.
    pub replication_threshold: usize,
    /// Hop budget ceiling applied to every message on receipt.
    pub max_ttl: u32,
    /// Hop count beyond which forwarded SRDI queries are silently dropped.
    pub max_forward_hops: u32,
    /// Largest candidate set a query is forwarded to before a uniform
    /// random subset of this size is taken instead.
    pub forward_fanout: usize,

    /// Peer-view size above which a rendezvous is considered one of "many".
    pub many_peers_threshold: usize,
    /// Client count below which a rendezvous is considered underused.
    pub few_clients_threshold: usize,
    /// Probability that an underused rendezvous demotes itself on a single
    /// watchdog tick. Randomized damping so overprovisioned rendezvous
    /// don't all demote on the same tick.
    pub demotion_probability: f64,
    /// Lease granted to connecting clients; expiry degrades to disconnect.
    pub client_lease: Duration,

    /// Message-id history capacity for general rendezvous traffic.
    pub seen_cache_capacity: usize,
    /// Message-id history capacity for wire-pipe traffic.
    pub pipe_seen_cache_capacity: usize,

    /// Result bound for SRDI-backed pipe lookups.
    pub query_threshold: usize,
    /// Default timeout for synchronous pipe resolution.
    pub resolve_timeout: Duration,
    /// Queue depth for queue-backed input pipes.
    pub pipe_queue_depth: usize,
    /// How long a push into a full input-pipe queue waits before failing.
    pub pipe_queue_push_timeout: Duration,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            store_gc_interval: Duration::from_secs(120),
            srdi_gc_interval: Duration::from_secs(120),
            push_interval: Duration::from_secs(30),
            watchdog_interval: Duration::from_secs(300),

            replication_threshold: 3,
            max_ttl: 10,
            max_forward_hops: 2,
            forward_fanout: 5,

            many_peers_threshold: 5,
            few_clients_threshold: 3,
            demotion_probability: 0.05,
            client_lease: Duration::from_secs(1200),

            seen_cache_capacity: 1000,
            pipe_seen_cache_capacity: 250,

            query_threshold: 10,
            resolve_timeout: Duration::from_secs(30),
            pipe_queue_depth: 100,
            pipe_queue_push_timeout: Duration::from_millis(500),
        }
    }
}

impl OverlayConfig {
    /// A configuration with near-zero intervals for integration tests.
    ///
    /// Probabilistic demotion is disabled; tests that exercise it pin
    /// `demotion_probability` to 1.0 themselves.
    pub fn compressed() -> Self {
        Self {
            store_gc_interval: Duration::from_millis(20),
            srdi_gc_interval: Duration::from_millis(20),
            push_interval: Duration::from_millis(20),
            watchdog_interval: Duration::from_millis(20),
            demotion_probability: 0.0,
            client_lease: Duration::from_millis(200),
            resolve_timeout: Duration::from_millis(250),
            ..Self::default()
        }
    }
}
