//! Engine configuration.

use std::time::Duration;

use crate::{
    BUCKET_REFRESH_INTERVAL, CONCURRENCY_PARAM, KEY_EXPIRATION, REPLICATION_PARAM,
    REQUEST_TIMEOUT,
};

/// Tunables for a `Node`.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Bucket size and the number of contacts a lookup converges on.
    pub k: usize,
    /// Maximum number of outstanding requests per lookup.
    pub alpha: usize,
    /// Maximum number of contacts held in a bucket's replacement cache.
    pub replacement_cache_size: usize,
    /// Timeout of a single request/response exchange.
    pub request_timeout: Duration,
    /// Timeout of the bootstrap ping phase.
    pub ping_timeout: Duration,
    /// Timeout of a whole lookup; also the bootstrap phase one budget.
    pub lookup_timeout: Duration,
    /// Budget of the bootstrap bucket-refresh phase.
    pub refresh_timeout: Duration,
    /// Route table timeouts tolerated during bucket refresh before the table is judged stale.
    pub max_bootstrap_failures: usize,
    /// Number of times the local id may be regenerated after confirmed collisions.
    pub max_collision_retries: usize,
    /// Failures after which a contact that has been alive is considered dead.
    pub max_alive_failures: u32,
    /// Failures after which a contact that has never been alive is considered dead.
    pub max_unknown_failures: u32,
    /// Failures in a row after which further failures are attributed to our own connectivity.
    pub max_consecutive_failures: usize,
    /// Keep querying closer contacts even if the k closest stopped improving.
    pub exhaustive_lookups: bool,
    /// Drop a value published by another node once `k` contacts closer to it are known.
    pub drop_furthest_values: bool,
    pub bucket_refresh_interval: Duration,
    pub token_rotation_interval: Duration,
    pub republish_interval: Duration,
    pub value_expiration: Duration,
    /// Size of each of the two worker pools: one runs lookups, the other the bootstraps and
    /// stores that wait on them.
    pub worker_threads: usize,
    /// How often overdue requests are swept.
    pub timeout_tick: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        DhtConfig {
            k: REPLICATION_PARAM,
            alpha: CONCURRENCY_PARAM,
            replacement_cache_size: REPLICATION_PARAM,
            request_timeout: Duration::from_millis(REQUEST_TIMEOUT),
            ping_timeout: Duration::from_millis(REQUEST_TIMEOUT),
            lookup_timeout: Duration::from_secs(60),
            refresh_timeout: Duration::from_secs(120),
            max_bootstrap_failures: 40,
            max_collision_retries: 5,
            max_alive_failures: 4,
            max_unknown_failures: 2,
            max_consecutive_failures: 100,
            exhaustive_lookups: false,
            drop_furthest_values: false,
            bucket_refresh_interval: Duration::from_secs(BUCKET_REFRESH_INTERVAL),
            token_rotation_interval: Duration::from_secs(5 * 60),
            republish_interval: Duration::from_secs(KEY_EXPIRATION / 2),
            value_expiration: Duration::from_secs(KEY_EXPIRATION),
            worker_threads: 16,
            timeout_tick: Duration::from_millis(100),
        }
    }
}

impl DhtConfig {
    /// Configuration with short timeouts, for in-process networks.
    pub fn for_testing() -> Self {
        DhtConfig {
            request_timeout: Duration::from_millis(150),
            ping_timeout: Duration::from_millis(500),
            lookup_timeout: Duration::from_secs(3),
            refresh_timeout: Duration::from_secs(6),
            worker_threads: 8,
            timeout_tick: Duration::from_millis(10),
            ..Default::default()
        }
    }

    /// Returns the overall bootstrap budget.
    pub fn bootstrap_timeout(&self) -> Duration {
        self.ping_timeout + self.lookup_timeout + self.refresh_timeout
    }
}
