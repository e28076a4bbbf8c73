use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing named counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

macro_rules! stats {
    ($($name:ident),* $(,)*) => {
        /// Counters populated by the engine's components.
        #[derive(Debug, Default)]
        pub struct DhtStats {
            $(pub $name: Counter,)*
        }

        impl DhtStats {
            /// Returns every counter with its name, in declaration order.
            pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
                vec![$((stringify!($name), self.$name.get()),)*]
            }
        }
    };
}

stats! {
    requests_sent,
    requests_filtered,
    request_timeouts,
    responses_received,
    responses_dropped,
    requests_handled,
    lookups_started,
    lookups_joined,
    lookup_hops,
    bucket_splits,
    contacts_replaced,
    contacts_dead,
    route_table_purges,
    bootstrap_attempts,
    bootstrap_successes,
    bootstrap_failures,
    id_collisions,
    stores_sent,
    stores_accepted,
    stores_rejected,
    values_republished,
    values_forwarded,
    values_dropped,
}
