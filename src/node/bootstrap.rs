//! Joining the network through a seed node.
//!
//! A bootstrap pings the seed, looks up the local id through the seed (phase one) and then
//! refreshes every routing bucket (phase two). A routing table judged stale during phase two is
//! purged and the whole bootstrap restarts, once.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::error::DhtError;
use crate::future::DhtFuture;
use crate::node::contact::Contact;
use crate::node::lookup::{LookupKind, LookupResult};
use crate::node::{deadline_within, wait_for, Node};

/// Where a bootstrap starts from.
#[derive(Clone, Debug)]
pub(crate) enum Seed {
    Addr(SocketAddr),
    Contact(Contact),
}

impl Seed {
    fn addr(&self) -> SocketAddr {
        match *self {
            Seed::Addr(addr) => addr,
            Seed::Contact(ref contact) => contact.addr,
        }
    }
}

/// The outcome of a successful bootstrap.
#[derive(Clone, Debug)]
pub struct BootstrapResult {
    /// The seed as it answered the ping.
    pub seed: Contact,
    /// The self-lookup of the last attempt.
    pub phase_one: LookupResult,
    /// Number of bucket refresh lookups run in the last attempt.
    pub phase_two: usize,
    /// Whether bucket refreshing grew the routing table.
    pub found_new_contacts: bool,
    /// Whether a stale routing table was purged along the way.
    pub purged: bool,
    /// Number of times the local id was regenerated after a collision.
    pub id_changes: usize,
}

enum RefreshOutcome {
    Complete { lookups: usize, found_new_contacts: bool },
    Stale,
}

/// Owns the node's bootstrap state. At most one bootstrap runs at a time.
#[derive(Default)]
pub struct BootstrapManager {
    future: Arc<Mutex<Option<DhtFuture<BootstrapResult>>>>,
    bootstrapped: Arc<AtomicBool>,
}

impl BootstrapManager {
    pub fn new() -> Self {
        BootstrapManager::default()
    }

    /// Starts a bootstrap from `seed`, stopping a previous one that may still be running.
    pub(crate) fn bootstrap(&self, node: &Node, seed: Seed) -> DhtFuture<BootstrapResult> {
        self.stop();
        info!("{} - Bootstrapping from {}", node.addr(), seed.addr());
        node.stats.bootstrap_attempts.inc();

        let process = BootstrapProcess {
            node: node.clone(),
            seed,
            bootstrapped: Arc::clone(&self.bootstrapped),
        };
        let stats = Arc::clone(&node.stats);
        let addr = node.addr();
        let future = node.pool.submit(move |handle| {
            let result = process.run(handle);
            match result {
                Ok(_) => stats.bootstrap_successes.inc(),
                Err(DhtError::Cancelled) => info!("{} - Bootstrap cancelled", addr),
                Err(ref err) => {
                    warn!("{} - Bootstrap failed: {}", addr, err);
                    stats.bootstrap_failures.inc();
                },
            }
            result
        });
        *self.future.lock() = Some(future.clone());

        let slot = Arc::clone(&self.future);
        let entry = future.clone();
        future.add_listener(move |_| {
            let mut slot = slot.lock();
            if slot.as_ref().map_or(false, |future| future.ptr_eq(&entry)) {
                slot.take();
            }
        });
        future
    }

    /// Cancels the running bootstrap. Calling this when no bootstrap runs is a no-op.
    pub fn stop(&self) {
        let future = self.future.lock().take();
        if let Some(future) = future {
            future.cancel();
        }
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::Acquire)
    }

    /// Returns `true` if a bootstrap is running.
    pub fn is_bootstrapping(&self) -> bool {
        self.future.lock().is_some()
    }
}

struct BootstrapProcess {
    node: Node,
    seed: Seed,
    bootstrapped: Arc<AtomicBool>,
}

impl BootstrapProcess {
    fn run(self, handle: &DhtFuture<BootstrapResult>) -> Result<BootstrapResult, DhtError> {
        let config = Arc::clone(&self.node.config);
        let mut purged = false;
        let mut id_changes = 0;

        loop {
            let deadline = Instant::now() + config.bootstrap_timeout();

            let seed = self.ping_seed(handle, deadline)?;
            let phase_one = self.self_lookup(handle, &seed, deadline, &mut id_changes)?;

            match self.refresh_buckets(handle, deadline)? {
                RefreshOutcome::Complete {
                    lookups,
                    found_new_contacts,
                } => {
                    self.bootstrapped.store(true, Ordering::Release);
                    info!(
                        "{} - Bootstrapped from {:?} with {} contacts",
                        self.node.addr(),
                        seed,
                        self.node.routing_table.read().len()
                    );
                    return Ok(BootstrapResult {
                        seed,
                        phase_one,
                        phase_two: lookups,
                        found_new_contacts,
                        purged,
                        id_changes,
                    });
                },
                RefreshOutcome::Stale if purged => {
                    warn!("{} - Routing table is still stale after a purge", self.node.addr());
                    return Err(DhtError::StaleRoutingTable);
                },
                RefreshOutcome::Stale => {
                    warn!("{} - Routing table is stale, purging and restarting", self.node.addr());
                    self.node.routing_table.write().purge();
                    self.node.stats.route_table_purges.inc();
                    purged = true;
                },
            }
        }
    }

    fn ping_seed(
        &self,
        handle: &DhtFuture<BootstrapResult>,
        deadline: Instant,
    ) -> Result<Contact, DhtError> {
        let config = &self.node.config;
        let target_id = match self.seed {
            Seed::Addr(_) => None,
            Seed::Contact(ref contact) => Some(contact.id),
        };
        let ping = self.node.ping_request(target_id, self.seed.addr(), config.ping_timeout);
        match wait_for(handle, &ping, deadline_within(deadline, config.ping_timeout)) {
            Ok(seed) => Ok(seed),
            Err(DhtError::Cancelled) => Err(DhtError::Cancelled),
            Err(err) => Err(DhtError::BootstrapFailed(format!(
                "seed {} did not respond: {}",
                self.seed.addr(),
                err
            ))),
        }
    }

    /// Looks up the local id through `seed`, regenerating the local id while another node is
    /// confirmed to use it.
    fn self_lookup(
        &self,
        handle: &DhtFuture<BootstrapResult>,
        seed: &Contact,
        deadline: Instant,
        id_changes: &mut usize,
    ) -> Result<LookupResult, DhtError> {
        let config = &self.node.config;
        loop {
            let local_id = self.node.local_id();
            let seeds = vec![seed.clone()];
            let lookup =
                self.node.lookups.lookup_from(&self.node, local_id, LookupKind::FindNode, seeds);
            let result = wait_for(handle, &lookup, deadline_within(deadline, config.lookup_timeout))?;

            if self.has_collision(handle, &result, deadline)? {
                self.node.stats.id_collisions.inc();
                *id_changes += 1;
                if *id_changes > config.max_collision_retries {
                    return Err(DhtError::PersistentCollision);
                }
                let new_id = self.node.change_local_id();
                warn!(
                    "{} - Local id {:?} is in use, retrying as {:?}",
                    self.node.addr(),
                    local_id,
                    new_id
                );
                continue;
            }

            if result.contacts.is_empty() {
                return Err(DhtError::BootstrapFailed(
                    "self lookup did not reach any contact".to_string(),
                ));
            }
            return Ok(result);
        }
    }

    /// Pings every contact reported with the local id. A response carrying the local id confirms
    /// the collision.
    fn has_collision(
        &self,
        handle: &DhtFuture<BootstrapResult>,
        result: &LookupResult,
        deadline: Instant,
    ) -> Result<bool, DhtError> {
        let config = &self.node.config;
        for contact in &result.collisions {
            let ping =
                self.node.ping_request(Some(result.target), contact.addr, config.request_timeout);
            match wait_for(handle, &ping, deadline) {
                Ok(_) => return Ok(true),
                Err(DhtError::Cancelled) => return Err(DhtError::Cancelled),
                Err(err) => {
                    debug!("{} - Collision with {:?} not confirmed: {}", self.node.addr(), contact, err)
                },
            }
        }
        Ok(false)
    }

    /// Looks up a random id in every bucket. Contacts from the routing table that time out count
    /// against the table.
    ///
    /// Running out of the phase budget ends the phase; running out of the overall bootstrap
    /// budget fails it with `DhtError::Timeout`.
    fn refresh_buckets(
        &self,
        handle: &DhtFuture<BootstrapResult>,
        deadline: Instant,
    ) -> Result<RefreshOutcome, DhtError> {
        let config = &self.node.config;
        let phase_deadline = deadline_within(deadline, config.refresh_timeout);
        let ids = self.node.routing_table.write().refresh_ids(true);
        let initial_len = self.node.routing_table.read().len();
        let mut failures = 0;
        let mut lookups = 0;

        for id in ids {
            let now = Instant::now();
            if now >= deadline {
                return Err(self.out_of_time());
            }
            if now >= phase_deadline {
                debug!("{} - Bucket refresh budget elapsed", self.node.addr());
                break;
            }
            lookups += 1;
            match wait_for(handle, &self.node.find_node(id), phase_deadline) {
                Ok(result) => failures += result.route_table_timeouts,
                Err(DhtError::Cancelled) => return Err(DhtError::Cancelled),
                Err(DhtError::Timeout) if Instant::now() >= deadline => {
                    return Err(self.out_of_time())
                },
                Err(DhtError::Timeout) => break,
                Err(err) => debug!("{} - Refresh of {:?} failed: {}", self.node.addr(), id, err),
            }
            if failures > config.max_bootstrap_failures {
                return Ok(RefreshOutcome::Stale);
            }
        }

        let found_new_contacts = self.node.routing_table.read().len() > initial_len;
        Ok(RefreshOutcome::Complete {
            lookups,
            found_new_contacts,
        })
    }

    fn out_of_time(&self) -> DhtError {
        warn!("{} - Bootstrap ran out of time during bucket refresh", self.node.addr());
        DhtError::Timeout
    }
}
