pub mod bootstrap;
pub mod contact;
pub mod dispatcher;
pub mod lookup;
pub mod store;

use std::cmp;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::config::DhtConfig;
use crate::error::DhtError;
use crate::executor::WorkerPool;
use crate::future::DhtFuture;
use crate::key::Key;
use crate::node::bootstrap::{BootstrapManager, BootstrapResult, Seed};
use crate::node::contact::Contact;
use crate::node::dispatcher::Dispatcher;
use crate::node::lookup::{LookupKind, LookupManager, LookupResult};
use crate::node::store::{StoreResult, StoreStatus};
use crate::protocol::{Body, Header, Message, Transport, UdpTransport};
use crate::routing::{Admission, RoutingTable};
use crate::security::{SecurityTokenProvider, TokenSecrets};
use crate::stats::DhtStats;
use crate::storage::{Storage, StoredValue, ValueStore};

/// A node in the Kademlia DHT.
///
/// `Node` is a cheap handle; clones share the same engine. Every network operation returns a
/// `DhtFuture` immediately and runs on one of the node's worker pools.
#[derive(Clone)]
pub struct Node {
    local: Arc<RwLock<Contact>>,
    pub(crate) config: Arc<DhtConfig>,
    pub(crate) routing_table: Arc<RwLock<RoutingTable>>,
    storage: Arc<dyn ValueStore>,
    security: Arc<dyn SecurityTokenProvider>,
    transport: Arc<dyn Transport>,
    pub(crate) dispatcher: Dispatcher,
    /// Runs bootstraps and stores, which block on lookups.
    pub(crate) pool: Arc<WorkerPool>,
    /// Runs lookups. Lookups never wait on another pool task.
    pub(crate) lookup_pool: Arc<WorkerPool>,
    pub(crate) lookups: Arc<LookupManager>,
    pub(crate) bootstrapper: Arc<BootstrapManager>,
    pub(crate) stats: Arc<DhtStats>,
    is_active: Arc<AtomicBool>,
}

impl Node {
    /// Constructs a new `Node` listening on UDP address `addr` with a random id.
    pub fn new(addr: &str, config: DhtConfig) -> Result<Self, DhtError> {
        let (message_tx, message_rx) = channel();
        let transport = UdpTransport::bind(addr, message_tx)?;
        let local = Contact::alive(Key::rand(), transport.local_addr()?);
        let storage = Storage::new(config.value_expiration, config.republish_interval);
        let ret = Node::with_collaborators(
            local,
            config,
            Arc::new(transport),
            Arc::new(storage),
            Arc::new(TokenSecrets::new()),
        );
        ret.start_message_handler(message_rx);
        Ok(ret)
    }

    /// Constructs a new `Node` on top of `transport`. Incoming messages must be passed to
    /// `deliver`.
    pub fn with_transport(addr: SocketAddr, config: DhtConfig, transport: Arc<dyn Transport>) -> Self {
        let storage = Storage::new(config.value_expiration, config.republish_interval);
        Node::with_collaborators(
            Contact::alive(Key::rand(), addr),
            config,
            transport,
            Arc::new(storage),
            Arc::new(TokenSecrets::new()),
        )
    }

    /// Constructs a new `Node` from all of its collaborators.
    pub fn with_collaborators(
        local: Contact,
        config: DhtConfig,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn ValueStore>,
        security: Arc<dyn SecurityTokenProvider>,
    ) -> Self {
        let stats = Arc::new(DhtStats::default());
        let routing_table = RoutingTable::new(local.clone(), &config, Arc::clone(&stats));
        let name = local.addr.to_string();
        let pool = WorkerPool::new(config.worker_threads, &name);
        let lookup_pool = WorkerPool::new(config.worker_threads, &format!("{}-lookup", name));
        let ret = Node {
            local: Arc::new(RwLock::new(local)),
            config: Arc::new(config),
            routing_table: Arc::new(RwLock::new(routing_table)),
            storage,
            security,
            transport,
            dispatcher: Dispatcher::new(),
            pool: Arc::new(pool),
            lookup_pool: Arc::new(lookup_pool),
            lookups: Arc::new(LookupManager::new()),
            bootstrapper: Arc::new(BootstrapManager::new()),
            stats,
            is_active: Arc::new(AtomicBool::new(true)),
        };
        ret.start_reaper();
        ret.start_maintenance();
        ret
    }

    /// Starts a thread that passes received messages to the node.
    fn start_message_handler(&self, rx: Receiver<Message>) {
        let node = self.clone();
        thread::spawn(move || {
            for message in rx.iter() {
                node.deliver(message);
            }
            info!("{} - Killed message handler", node.addr());
        });
    }

    /// Starts a thread that times out requests that did not get a response.
    fn start_reaper(&self) {
        let node = self.clone();
        thread::spawn(move || {
            while node.is_active() {
                thread::sleep(node.config.timeout_tick);
                let expired = node.dispatcher.expire();
                node.stats.request_timeouts.add(expired as u64);
            }
            info!("{} - Killed request reaper", node.addr());
        });
    }

    /// Starts a thread that refreshes stale routing buckets, rotates token secrets and
    /// republishes values originated by this node.
    fn start_maintenance(&self) {
        let node = self.clone();
        thread::spawn(move || {
            let tick = node.config.timeout_tick * 10;
            let mut last_rotation = Instant::now();
            let mut last_republish = Instant::now();
            while node.is_active() {
                thread::sleep(tick);
                if !node.is_active() {
                    break;
                }
                if node.is_bootstrapped() {
                    let stale_ids = node.routing_table.write().refresh_ids(false);
                    for id in stale_ids {
                        debug!("{} - Refreshing bucket of {:?}", node.addr(), id);
                        node.find_node(id);
                    }
                }
                if last_rotation.elapsed() >= node.config.token_rotation_interval {
                    node.security.rotate();
                    last_rotation = Instant::now();
                }
                if last_republish.elapsed() >= node.config.republish_interval {
                    node.republish();
                    last_republish = Instant::now();
                }
            }
            info!("{} - Killed maintenance", node.addr());
        });
    }

    fn republish(&self) {
        let local_id = self.local_id();
        for value in self.storage.list_expiring() {
            if value.originator != local_id {
                continue;
            }
            self.storage.put(value.clone());
            self.stats.values_republished.inc();
            self.store(vec![value]);
        }
    }

    /// Handles a message received from the network.
    pub fn deliver(&self, message: Message) {
        if !self.is_active() {
            return;
        }
        let local = self.contact();
        let sender = &message.header.sender;
        if sender.id == local.id && sender.addr == local.addr {
            warn!("{} - Dropping message from ourselves", local.addr);
            return;
        }
        if sender.id != local.id {
            let mut sender = sender.clone();
            sender.mark_alive();
            self.admit(sender);
        }

        if message.body.is_response() {
            let addr = message.header.sender.addr;
            trace!("{} - Receiving {:?} from {}", local.addr, message.body.opcode(), addr);
            self.stats.responses_received.inc();
            if !self.dispatcher.complete(message) {
                warn!(
                    "{} - Original request not found; irrelevant response or expired request from {}.",
                    local.addr, addr
                );
                self.stats.responses_dropped.inc();
            }
        } else {
            self.handle_request(message);
        }
    }

    /// Adds `contact` to the routing table. A live contact that is new to us, or that restarted
    /// since we last heard from it, is offered the values it should now hold.
    pub(crate) fn admit(&self, contact: Contact) {
        let (previous, admission) = {
            let mut routing_table = self.routing_table.write();
            let previous = routing_table
                .get(&contact.id)
                .map(|known| (known.has_been_alive(), known.instance_id));
            (previous, routing_table.add(contact.clone()))
        };
        let is_fresh = match admission {
            Admission::Added => true,
            Admission::Replaced(replaced) => {
                debug!("{} - Replaced {:?}", self.addr(), replaced);
                true
            },
            Admission::Updated => previous.map_or(false, |(has_been_alive, instance_id)| {
                !has_been_alive || instance_id != contact.instance_id
            }),
            _ => false,
        };
        if is_fresh && contact.is_alive() {
            store::forward(self, &contact);
        }
    }

    /// Handles a request RPC.
    fn handle_request(&self, request: Message) {
        let Message { header, body } = request;
        let requester = header.sender;
        trace!("{} - Receiving {:?} from {}", self.addr(), body.opcode(), requester.addr);
        let k = self.config.k;
        let response = match body {
            Body::Ping => Body::Pong {
                external_addr: requester.addr,
                estimated_size: self.routing_table.read().estimate_network_size(),
            },
            Body::FindNodeRequest { target } => Body::FindNodeResponse {
                token: self.security.issue(&requester),
                contacts: self.routing_table.read().select(&target, k),
            },
            Body::FindValueRequest { targets, excluded } => {
                let values: Vec<StoredValue> = targets
                    .iter()
                    .flat_map(|target| self.storage.get(target))
                    .filter(|value| !excluded.contains(&value.originator))
                    .collect();
                let contacts = match targets.first() {
                    Some(target) if values.is_empty() => self.routing_table.read().select(target, k),
                    _ => Vec::new(),
                };
                Body::FindValueResponse {
                    token: self.security.issue(&requester),
                    contacts,
                    values,
                    request_load: targets
                        .first()
                        .map_or(0.0, |target| self.storage.request_load(target)),
                }
            },
            Body::StoreRequest { token, values } => {
                let statuses = values
                    .into_iter()
                    .map(|value| match token {
                        None => StoreStatus::NoToken,
                        Some(ref token) if !self.security.validate(&requester, token) => {
                            StoreStatus::BadToken
                        },
                        Some(_) => {
                            if self.storage.put(value) {
                                StoreStatus::Stored
                            } else {
                                StoreStatus::Rejected
                            }
                        },
                    })
                    .collect();
                Body::StoreResponse { statuses }
            },
            other => {
                warn!("{} - Unexpected request {:?}", self.addr(), other.opcode());
                return;
            },
        };
        self.stats.requests_handled.inc();

        let message = Message {
            header: Header {
                id: header.id,
                sender: self.contact(),
            },
            body: response,
        };
        if !self.transport.send(requester.addr, &message) {
            warn!("{} - Could not respond to {}", self.addr(), requester.addr);
        }
    }

    /// Sends a request to `addr` and returns a future that completes with the response.
    ///
    /// If `target_id` is set, only a response from that id is accepted. A timeout is recorded as
    /// a failure of `target_id` in the routing table.
    pub(crate) fn request(
        &self,
        target_id: Option<Key>,
        addr: SocketAddr,
        body: Body,
        timeout: Duration,
    ) -> DhtFuture<Message> {
        let future = DhtFuture::new();
        if !self.is_active() {
            future.complete(Err(DhtError::Shutdown));
            return future;
        }
        if let Some(target_id) = target_id {
            let routing_table = Arc::clone(&self.routing_table);
            future.add_listener(move |result| {
                if let Err(DhtError::Timeout) = result {
                    routing_table.write().handle_failure(&target_id);
                }
            });
        }
        let id = self.dispatcher.register(target_id, addr, timeout, &future);
        let message = Message {
            header: Header {
                id,
                sender: self.contact(),
            },
            body,
        };

        trace!("{} - Sending {:?} to {}", self.addr(), message.body.opcode(), addr);
        self.stats.requests_sent.inc();
        if !self.transport.send(addr, &message) {
            self.stats.requests_filtered.inc();
            self.dispatcher.fail(&id, DhtError::Filtered);
        }
        future
    }

    pub(crate) fn ping_request(
        &self,
        target_id: Option<Key>,
        addr: SocketAddr,
        timeout: Duration,
    ) -> DhtFuture<Contact> {
        self.request(target_id, addr, Body::Ping, timeout).and_then(|message| match message.body {
            Body::Pong { .. } => {
                let mut contact = message.header.sender;
                contact.mark_alive();
                Ok(contact)
            },
            other => Err(DhtError::Decode(format!("expected a pong, got {:?}", other.opcode()))),
        })
    }

    /// Sends a `PING` RPC to `addr` and returns the contact that responded.
    pub fn ping(&self, addr: SocketAddr) -> DhtFuture<Contact> {
        self.ping_request(None, addr, self.config.request_timeout)
    }

    /// Sends a `PING` RPC to `contact`. Only a response carrying the contact's id is accepted.
    pub fn ping_contact(&self, contact: &Contact) -> DhtFuture<Contact> {
        self.ping_request(Some(contact.id), contact.addr, self.config.request_timeout)
    }

    /// Finds the contacts closest to `target`.
    pub fn find_node(&self, target: Key) -> DhtFuture<LookupResult> {
        self.lookups.lookup(self, target, LookupKind::FindNode)
    }

    /// Finds the values stored under `target`.
    pub fn find_value(&self, target: Key) -> DhtFuture<LookupResult> {
        self.lookups.lookup(self, target, LookupKind::FindValue)
    }

    /// Gets the values stored under `value_id`, from the local store if present and from the
    /// network otherwise.
    pub fn get(&self, value_id: Key) -> DhtFuture<Vec<StoredValue>> {
        let local = self.storage.get(&value_id);
        if !local.is_empty() {
            return DhtFuture::completed(Ok(local));
        }
        self.find_value(value_id).map(|result| result.values)
    }

    /// Asks `contact` directly for the values stored under `value_id`, leaving out the values
    /// published by the originators in `excluded`.
    pub fn get_value(
        &self,
        contact: &Contact,
        value_id: Key,
        excluded: Vec<Key>,
    ) -> DhtFuture<Vec<StoredValue>> {
        store::get_value(self, contact, value_id, excluded)
    }

    /// Stores `values` on the contacts closest to their id. All values must share one id.
    pub fn store(&self, values: Vec<StoredValue>) -> DhtFuture<StoreResult> {
        store::store(self, values)
    }

    /// Publishes `payload` under `value_id` with the local node as originator.
    pub fn put(&self, value_id: Key, payload: Vec<u8>) -> DhtFuture<StoreResult> {
        let value = StoredValue::new(value_id, self.local_id(), payload);
        self.storage.put(value.clone());
        self.store(vec![value])
    }

    /// Bootstraps from the node listening on `addr`.
    pub fn bootstrap(&self, addr: SocketAddr) -> DhtFuture<BootstrapResult> {
        self.bootstrapper.bootstrap(self, Seed::Addr(addr))
    }

    /// Bootstraps from a known contact.
    pub fn bootstrap_from(&self, contact: Contact) -> DhtFuture<BootstrapResult> {
        self.bootstrapper.bootstrap(self, Seed::Contact(contact))
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapper.is_bootstrapped()
    }

    /// Cancels a running bootstrap, if any.
    pub fn stop_bootstrap(&self) {
        self.bootstrapper.stop();
    }

    pub fn is_bootstrapping(&self) -> bool {
        self.bootstrapper.is_bootstrapping()
    }

    /// Replaces the local id with a fresh random one and rebuilds the routing table around it.
    pub fn change_local_id(&self) -> Key {
        let local = {
            let mut local = self.local.write();
            local.id = Key::rand();
            local.clone()
        };
        info!("{} - Changed local id to {:?}", local.addr, local.id);
        self.routing_table.write().rebuild(local.clone());
        local.id
    }

    /// Advances the local instance id. Contacts that see the new instance id offer this node the
    /// values it should hold again, so call this after losing the local values.
    pub fn next_instance_id(&self) -> u8 {
        let mut local = self.local.write();
        local.instance_id = local.instance_id.wrapping_add(1);
        info!("{} - Instance id is now {}", local.addr, local.instance_id);
        local.instance_id
    }

    /// Returns the contact describing the local node.
    pub fn contact(&self) -> Contact {
        self.local.read().clone()
    }

    pub fn local_id(&self) -> Key {
        self.local.read().id
    }

    pub fn addr(&self) -> SocketAddr {
        self.local.read().addr
    }

    /// Returns the contacts in the routing table.
    pub fn contacts(&self) -> Vec<Contact> {
        self.routing_table.read().contacts()
    }

    /// Returns the prefix, depth and number of contacts of every routing bucket.
    pub fn buckets(&self) -> Vec<(Key, usize, usize)> {
        self.routing_table.read().buckets()
    }

    /// Returns the number of requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.dispatcher.len()
    }

    /// Returns the number of lookups currently running.
    pub fn running_lookups(&self) -> usize {
        self.lookups.in_flight()
    }

    pub fn stats(&self) -> &DhtStats {
        &self.stats
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Acquire)
    }

    /// Kills the current node and all active threads.
    pub fn kill(&self) {
        if !self.is_active.swap(false, Ordering::AcqRel) {
            return;
        }
        self.transport.close();
        self.bootstrapper.stop();
        self.lookups.cancel_all();
        self.dispatcher.cancel_all();
        self.pool.shutdown();
        self.lookup_pool.shutdown();
        info!("{} - Killed node", self.addr());
    }
}

/// Waits for `child` on behalf of the task owning `parent`, until `deadline` at the latest.
///
/// `child` is cancelled along with `parent`, and cancelled if it is still running when the wait
/// ends.
pub(crate) fn wait_for<T, U>(
    parent: &DhtFuture<U>,
    child: &DhtFuture<T>,
    deadline: Instant,
) -> Result<T, DhtError>
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
{
    parent.add_child(child.clone());
    let now = Instant::now();
    let result = if now < deadline {
        child.get_timeout(deadline - now)
    } else {
        Err(DhtError::Timeout)
    };
    if !child.is_done() {
        child.cancel();
    }
    if parent.is_cancelled() {
        return Err(DhtError::Cancelled);
    }
    result
}

/// Returns the earlier of `deadline` and `timeout` from now.
pub(crate) fn deadline_within(deadline: Instant, timeout: Duration) -> Instant {
    cmp::min(deadline, Instant::now() + timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::SecurityToken;
    use crate::testing::LocalNetwork;
    use std::collections::HashSet;

    #[test]
    fn test_ping() {
        let network = LocalNetwork::new();
        let a = network.spawn(1000, DhtConfig::for_testing());
        let b = network.spawn(1001, DhtConfig::for_testing());

        let contact = a.ping(b.addr()).get().unwrap();
        assert_eq!(contact.id, b.local_id());
        assert!(a.contacts().iter().any(|c| c.id == b.local_id() && c.is_alive()));
        assert!(b.contacts().iter().any(|c| c.id == a.local_id() && c.is_alive()));
    }

    #[test]
    fn test_ping_unknown_address_times_out() {
        let network = LocalNetwork::new();
        let a = network.spawn(1000, DhtConfig::for_testing());
        let dead = SocketAddr::from(([127, 0, 0, 1], 1999));
        assert_eq!(a.ping(dead).get(), Err(DhtError::Timeout));
        assert_eq!(a.pending_requests(), 0);
    }

    #[test]
    fn test_ping_contact_checks_id() {
        let network = LocalNetwork::new();
        let a = network.spawn(1000, DhtConfig::for_testing());
        let b = network.spawn(1001, DhtConfig::for_testing());
        let impostor = Contact::new(Key::rand(), b.addr());
        assert_eq!(a.ping_contact(&impostor).get(), Err(DhtError::Timeout));
        assert_eq!(a.stats().responses_dropped.get(), 1);
    }

    #[test]
    fn test_find_node_over_network() {
        let network = LocalNetwork::new();
        let seed = network.spawn(2000, DhtConfig::for_testing());
        let nodes: Vec<Node> = (1..20)
            .map(|i| network.spawn(2000 + i, DhtConfig::for_testing()))
            .collect();
        for node in &nodes {
            node.ping(seed.addr()).get().unwrap();
        }

        let target = nodes[7].local_id();
        let result = nodes[3].find_node(target).get().unwrap();
        assert_eq!(result.contacts[0].0.id, target);
        for pair in result.contacts.windows(2) {
            assert!(target.is_closer(&pair[0].0.id, &pair[1].0.id));
        }
        assert!(result.hops >= 1);
        assert_eq!(nodes[3].running_lookups(), 0);
    }

    #[test]
    fn test_find_node_without_contacts_fails() {
        let network = LocalNetwork::new();
        let a = network.spawn(1000, DhtConfig::for_testing());
        assert_eq!(a.find_node(Key::rand()).get().unwrap_err(), DhtError::NoContacts);
        assert_eq!(a.running_lookups(), 0);
    }

    #[test]
    fn test_concurrent_lookups_share_one_run() {
        let network = LocalNetwork::new();
        let a = network.spawn(1000, DhtConfig::for_testing());
        let b = network.spawn(1001, DhtConfig::for_testing());
        a.ping(b.addr()).get().unwrap();
        network.set_latency(Some(Duration::from_millis(50)));

        let target = Key::rand();
        let first = a.find_node(target);
        let second = a.find_node(target);
        assert!(first.ptr_eq(&second));

        let first = first.get().unwrap();
        let second = second.get().unwrap();
        assert_eq!(first.contacts.len(), second.contacts.len());
        assert_eq!(a.stats().lookups_started.get(), 1);
        assert_eq!(a.stats().lookups_joined.get(), 1);
        assert_eq!(a.running_lookups(), 0);

        // a different kind for the same target is a separate lookup
        a.find_value(target).get().unwrap();
        assert_eq!(a.stats().lookups_started.get(), 2);
    }

    #[test]
    fn test_lookup_survives_dead_contacts() {
        let network = LocalNetwork::new();
        let a = network.spawn(1000, DhtConfig::for_testing());
        let b = network.spawn(1001, DhtConfig::for_testing());
        a.ping(b.addr()).get().unwrap();
        for port in 1100..1105 {
            a.admit(Contact::new(Key::rand(), SocketAddr::from(([127, 0, 0, 1], port))));
        }

        let result = a.find_node(Key::rand()).get().unwrap();
        assert_eq!(result.timeouts, 5);
        assert_eq!(result.route_table_timeouts, 5);
        assert_eq!(result.contacts.len(), 1);
        assert_eq!(result.contacts[0].0.id, b.local_id());
    }

    #[test]
    fn test_find_request_includes_colliding_requester_id() {
        let network = LocalNetwork::new();
        let a = network.spawn(1000, DhtConfig::for_testing());
        let b = network.spawn(1001, DhtConfig::for_testing());
        a.ping(b.addr()).get().unwrap();
        let response = b
            .request(
                Some(a.local_id()),
                a.addr(),
                Body::FindNodeRequest { target: b.local_id() },
                b.config.request_timeout,
            )
            .get()
            .unwrap();
        match response.body {
            Body::FindNodeResponse { contacts, .. } => {
                let ids: HashSet<Key> = contacts.iter().map(|c| c.id).collect();
                assert!(ids.contains(&b.local_id()));
            },
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_store_with_bad_or_missing_token_is_rejected() {
        let network = LocalNetwork::new();
        let a = network.spawn(1000, DhtConfig::for_testing());
        let b = network.spawn(1001, DhtConfig::for_testing());
        let value = StoredValue::new(Key::rand(), a.local_id(), b"hello".to_vec());

        let statuses = |token: Option<SecurityToken>| {
            let response = a
                .request(
                    Some(b.local_id()),
                    b.addr(),
                    Body::StoreRequest {
                        token,
                        values: vec![value.clone()],
                    },
                    a.config.request_timeout,
                )
                .get()
                .unwrap();
            match response.body {
                Body::StoreResponse { statuses } => statuses,
                other => panic!("unexpected body {:?}", other),
            }
        };

        assert_eq!(statuses(None), vec![StoreStatus::NoToken]);
        assert_eq!(statuses(Some(SecurityToken(vec![0; 16]))), vec![StoreStatus::BadToken]);
        assert!(b.storage.get(&value.value_id).is_empty());

        // a token outlives one rotation but not two
        let token = b.security.issue(&a.contact());
        b.security.rotate();
        b.security.rotate();
        assert_eq!(statuses(Some(token)), vec![StoreStatus::BadToken]);
        assert!(b.storage.get(&value.value_id).is_empty());

        let token = b.security.issue(&a.contact());
        b.security.rotate();
        assert_eq!(statuses(Some(token)), vec![StoreStatus::Stored]);
        assert_eq!(b.storage.get(&value.value_id), vec![value.clone()]);
    }

    #[test]
    fn test_find_value_request_with_several_targets() {
        let network = LocalNetwork::new();
        let a = network.spawn(1000, DhtConfig::for_testing());
        let b = network.spawn(1001, DhtConfig::for_testing());
        let first = StoredValue::new(Key::rand(), a.local_id(), vec![1]);
        let second = StoredValue::new(Key::rand(), a.local_id(), vec![2]);
        b.storage.put(first.clone());
        b.storage.put(second.clone());

        let find = |targets: Vec<Key>| {
            let response = a
                .request(
                    Some(b.local_id()),
                    b.addr(),
                    Body::FindValueRequest {
                        targets,
                        excluded: Vec::new(),
                    },
                    a.config.request_timeout,
                )
                .get()
                .unwrap();
            match response.body {
                Body::FindValueResponse { contacts, values, .. } => (contacts, values),
                other => panic!("unexpected body {:?}", other),
            }
        };

        let (contacts, mut values) = find(vec![first.value_id, Key::rand(), second.value_id]);
        values.sort_by_key(|value| value.payload.clone());
        assert_eq!(values, vec![first, second]);
        assert!(contacts.is_empty());

        let (contacts, values) = find(vec![Key::rand()]);
        assert!(values.is_empty());
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].id, a.local_id());
    }

    #[test]
    fn test_next_instance_id_is_sent_to_contacts() {
        let network = LocalNetwork::new();
        let a = network.spawn(1000, DhtConfig::for_testing());
        let b = network.spawn(1001, DhtConfig::for_testing());
        assert_eq!(a.next_instance_id(), 1);
        a.ping(b.addr()).get().unwrap();
        let known = b.contacts().into_iter().find(|c| c.id == a.local_id()).unwrap();
        assert_eq!(known.instance_id, 1);
    }

    #[test]
    fn test_change_local_id_keeps_contacts() {
        let network = LocalNetwork::new();
        let a = network.spawn(1000, DhtConfig::for_testing());
        let b = network.spawn(1001, DhtConfig::for_testing());
        a.ping(b.addr()).get().unwrap();

        let old_id = a.local_id();
        let new_id = a.change_local_id();
        assert_ne!(old_id, new_id);
        assert_eq!(a.contact().id, new_id);
        assert!(a.contacts().iter().any(|c| c.id == b.local_id()));
    }

    #[test]
    fn test_kill_stops_requests() {
        let network = LocalNetwork::new();
        let a = network.spawn(1000, DhtConfig::for_testing());
        let b = network.spawn(1001, DhtConfig::for_testing());
        a.kill();
        assert!(!a.is_active());
        assert_eq!(a.ping(b.addr()).get(), Err(DhtError::Shutdown));
        assert_eq!(b.ping(a.addr()).get(), Err(DhtError::Timeout));
    }
}
