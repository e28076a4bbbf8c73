use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use time::SteadyTime;

use crate::error::DhtError;
use crate::future::DhtFuture;
use crate::key::Key;
use crate::node::contact::Contact;
use crate::node::Node;
use crate::protocol::{Body, Message};
use crate::security::SecurityToken;
use crate::storage::StoredValue;

/// What a lookup is looking for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LookupKind {
    FindNode,
    FindValue,
}

/// The outcome of a lookup.
#[derive(Clone, Debug)]
pub struct LookupResult {
    pub target: Key,
    pub kind: LookupKind,
    /// The closest contacts that responded, in ascending distance to the target, each with the
    /// security token it issued.
    pub contacts: Vec<(Contact, SecurityToken)>,
    /// Values found by a `FindValue` lookup.
    pub values: Vec<StoredValue>,
    pub value_holder: Option<Contact>,
    /// Contacts that were asked for the value and did not have it.
    pub contacts_without_value: Vec<Contact>,
    /// Contacts returned by other nodes that carry the local id at another address.
    pub collisions: Vec<Contact>,
    pub hops: usize,
    pub timeouts: usize,
    /// Timeouts of contacts that came from the local routing table.
    pub route_table_timeouts: usize,
    pub elapsed: time::Duration,
}

impl LookupResult {
    pub fn found_value(&self) -> bool {
        !self.values.is_empty()
    }
}

type LookupKey = (Key, LookupKind);

/// Runs lookups on the node's lookup pool. Concurrent lookups for the same target and kind share
/// one underlying run.
#[derive(Default)]
pub struct LookupManager {
    in_flight: Arc<Mutex<HashMap<LookupKey, DhtFuture<LookupResult>>>>,
}

impl LookupManager {
    pub fn new() -> Self {
        LookupManager::default()
    }

    /// Looks up `target` starting from the local routing table.
    pub fn lookup(&self, node: &Node, target: Key, kind: LookupKind) -> DhtFuture<LookupResult> {
        let key = (target, kind);
        let future = {
            let mut in_flight = self.in_flight.lock();
            if let Some(future) = in_flight.get(&key) {
                debug!("{} - Joining lookup for {:?}", node.addr(), target);
                node.stats.lookups_joined.inc();
                return future.clone();
            }
            let future = Self::submit(node, target, kind, None);
            in_flight.insert(key, future.clone());
            future
        };

        let in_flight = Arc::clone(&self.in_flight);
        let entry = future.clone();
        future.add_listener(move |_| {
            let mut in_flight = in_flight.lock();
            if in_flight.get(&key).map_or(false, |future| future.ptr_eq(&entry)) {
                in_flight.remove(&key);
            }
        });
        future
    }

    /// Looks up `target` starting from `seeds` instead of the routing table. Seeded lookups are
    /// never shared.
    pub fn lookup_from(
        &self,
        node: &Node,
        target: Key,
        kind: LookupKind,
        seeds: Vec<Contact>,
    ) -> DhtFuture<LookupResult> {
        Self::submit(node, target, kind, Some(seeds))
    }

    fn submit(
        node: &Node,
        target: Key,
        kind: LookupKind,
        seeds: Option<Vec<Contact>>,
    ) -> DhtFuture<LookupResult> {
        node.stats.lookups_started.inc();
        let pool = Arc::clone(&node.lookup_pool);
        let node = node.clone();
        pool.submit(move |handle| Lookup::new(node, target, kind).run(handle, seeds))
    }

    /// Returns the number of lookups currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Returns the futures of the lookups currently running.
    pub(crate) fn running(&self) -> Vec<DhtFuture<LookupResult>> {
        self.in_flight.lock().values().cloned().collect()
    }

    pub fn cancel_all(&self) {
        for future in self.running() {
            future.cancel();
        }
    }
}

/// The state of one iterative lookup. Owned by a single worker, so responses are processed one
/// at a time.
struct Lookup {
    node: Node,
    target: Key,
    kind: LookupKind,
    local: Contact,
    /// Contacts not yet queried, keyed by distance to the target.
    query: BTreeMap<Key, Contact>,
    /// Contacts that responded, keyed by distance to the target.
    responses: BTreeMap<Key, (Contact, SecurityToken)>,
    /// Hop at which every contact seen so far was learned.
    history: HashMap<Key, usize>,
    /// Contacts that were taken from the routing table.
    init: HashSet<Key>,
    collisions: Vec<Contact>,
    values: Vec<StoredValue>,
    value_holder: Option<Contact>,
    contacts_without_value: Vec<Contact>,
    hops: usize,
    timeouts: usize,
    route_table_timeouts: usize,
    start_time: SteadyTime,
}

impl Lookup {
    fn new(node: Node, target: Key, kind: LookupKind) -> Self {
        let local = node.contact();
        Lookup {
            node,
            target,
            kind,
            local,
            query: BTreeMap::new(),
            responses: BTreeMap::new(),
            history: HashMap::new(),
            init: HashSet::new(),
            collisions: Vec::new(),
            values: Vec::new(),
            value_holder: None,
            contacts_without_value: Vec::new(),
            hops: 0,
            timeouts: 0,
            route_table_timeouts: 0,
            start_time: SteadyTime::now(),
        }
    }

    fn run(
        mut self,
        handle: &DhtFuture<LookupResult>,
        seeds: Option<Vec<Contact>>,
    ) -> Result<LookupResult, DhtError> {
        let config = Arc::clone(&self.node.config);
        let from_table = seeds.is_none();
        let seeds = match seeds {
            Some(seeds) => seeds,
            None => self.node.routing_table.read().select(&self.target, config.k),
        };
        for contact in seeds {
            if contact.id == self.local.id {
                continue;
            }
            if from_table {
                self.init.insert(contact.id);
            }
            self.history.insert(contact.id, 0);
            self.query.insert(contact.id.distance(&self.target), contact);
        }
        if self.query.is_empty() {
            debug!("{} - No contacts to look up {:?}", self.local.addr, self.target);
            return Err(DhtError::NoContacts);
        }
        debug!(
            "{} - Starting {:?} lookup for {:?} with {} contacts",
            self.local.addr,
            self.kind,
            self.target,
            self.query.len()
        );

        let deadline = Instant::now() + config.lookup_timeout;
        let (tx, rx) = channel::<(Contact, Result<Message, DhtError>)>();
        let mut outstanding: HashMap<Key, DhtFuture<Message>> = HashMap::new();

        loop {
            if handle.is_cancelled() {
                break;
            }
            while outstanding.len() < config.alpha {
                let contact = match self.next_contact(config.k, config.exhaustive_lookups) {
                    Some(contact) => contact,
                    None => break,
                };
                let body = match self.kind {
                    LookupKind::FindNode => Body::FindNodeRequest { target: self.target },
                    LookupKind::FindValue => Body::FindValueRequest {
                        targets: vec![self.target],
                        excluded: Vec::new(),
                    },
                };
                trace!("{} - Querying {:?}", self.local.addr, contact);
                let request =
                    self.node.request(Some(contact.id), contact.addr, body, config.request_timeout);
                handle.add_child(request.clone());
                outstanding.insert(contact.id, request.clone());
                let tx = tx.clone();
                request.add_listener(move |result| {
                    let _ = tx.send((contact, result.clone()));
                });
            }
            if outstanding.is_empty() {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                warn!("{} - Lookup for {:?} timed out", self.local.addr, self.target);
                break;
            }
            match rx.recv_timeout(deadline - now) {
                Ok((contact, result)) => {
                    outstanding.remove(&contact.id);
                    if self.handle_result(contact, result) {
                        break;
                    }
                },
                Err(RecvTimeoutError::Timeout) => {
                    warn!("{} - Lookup for {:?} timed out", self.local.addr, self.target);
                    break;
                },
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        for request in outstanding.values() {
            request.cancel();
        }
        if handle.is_cancelled() {
            return Err(DhtError::Cancelled);
        }

        self.node.stats.lookup_hops.add(self.hops as u64);
        let addr = self.local.addr;
        let result = self.into_result(config.k);
        debug!(
            "{} - {:?} lookup for {:?} finished: {} contacts, {} hops, {} timeouts",
            addr,
            result.kind,
            result.target,
            result.contacts.len(),
            result.hops,
            result.timeouts
        );
        Ok(result)
    }

    /// Pops the closest unqueried contact if querying it can still improve the result.
    fn next_contact(&mut self, k: usize, exhaustive: bool) -> Option<Contact> {
        let distance = *self.query.keys().next()?;
        if !exhaustive && self.responses.len() >= k {
            let furthest = self.responses.keys().nth(k - 1)?;
            if distance >= *furthest {
                return None;
            }
        }
        self.query.remove(&distance)
    }

    /// Processes the outcome of one request. Returns `true` if the lookup is finished.
    fn handle_result(&mut self, contact: Contact, result: Result<Message, DhtError>) -> bool {
        let message = match result {
            Ok(message) => message,
            Err(DhtError::Cancelled) => return false,
            Err(err) => {
                debug!("{} - {:?} failed: {}", self.local.addr, contact, err);
                self.timeouts += 1;
                if self.init.contains(&contact.id) {
                    self.route_table_timeouts += 1;
                }
                return false;
            },
        };

        let mut responder = message.header.sender;
        responder.mark_alive();
        let (token, contacts, values) = match message.body {
            Body::FindNodeResponse { token, contacts } => (token, contacts, Vec::new()),
            Body::FindValueResponse {
                token,
                contacts,
                values,
                ..
            } => (token, contacts, values),
            other => {
                warn!(
                    "{} - Unexpected {:?} from {:?} during lookup",
                    self.local.addr,
                    other.opcode(),
                    responder
                );
                return false;
            },
        };

        let hop = self.history.get(&contact.id).cloned().unwrap_or(0) + 1;
        self.hops = self.hops.max(hop);

        if self.kind == LookupKind::FindValue {
            if !values.is_empty() {
                self.values = values;
                self.value_holder = Some(responder);
                return true;
            }
            self.contacts_without_value.push(responder.clone());
        }

        self.responses
            .insert(responder.id.distance(&self.target), (responder, token));

        for found in contacts {
            if found.id == self.local.id {
                if found.addr != self.local.addr {
                    warn!("{} - {:?} collides with the local id", self.local.addr, found);
                    self.collisions.push(found);
                }
                continue;
            }
            if self.history.contains_key(&found.id) {
                continue;
            }
            self.history.insert(found.id, hop);
            self.node.admit(found.clone());
            self.query.insert(found.id.distance(&self.target), found);
        }
        false
    }

    fn into_result(self, k: usize) -> LookupResult {
        LookupResult {
            target: self.target,
            kind: self.kind,
            contacts: self.responses.into_iter().map(|(_, entry)| entry).take(k).collect(),
            values: self.values,
            value_holder: self.value_holder,
            contacts_without_value: self.contacts_without_value,
            collisions: self.collisions,
            hops: self.hops,
            timeouts: self.timeouts,
            route_table_timeouts: self.route_table_timeouts,
            elapsed: SteadyTime::now() - self.start_time,
        }
    }
}
