use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::error::DhtError;
use crate::future::DhtFuture;
use crate::key::Key;
use crate::node::contact::Contact;
use crate::node::{wait_for, Node};
use crate::protocol::{Body, Message};
use crate::storage::StoredValue;

/// Status of a `STORE` at one contact.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreStatus {
    Stored,
    /// The request carried no security token.
    NoToken,
    /// The security token was forged or has expired.
    BadToken,
    /// The contact's value store refused the value.
    Rejected,
    /// The contact did not respond.
    Timeout,
}

/// The outcome of a store operation.
#[derive(Clone, Debug)]
pub struct StoreResult {
    pub value_id: Key,
    pub statuses: Vec<(Contact, StoreStatus)>,
    /// Whether the local node is among the closest nodes and kept a copy.
    pub stored_locally: bool,
}

impl StoreResult {
    /// Returns the number of remote contacts that stored the values.
    pub fn stored_count(&self) -> usize {
        self.statuses.iter().filter(|(_, status)| *status == StoreStatus::Stored).count()
    }

    /// Returns the remote contacts that stored the values.
    pub fn stored_on(&self) -> Vec<Contact> {
        self.statuses
            .iter()
            .filter(|(_, status)| *status == StoreStatus::Stored)
            .map(|(contact, _)| contact.clone())
            .collect()
    }
}

/// Stores `values` on the `k` contacts closest to their id, using the security tokens collected
/// by a node lookup.
///
/// # Panics
///
/// Panics if `values` is empty or if the values do not share one value id.
pub(crate) fn store(node: &Node, values: Vec<StoredValue>) -> DhtFuture<StoreResult> {
    assert!(!values.is_empty(), "store called without values");
    let value_id = values[0].value_id;
    assert!(
        values.iter().all(|value| value.value_id == value_id),
        "all values of a store must share one value id"
    );

    let pool = Arc::clone(&node.pool);
    let node = node.clone();
    pool.submit(move |handle| run_store(&node, handle, value_id, values))
}

fn run_store(
    node: &Node,
    handle: &DhtFuture<StoreResult>,
    value_id: Key,
    values: Vec<StoredValue>,
) -> Result<StoreResult, DhtError> {
    let config = &node.config;
    let deadline = Instant::now() + config.lookup_timeout + config.request_timeout;
    let lookup = wait_for(handle, &node.find_node(value_id), deadline)?;

    // keep a copy if fewer than k responders are closer than we are
    let local_id = node.local_id();
    let closer = lookup
        .contacts
        .iter()
        .filter(|(contact, _)| value_id.is_closer(&contact.id, &local_id))
        .count();
    let stored_locally = closer < config.k
        && values
            .iter()
            .map(|value| node.storage.put(value.clone()))
            .fold(true, |stored, put| stored && put);

    let mut requests = Vec::new();
    for (contact, token) in lookup.contacts.into_iter().take(config.k) {
        let body = Body::StoreRequest {
            token: Some(token),
            values: values.clone(),
        };
        node.stats.stores_sent.inc();
        let request = node.request(Some(contact.id), contact.addr, body, config.request_timeout);
        requests.push((contact, request));
    }

    let deadline = Instant::now() + config.request_timeout * 2;
    let mut statuses = Vec::with_capacity(requests.len());
    for (contact, request) in requests {
        let status = match wait_for(handle, &request, deadline) {
            Ok(message) => status_of(&message),
            Err(DhtError::Cancelled) => return Err(DhtError::Cancelled),
            Err(_) => StoreStatus::Timeout,
        };
        if status == StoreStatus::Stored {
            node.stats.stores_accepted.inc();
        } else {
            debug!("{} - {:?} did not store {:?}: {:?}", node.addr(), contact, value_id, status);
            node.stats.stores_rejected.inc();
        }
        statuses.push((contact, status));
    }

    let result = StoreResult {
        value_id,
        statuses,
        stored_locally,
    };
    if result.stored_count() == 0 && !result.stored_locally {
        return Err(DhtError::StoreFailed(format!("no contact stored {:?}", value_id)));
    }
    info!(
        "{} - Stored {:?} on {} contacts",
        node.addr(),
        value_id,
        result.stored_count()
    );
    Ok(result)
}

/// Collapses the per-value statuses of a `STORE` response into one status for the contact.
fn status_of(message: &Message) -> StoreStatus {
    match message.body {
        Body::StoreResponse { ref statuses } if statuses.is_empty() => StoreStatus::Rejected,
        Body::StoreResponse { ref statuses } => statuses
            .iter()
            .cloned()
            .find(|status| *status != StoreStatus::Stored)
            .unwrap_or(StoreStatus::Stored),
        _ => StoreStatus::Rejected,
    }
}

/// Hands the values held locally to `contact`, a node we just heard from for the first time or
/// after it restarted, if it is now among the `k` closest nodes to them and we are the closest
/// holder. With `drop_furthest_values` set, values published by other nodes are dropped once `k`
/// closer contacts are known.
pub(crate) fn forward(node: &Node, contact: &Contact) {
    let local_id = node.local_id();
    let k = node.config.k;
    let mut by_id: HashMap<Key, Vec<StoredValue>> = HashMap::new();
    for value in node.storage.values() {
        by_id.entry(value.value_id).or_insert_with(Vec::new).push(value);
    }

    for (value_id, values) in by_id {
        let closest = node.routing_table.read().select(&value_id, k);
        let closer = closest
            .iter()
            .filter(|known| value_id.is_closer(&known.id, &local_id))
            .count();

        if node.config.drop_furthest_values && closer >= k {
            for value in values.iter().filter(|value| value.originator != local_id) {
                if node.storage.remove(&value_id, &value.originator) {
                    debug!("{} - Dropped {:?}, {} nodes are closer", node.addr(), value_id, closer);
                    node.stats.values_dropped.inc();
                }
            }
            continue;
        }

        let rank = match closest.iter().position(|known| known.id == contact.id) {
            Some(rank) if value_id.is_closer(&local_id, &contact.id) => rank + 1,
            Some(rank) => rank,
            None => continue,
        };
        let others_closer = closest
            .iter()
            .filter(|known| known.id != contact.id && value_id.is_closer(&known.id, &local_id))
            .count();
        if rank < k && others_closer == 0 {
            let node = node.clone();
            let contact = contact.clone();
            let pool = Arc::clone(&node.pool);
            pool.submit(move |handle| run_forward(&node, handle, &contact, value_id, values));
        }
    }
}

fn run_forward(
    node: &Node,
    handle: &DhtFuture<StoreStatus>,
    contact: &Contact,
    value_id: Key,
    values: Vec<StoredValue>,
) -> Result<StoreStatus, DhtError> {
    let config = &node.config;
    let deadline = Instant::now() + config.request_timeout * 2;
    let body = Body::FindNodeRequest { target: value_id };
    let request = node.request(Some(contact.id), contact.addr, body, config.request_timeout);
    let token = match wait_for(handle, &request, deadline)?.body {
        Body::FindNodeResponse { token, .. } => token,
        other => {
            return Err(DhtError::Decode(format!(
                "expected a node response, got {:?}",
                other.opcode()
            )))
        },
    };

    let count = values.len() as u64;
    let body = Body::StoreRequest {
        token: Some(token),
        values,
    };
    let request = node.request(Some(contact.id), contact.addr, body, config.request_timeout);
    let status = status_of(&wait_for(handle, &request, deadline)?);
    if status == StoreStatus::Stored {
        info!("{} - Forwarded {:?} to {:?}", node.addr(), value_id, contact);
        node.stats.values_forwarded.add(count);
    } else {
        debug!("{} - {:?} refused forwarded {:?}: {:?}", node.addr(), contact, value_id, status);
    }
    Ok(status)
}

/// Asks `contact` directly for the values stored under `value_id`.
pub(crate) fn get_value(
    node: &Node,
    contact: &Contact,
    value_id: Key,
    excluded: Vec<Key>,
) -> DhtFuture<Vec<StoredValue>> {
    let body = Body::FindValueRequest {
        targets: vec![value_id],
        excluded,
    };
    node.request(Some(contact.id), contact.addr, body, node.config.request_timeout)
        .and_then(|message| match message.body {
            Body::FindValueResponse { values, .. } => Ok(values),
            other => Err(DhtError::Decode(format!(
                "expected a value response, got {:?}",
                other.opcode()
            ))),
        })
}
