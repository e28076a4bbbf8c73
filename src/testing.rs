//! An in-memory network for tests. Messages go through the wire codec and are delivered either
//! synchronously on the sending thread or after a fixed latency on a separate thread.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::DhtConfig;
use crate::key::Key;
use crate::node::contact::Contact;
use crate::node::Node;
use crate::protocol::{decode, encode, Message, Transport};
use crate::security::TokenSecrets;
use crate::storage::Storage;

#[derive(Default)]
pub struct LocalNetwork {
    nodes: Mutex<HashMap<SocketAddr, Node>>,
    latency: Mutex<Option<Duration>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(LocalNetwork::default())
    }

    /// Starts a node with a random id listening on `127.0.0.1:port`.
    pub fn spawn(self: &Arc<Self>, port: u16, config: DhtConfig) -> Node {
        self.spawn_with_id(port, Key::rand(), config)
    }

    pub fn spawn_with_id(self: &Arc<Self>, port: u16, id: Key, config: DhtConfig) -> Node {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let transport = LocalTransport {
            network: Arc::downgrade(self),
        };
        let storage = Storage::new(config.value_expiration, config.republish_interval);
        let node = Node::with_collaborators(
            Contact::alive(id, addr),
            config,
            Arc::new(transport),
            Arc::new(storage),
            Arc::new(TokenSecrets::new()),
        );
        self.nodes.lock().insert(addr, node.clone());
        node
    }

    /// Disconnects the node at `addr`. Messages to it are dropped from now on.
    pub fn remove(&self, addr: &SocketAddr) -> Option<Node> {
        self.nodes.lock().remove(addr)
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    fn deliver(&self, addr: SocketAddr, message: Message) {
        let node = match self.nodes.lock().get(&addr) {
            Some(node) => node.clone(),
            None => return,
        };
        let latency = *self.latency.lock();
        match latency {
            Some(latency) => {
                thread::spawn(move || {
                    thread::sleep(latency);
                    node.deliver(message);
                });
            },
            None => node.deliver(message),
        }
    }
}

impl Drop for LocalNetwork {
    fn drop(&mut self) {
        let nodes: Vec<Node> = self.nodes.lock().drain().map(|(_, node)| node).collect();
        for node in nodes {
            node.kill();
        }
    }
}

struct LocalTransport {
    network: Weak<LocalNetwork>,
}

impl Transport for LocalTransport {
    fn send(&self, addr: SocketAddr, message: &Message) -> bool {
        let network = match self.network.upgrade() {
            Some(network) => network,
            None => return false,
        };
        let message = match encode(message).and_then(|buffer| decode(&buffer)) {
            Ok(message) => message,
            Err(err) => {
                warn!("Could not send message to {}: {}", addr, err);
                return false;
            },
        };
        network.deliver(addr, message);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DhtError;

    #[test]
    fn test_removed_node_is_unreachable() {
        let network = LocalNetwork::new();
        let a = network.spawn(1000, DhtConfig::for_testing());
        let b = network.spawn(1001, DhtConfig::for_testing());
        a.ping(b.addr()).get().unwrap();

        assert!(network.remove(&b.addr()).is_some());
        assert!(network.remove(&b.addr()).is_none());
        assert_eq!(a.ping(b.addr()).get(), Err(DhtError::Timeout));
    }

    #[test]
    fn test_dropping_network_kills_nodes() {
        let network = LocalNetwork::new();
        let a = network.spawn(1000, DhtConfig::for_testing());
        drop(network);
        assert!(!a.is_active());
    }
}
