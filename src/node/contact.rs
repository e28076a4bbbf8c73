use std::fmt::{Debug, Formatter, Result};
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

use time::SteadyTime;

use crate::key::Key;

/// Vendor tag carried by contacts created by this crate.
pub const VENDOR: u32 = u32::from_be_bytes(*b"KDHT");

/// Protocol version carried by contacts created by this crate.
pub const VERSION: u16 = 1;

/// Liveness of a contact as far as the local node knows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContactState {
    Alive,
    Unknown,
    Dead,
}

impl Default for ContactState {
    fn default() -> Self {
        ContactState::Unknown
    }
}

/// A remote peer.
///
/// Contacts are compared and hashed by id only. The liveness fields are local bookkeeping and are
/// never sent over the wire, so every contact learned from a message starts out `Unknown`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: Key,
    pub addr: SocketAddr,
    pub vendor: u32,
    pub version: u16,
    pub instance_id: u8,
    pub firewalled: bool,
    #[serde(skip)]
    pub state: ContactState,
    #[serde(skip)]
    pub failures: u32,
    #[serde(skip)]
    pub last_seen: Option<SteadyTime>,
}

impl Contact {
    /// Constructs a contact in the `Unknown` state.
    pub fn new(id: Key, addr: SocketAddr) -> Self {
        Contact {
            id,
            addr,
            vendor: VENDOR,
            version: VERSION,
            instance_id: 0,
            firewalled: false,
            state: ContactState::Unknown,
            failures: 0,
            last_seen: None,
        }
    }

    /// Constructs a contact we have just heard from.
    pub fn alive(id: Key, addr: SocketAddr) -> Self {
        let mut ret = Contact::new(id, addr);
        ret.mark_alive();
        ret
    }

    pub fn is_alive(&self) -> bool {
        self.state == ContactState::Alive
    }

    pub fn is_dead(&self) -> bool {
        self.state == ContactState::Dead
    }

    /// Returns `true` if this contact has responded at least once.
    pub fn has_been_alive(&self) -> bool {
        self.last_seen.is_some()
    }

    pub fn mark_alive(&mut self) {
        self.state = ContactState::Alive;
        self.failures = 0;
        self.last_seen = Some(SteadyTime::now());
    }

    /// Copies the wire-level fields of a fresher descriptor of the same peer.
    pub(crate) fn merge(&mut self, other: &Contact) {
        self.addr = other.addr;
        self.vendor = other.vendor;
        self.version = other.version;
        self.instance_id = other.instance_id;
        self.firewalled = other.firewalled;
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Contact) -> bool {
        self.id == other.id
    }
}

impl Eq for Contact {}

impl Hash for Contact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Debug for Contact {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "{} - {:?} ({:?})", self.addr, self.id, self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_equality_ignores_address() {
        let id = Key::rand();
        let a = Contact::new(id, addr(1000));
        let b = Contact::alive(id, addr(2000));
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_liveness_is_not_serialized() {
        let contact = Contact::alive(Key::rand(), addr(1000));
        let bytes = bincode::serialize(&contact).unwrap();
        let decoded: Contact = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded.id, contact.id);
        assert_eq!(decoded.addr, contact.addr);
        assert_eq!(decoded.state, ContactState::Unknown);
        assert!(!decoded.has_been_alive());
    }

    #[test]
    fn test_mark_alive_resets_failures() {
        let mut contact = Contact::new(Key::rand(), addr(1000));
        contact.failures = 3;
        contact.mark_alive();
        assert!(contact.is_alive());
        assert_eq!(contact.failures, 0);
        assert!(contact.has_been_alive());
    }
}
