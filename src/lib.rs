#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;

mod config;
mod error;
mod executor;
mod future;
mod key;
mod node;
mod protocol;
mod routing;
mod security;
mod stats;
mod storage;

#[cfg(test)]
mod testing;

pub use self::config::DhtConfig;
pub use self::error::DhtError;
pub use self::future::{Cancel, DhtFuture, FutureState};
pub use self::key::Key;
pub use self::node::bootstrap::BootstrapResult;
pub use self::node::contact::{Contact, ContactState};
pub use self::node::lookup::{LookupKind, LookupResult};
pub use self::node::store::{StoreResult, StoreStatus};
pub use self::node::Node;
pub use self::protocol::{decode, encode, Body, Header, Message, OpCode, Transport, UdpTransport};
pub use self::routing::{Admission, RoutingTable};
pub use self::security::{SecurityToken, SecurityTokenProvider, TokenSecrets};
pub use self::stats::DhtStats;
pub use self::storage::{Storage, StoredValue, ValueStore};

/// The number of bytes in a key.
const KEY_LENGTH: usize = 20;

/// The number of bits in a key.
const KEY_BITS: usize = KEY_LENGTH * 8;

/// The maximum length of the message in bytes.
const MESSAGE_LENGTH: usize = 8196;

/// The maximum number of entries in a k-bucket.
const REPLICATION_PARAM: usize = 20;

/// The maximum number of active RPCs during a lookup.
const CONCURRENCY_PARAM: usize = 4;

/// Request timeout time in milliseconds
const REQUEST_TIMEOUT: u64 = 5000;

/// Key-value pair expiration time in seconds
const KEY_EXPIRATION: u64 = 3600;

/// Bucket refresh interval in seconds
const BUCKET_REFRESH_INTERVAL: u64 = 3600;
