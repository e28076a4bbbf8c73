use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use time::{Duration, SteadyTime};

use crate::error::DhtError;
use crate::future::DhtFuture;
use crate::key::Key;
use crate::protocol::Message;

struct Pending {
    target_id: Option<Key>,
    addr: SocketAddr,
    deadline: SteadyTime,
    future: DhtFuture<Message>,
}

type PendingMap = Mutex<HashMap<Key, Pending>>;

/// Outgoing requests awaiting a response, keyed by correlation id.
///
/// Futures are always completed outside of the lock, so listeners may issue new requests.
#[derive(Clone, Default)]
pub struct Dispatcher {
    pending: Arc<PendingMap>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher::default()
    }

    /// Registers `future` as waiting for a response from `addr` and returns the correlation id to
    /// send the request with. The entry is removed as soon as the future is done, including when
    /// a caller cancels it.
    pub fn register(
        &self,
        target_id: Option<Key>,
        addr: SocketAddr,
        timeout: std::time::Duration,
        future: &DhtFuture<Message>,
    ) -> Key {
        let id = {
            let mut pending = self.pending.lock();
            let mut id = Key::rand();
            while pending.contains_key(&id) {
                id = Key::rand();
            }
            pending.insert(
                id,
                Pending {
                    target_id,
                    addr,
                    deadline: SteadyTime::now() + Duration::milliseconds(timeout.as_millis() as i64),
                    future: future.clone(),
                },
            );
            id
        };

        let pending = Arc::downgrade(&self.pending);
        let entry = future.clone();
        future.add_listener(move |_| Self::remove(&pending, &id, &entry));
        id
    }

    fn remove(pending: &Weak<PendingMap>, id: &Key, future: &DhtFuture<Message>) {
        if let Some(pending) = pending.upgrade() {
            let mut pending = pending.lock();
            if pending.get(id).map_or(false, |entry| entry.future.ptr_eq(future)) {
                pending.remove(id);
            }
        }
    }

    /// Completes the request `message` responds to. Returns `false` if no request matches, or if
    /// the response comes from a node other than the one the request was addressed to.
    pub fn complete(&self, message: Message) -> bool {
        let entry = {
            let mut pending = self.pending.lock();
            let id = message.header.id;
            match pending.get(&id) {
                Some(entry) => {
                    if let Some(target_id) = entry.target_id {
                        if target_id != message.header.sender.id {
                            warn!(
                                "Response from {} carries id {:?}, expected {:?}",
                                entry.addr, message.header.sender.id, target_id
                            );
                            return false;
                        }
                    }
                },
                None => return false,
            }
            pending.remove(&id)
        };
        match entry {
            Some(entry) => entry.future.complete(Ok(message)),
            None => false,
        }
    }

    /// Fails the request registered under `id`.
    pub fn fail(&self, id: &Key, err: DhtError) {
        let entry = self.pending.lock().remove(id);
        if let Some(entry) = entry {
            entry.future.complete(Err(err));
        }
    }

    /// Fails every overdue request with `DhtError::Timeout` and returns their number.
    pub fn expire(&self) -> usize {
        let curr_time = SteadyTime::now();
        let expired: Vec<Pending> = {
            let mut pending = self.pending.lock();
            let ids: Vec<Key> = pending
                .iter()
                .filter(|(_, entry)| entry.deadline <= curr_time)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        for entry in &expired {
            debug!("Request to {} timed out", entry.addr);
            entry.future.complete(Err(DhtError::Timeout));
        }
        expired.len()
    }

    /// Cancels every outstanding request.
    pub fn cancel_all(&self) {
        let entries: Vec<Pending> = self.pending.lock().drain().map(|(_, entry)| entry).collect();
        for entry in entries {
            entry.future.cancel();
        }
    }

    /// Returns the number of outstanding requests.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }
}
