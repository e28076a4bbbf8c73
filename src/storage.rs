use std::collections::{BTreeMap, HashMap};
use std::mem;

use parking_lot::Mutex;
use time::{Duration, SteadyTime};

use crate::key::Key;
use crate::MESSAGE_LENGTH;

/// Largest payload a node agrees to hold.
pub const MAX_PAYLOAD_LENGTH: usize = MESSAGE_LENGTH / 2;

/// Length of the window over which lookups of a value are counted.
const LOAD_WINDOW_SECS: i64 = 60;

/// A value published under `value_id` by `originator`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredValue {
    pub value_id: Key,
    pub originator: Key,
    pub payload: Vec<u8>,
    pub replication_count: u32,
}

impl StoredValue {
    pub fn new(value_id: Key, originator: Key, payload: Vec<u8>) -> Self {
        StoredValue {
            value_id,
            originator,
            payload,
            replication_count: 0,
        }
    }
}

/// The value-store collaborator. Persistence and expiry policy belong to the implementation; the
/// engine only moves values across the wire and asks for the ones due for republishing.
pub trait ValueStore: Send + Sync {
    /// Returns `false` if the store refused the value.
    fn put(&self, value: StoredValue) -> bool;

    /// Returns every value held under `value_id`, one per originator.
    fn get(&self, value_id: &Key) -> Vec<StoredValue>;

    /// Returns every value held.
    fn values(&self) -> Vec<StoredValue>;

    /// Removes the value published under `value_id` by `originator`. Returns `false` if it was
    /// not held.
    fn remove(&self, value_id: &Key, originator: &Key) -> bool;

    /// Returns the values whose republish interval has elapsed.
    fn list_expiring(&self) -> Vec<StoredValue>;

    /// Lookups per second recently served for `value_id`.
    fn request_load(&self, _value_id: &Key) -> f32 {
        0.0
    }
}

type Entry = (Key, Key);

struct Load {
    window_start: SteadyTime,
    count: u32,
}

struct Inner {
    data: HashMap<Entry, (StoredValue, SteadyTime)>,
    publish_times: BTreeMap<SteadyTime, Vec<Entry>>,
    loads: HashMap<Key, Load>,
}

/// An in-memory `ValueStore` keyed by value id and originator.
///
/// Values expire `expiration` after they were last published and are listed for republishing
/// once `republish_interval` has passed.
pub struct Storage {
    inner: Mutex<Inner>,
    expiration: Duration,
    republish_interval: Duration,
}

fn to_duration(duration: std::time::Duration) -> Duration {
    Duration::milliseconds(duration.as_millis() as i64)
}

impl Storage {
    pub fn new(expiration: std::time::Duration, republish_interval: std::time::Duration) -> Self {
        Storage {
            inner: Mutex::new(Inner {
                data: HashMap::new(),
                publish_times: BTreeMap::new(),
                loads: HashMap::new(),
            }),
            expiration: to_duration(expiration),
            republish_interval: to_duration(republish_interval),
        }
    }

    fn remove_expired(&self, inner: &mut Inner) {
        let curr_time = SteadyTime::now();
        inner
            .loads
            .retain(|_, load| curr_time - load.window_start <= Duration::seconds(LOAD_WINDOW_SECS));

        let expiration_cutoff = curr_time - self.expiration;
        let mut expired_times_map = inner.publish_times.split_off(&expiration_cutoff);
        mem::swap(&mut inner.publish_times, &mut expired_times_map);

        for (published, entries) in expired_times_map {
            for entry in entries {
                // skip entries that were republished since
                let is_current = inner
                    .data
                    .get(&entry)
                    .map_or(false, |&(_, time)| time == published);
                if is_current {
                    info!("Removed {:?} from {:?}", entry.0, entry.1);
                    inner.data.remove(&entry);
                }
            }
        }
    }

    /// Returns the number of values held.
    pub fn len(&self) -> usize {
        let mut inner = self.inner.lock();
        self.remove_expired(&mut inner);
        inner.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ValueStore for Storage {
    fn put(&self, value: StoredValue) -> bool {
        if value.payload.is_empty() || value.payload.len() > MAX_PAYLOAD_LENGTH {
            debug!("Rejecting {:?}: payload of {} bytes", value.value_id, value.payload.len());
            return false;
        }
        let mut inner = self.inner.lock();
        self.remove_expired(&mut inner);
        let curr_time = SteadyTime::now();
        let entry = (value.value_id, value.originator);

        inner.data.insert(entry, (value, curr_time));
        inner.publish_times.entry(curr_time).or_insert_with(Vec::new).push(entry);
        true
    }

    fn get(&self, value_id: &Key) -> Vec<StoredValue> {
        let mut inner = self.inner.lock();
        self.remove_expired(&mut inner);
        let values: Vec<StoredValue> = inner
            .data
            .iter()
            .filter(|(entry, _)| entry.0 == *value_id)
            .map(|(_, (value, _))| value.clone())
            .collect();

        // only lookups of held values count towards their load
        if !values.is_empty() {
            let load = inner.loads.entry(*value_id).or_insert(Load {
                window_start: SteadyTime::now(),
                count: 0,
            });
            load.count += 1;
        }
        values
    }

    fn values(&self) -> Vec<StoredValue> {
        let mut inner = self.inner.lock();
        self.remove_expired(&mut inner);
        inner.data.values().map(|(value, _)| value.clone()).collect()
    }

    fn remove(&self, value_id: &Key, originator: &Key) -> bool {
        let mut inner = self.inner.lock();
        inner.data.remove(&(*value_id, *originator)).is_some()
    }

    fn list_expiring(&self) -> Vec<StoredValue> {
        let mut inner = self.inner.lock();
        self.remove_expired(&mut inner);
        let republish_cutoff = SteadyTime::now() - self.republish_interval;
        inner
            .data
            .values()
            .filter(|&&(_, published)| published <= republish_cutoff)
            .map(|(value, _)| value.clone())
            .collect()
    }

    fn request_load(&self, value_id: &Key) -> f32 {
        let inner = self.inner.lock();
        match inner.loads.get(value_id) {
            Some(load) => {
                let elapsed = (SteadyTime::now() - load.window_start).num_milliseconds().max(1000);
                load.count as f32 * 1000.0 / elapsed as f32
            },
            None => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration as StdDuration;

    fn storage() -> Storage {
        Storage::new(StdDuration::from_secs(3600), StdDuration::from_secs(1800))
    }

    #[test]
    fn test_put_and_get_by_originator() {
        let storage = storage();
        let value_id = Key::rand();
        assert!(storage.put(StoredValue::new(value_id, Key::rand(), vec![1])));
        assert!(storage.put(StoredValue::new(value_id, Key::rand(), vec![2])));
        assert!(storage.put(StoredValue::new(Key::rand(), Key::rand(), vec![3])));

        let mut payloads: Vec<Vec<u8>> =
            storage.get(&value_id).into_iter().map(|value| value.payload).collect();
        payloads.sort();
        assert_eq!(payloads, vec![vec![1], vec![2]]);
        assert_eq!(storage.len(), 3);
    }

    #[test]
    fn test_put_replaces_same_originator() {
        let storage = storage();
        let value_id = Key::rand();
        let originator = Key::rand();
        storage.put(StoredValue::new(value_id, originator, vec![1]));
        storage.put(StoredValue::new(value_id, originator, vec![2]));
        assert_eq!(storage.get(&value_id)[0].payload, vec![2]);
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn test_remove_by_originator() {
        let storage = storage();
        let value_id = Key::rand();
        let kept = StoredValue::new(value_id, Key::rand(), vec![1]);
        let removed = StoredValue::new(value_id, Key::rand(), vec![2]);
        storage.put(kept.clone());
        storage.put(removed.clone());

        assert!(storage.remove(&value_id, &removed.originator));
        assert!(!storage.remove(&value_id, &removed.originator));
        assert_eq!(storage.values(), vec![kept]);
    }

    #[test]
    fn test_rejects_oversized_and_empty_payloads() {
        let storage = storage();
        assert!(!storage.put(StoredValue::new(Key::rand(), Key::rand(), vec![])));
        assert!(!storage.put(StoredValue::new(
            Key::rand(),
            Key::rand(),
            vec![0; MAX_PAYLOAD_LENGTH + 1]
        )));
        assert!(storage.is_empty());
    }

    #[test]
    fn test_values_expire() {
        let storage = Storage::new(StdDuration::from_millis(50), StdDuration::from_millis(10));
        let value_id = Key::rand();
        storage.put(StoredValue::new(value_id, Key::rand(), vec![1]));
        thread::sleep(StdDuration::from_millis(100));
        assert!(storage.get(&value_id).is_empty());
    }

    #[test]
    fn test_republished_value_survives_first_expiry() {
        let storage = Storage::new(StdDuration::from_millis(80), StdDuration::from_millis(10));
        let value = StoredValue::new(Key::rand(), Key::rand(), vec![1]);
        storage.put(value.clone());
        thread::sleep(StdDuration::from_millis(50));
        storage.put(value.clone());
        thread::sleep(StdDuration::from_millis(50));
        assert_eq!(storage.get(&value.value_id), vec![value]);
    }

    #[test]
    fn test_list_expiring() {
        let storage = Storage::new(StdDuration::from_secs(60), StdDuration::from_millis(20));
        let value = StoredValue::new(Key::rand(), Key::rand(), vec![1]);
        storage.put(value.clone());
        assert!(storage.list_expiring().is_empty());
        thread::sleep(StdDuration::from_millis(40));
        assert_eq!(storage.list_expiring(), vec![value]);
    }

    #[test]
    fn test_request_load_counts_lookups() {
        let storage = storage();
        let value_id = Key::rand();
        storage.put(StoredValue::new(value_id, Key::rand(), vec![1]));
        assert_eq!(storage.request_load(&value_id), 0.0);
        for _ in 0..3 {
            storage.get(&value_id);
        }
        assert!(storage.request_load(&value_id) > 0.0);
    }

    #[test]
    fn test_lookups_of_missing_values_are_not_tracked() {
        let storage = storage();
        for _ in 0..1000 {
            assert!(storage.get(&Key::rand()).is_empty());
        }
        assert!(storage.inner.lock().loads.is_empty());
        assert_eq!(storage.request_load(&Key::rand()), 0.0);
    }

    #[test]
    fn test_elapsed_load_windows_are_dropped() {
        let storage = storage();
        let value_id = Key::rand();
        storage.put(StoredValue::new(value_id, Key::rand(), vec![1]));
        storage.get(&value_id);
        storage
            .inner
            .lock()
            .loads
            .get_mut(&value_id)
            .unwrap()
            .window_start = SteadyTime::now() - Duration::seconds(LOAD_WINDOW_SECS + 1);

        storage.get(&Key::rand());
        assert!(storage.inner.lock().loads.is_empty());
        assert_eq!(storage.request_load(&value_id), 0.0);
    }
}
