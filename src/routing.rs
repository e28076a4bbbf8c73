use std::cmp;
use std::mem;
use std::sync::Arc;

use time::{Duration, SteadyTime};

use crate::config::DhtConfig;
use crate::key::Key;
use crate::node::contact::{Contact, ContactState};
use crate::stats::DhtStats;
use crate::KEY_BITS;

/// Outcome of `RoutingTable::add`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    /// The contact was appended to its bucket.
    Added,
    /// An existing entry was refreshed and moved to the most recently seen end.
    Updated,
    /// The contact is already known and nothing changed.
    Known,
    /// The contact took the place of an unconfirmed entry, which is returned.
    Replaced(Contact),
    /// The bucket is full; the contact went to its replacement cache.
    Cached,
    /// The contact cannot be admitted.
    Ignored,
}

/// A k-bucket in a node's routing table.
///
/// The contacts in the bucket are sorted by the time of the most recent communication, with
/// those most recently communicated with at the end of the list. The replacement cache follows
/// the same order.
#[derive(Clone, Debug)]
struct RoutingBucket {
    nodes: Vec<Contact>,
    cache: Vec<Contact>,
    last_update_time: SteadyTime,
}

impl RoutingBucket {
    fn new() -> Self {
        RoutingBucket {
            nodes: Vec::new(),
            cache: Vec::new(),
            last_update_time: SteadyTime::now(),
        }
    }

    fn touch(&mut self) {
        self.last_update_time = SteadyTime::now();
    }

    fn position(&self, id: &Key) -> Option<usize> {
        self.nodes.iter().position(|contact| contact.id == *id)
    }

    fn cache_position(&self, id: &Key) -> Option<usize> {
        self.cache.iter().position(|contact| contact.id == *id)
    }

    /// Moves the node at `index` to the most recently seen end.
    fn move_to_end(&mut self, index: usize) {
        let contact = self.nodes.remove(index);
        self.nodes.push(contact);
    }

    fn add_cached(&mut self, contact: Contact, capacity: usize) {
        if let Some(index) = self.cache_position(&contact.id) {
            self.cache.remove(index);
        }
        self.cache.push(contact);
        if self.cache.len() > capacity {
            self.cache.remove(0);
        }
    }

    /// Splits `self` at `index` and returns the bucket closer to `key`.
    fn split(&mut self, key: &Key, index: usize) -> RoutingBucket {
        let in_old = |contact: &Contact| contact.id.xor(key).leading_zeros() == index;
        let (old_nodes, new_nodes): (Vec<_>, Vec<_>) = self.nodes.drain(..).partition(in_old);
        let (old_cache, new_cache): (Vec<_>, Vec<_>) = self.cache.drain(..).partition(in_old);
        self.nodes = old_nodes;
        self.cache = old_cache;
        RoutingBucket {
            nodes: new_nodes,
            cache: new_cache,
            last_update_time: self.last_update_time,
        }
    }

    /// Promotes cached contacts until the bucket is full or the cache is empty.
    fn refill(&mut self, capacity: usize) {
        while self.nodes.len() < capacity {
            match self.cache.pop() {
                Some(contact) => self.nodes.insert(0, contact),
                None => break,
            }
        }
    }

    /// Returns `true` if the routing bucket has not been updated in `interval`.
    fn is_stale(&self, interval: Duration) -> bool {
        SteadyTime::now() - self.last_update_time > interval
    }
}

/// A node's routing table.
///
/// Bucket `i` holds the contacts whose distance to the local id has exactly `i` leading zeros,
/// except for the last bucket, which holds every contact at least that close. Only the last
/// bucket contains the local id, so it is the only one that splits; the buckets therefore always
/// partition the whole key space.
#[derive(Debug)]
pub struct RoutingTable {
    buckets: Vec<RoutingBucket>,
    local: Contact,
    k: usize,
    replacement_cache_size: usize,
    max_alive_failures: u32,
    max_unknown_failures: u32,
    max_consecutive_failures: usize,
    refresh_interval: Duration,
    consecutive_failures: usize,
    stats: Arc<DhtStats>,
}

impl RoutingTable {
    /// Constructs a new, empty `RoutingTable` around `local`.
    pub fn new(local: Contact, config: &DhtConfig, stats: Arc<DhtStats>) -> Self {
        RoutingTable {
            buckets: vec![RoutingBucket::new()],
            local,
            k: config.k,
            replacement_cache_size: config.replacement_cache_size,
            max_alive_failures: config.max_alive_failures,
            max_unknown_failures: config.max_unknown_failures,
            max_consecutive_failures: config.max_consecutive_failures,
            refresh_interval: Duration::milliseconds(
                config.bucket_refresh_interval.as_millis() as i64,
            ),
            consecutive_failures: 0,
            stats,
        }
    }

    fn bucket_index(&self, id: &Key) -> usize {
        cmp::min(self.local.id.xor(id).leading_zeros(), self.buckets.len() - 1)
    }

    fn is_last_bucket(&self, index: usize) -> bool {
        index == self.buckets.len() - 1
    }

    /// Returns the prefix and depth of the key range owned by bucket `index`.
    fn bucket_range(&self, index: usize) -> (Key, usize) {
        if self.is_last_bucket(index) {
            (self.local.id, index)
        } else {
            (self.local.id.with_bit(index, !self.local.id.bit(index)), index + 1)
        }
    }

    /// Admits `contact` into the table.
    ///
    /// The local id and firewalled contacts are never admitted. An entry that is already known
    /// is only refreshed by an alive descriptor, and an alive entry is never overwritten by a
    /// descriptor with a different address.
    pub fn add(&mut self, contact: Contact) -> Admission {
        if contact.id == self.local.id || contact.firewalled {
            return Admission::Ignored;
        }
        if contact.is_alive() {
            self.consecutive_failures = 0;
        }

        let mut index = self.bucket_index(&contact.id);
        if let Some(position) = self.buckets[index].position(&contact.id) {
            let bucket = &mut self.buckets[index];
            let existing = &mut bucket.nodes[position];
            if existing.is_alive() && existing.addr != contact.addr {
                warn!(
                    "{} - Ignoring {:?}, {} already uses that id",
                    self.local.addr, contact, existing.addr
                );
                return Admission::Ignored;
            }
            if !contact.is_alive() {
                return Admission::Known;
            }
            existing.merge(&contact);
            existing.mark_alive();
            bucket.move_to_end(position);
            bucket.touch();
            return Admission::Updated;
        }

        loop {
            let bucket = &mut self.buckets[index];
            if bucket.nodes.len() < self.k {
                if let Some(position) = bucket.cache_position(&contact.id) {
                    bucket.cache.remove(position);
                }
                bucket.nodes.push(contact);
                bucket.touch();
                return Admission::Added;
            }

            if self.is_last_bucket(index) && self.buckets.len() < KEY_BITS {
                let new_bucket = self.buckets[index].split(&self.local.id, index);
                self.buckets.push(new_bucket);
                self.buckets[index].refill(self.k);
                self.buckets[index + 1].refill(self.k);
                self.stats.bucket_splits.inc();
                debug!("{} - Split bucket {}", self.local.addr, index);
                index = self.bucket_index(&contact.id);
                continue;
            }

            let bucket = &mut self.buckets[index];
            if contact.is_alive() {
                let replaceable = bucket
                    .nodes
                    .iter()
                    .position(|node| node.is_dead() || !node.has_been_alive());
                if let Some(position) = replaceable {
                    let replaced = bucket.nodes.remove(position);
                    bucket.nodes.push(contact);
                    bucket.touch();
                    self.stats.contacts_replaced.inc();
                    return Admission::Replaced(replaced);
                }
            }
            bucket.add_cached(contact, self.replacement_cache_size);
            return Admission::Cached;
        }
    }

    /// Records a failed exchange with `id`. Returns the contact if it was declared dead and
    /// removed; its place is taken by the most recently seen cached contact.
    pub fn handle_failure(&mut self, id: &Key) -> Option<Contact> {
        if *id == self.local.id {
            return None;
        }
        let index = self.bucket_index(id);
        let bucket = &mut self.buckets[index];
        let (in_nodes, position) = match bucket.position(id) {
            Some(position) => (true, position),
            None => match bucket.cache_position(id) {
                Some(position) => (false, position),
                None => return None,
            },
        };

        if self.consecutive_failures >= self.max_consecutive_failures {
            trace!("{} - Ignoring failure of {:?}, we appear to be disconnected", self.local.addr, id);
            return None;
        }
        self.consecutive_failures += 1;

        let contact = if in_nodes {
            &mut bucket.nodes[position]
        } else {
            &mut bucket.cache[position]
        };
        contact.failures += 1;
        let max_failures = if contact.has_been_alive() {
            self.max_alive_failures
        } else {
            self.max_unknown_failures
        };
        if contact.failures < max_failures {
            return None;
        }

        self.stats.contacts_dead.inc();
        if !in_nodes {
            let mut dead = bucket.cache.remove(position);
            dead.state = ContactState::Dead;
            return Some(dead);
        }
        let mut dead = bucket.nodes.remove(position);
        dead.state = ContactState::Dead;
        debug!("{} - Removing dead contact {:?}", self.local.addr, dead);
        if let Some(mut mrs) = bucket.cache.pop() {
            mrs.state = ContactState::Unknown;
            bucket.nodes.push(mrs);
            bucket.touch();
        }
        Some(dead)
    }

    /// Returns up to `count` contacts ordered by ascending distance to `target`. Dead contacts
    /// are only returned if nothing else is known.
    pub fn select(&self, target: &Key, count: usize) -> Vec<Contact> {
        let ret = self.select_where(target, count, |contact| !contact.is_dead());
        if ret.is_empty() {
            self.select_where(target, count, |_| true)
        } else {
            ret
        }
    }

    fn select_where<F>(&self, target: &Key, count: usize, filter: F) -> Vec<Contact>
    where
        F: Fn(&Contact) -> bool,
    {
        let index = self.bucket_index(target);
        let mut ret = Vec::new();
        let extend = |ret: &mut Vec<Contact>, bucket: &RoutingBucket| {
            ret.extend(bucket.nodes.iter().filter(|&contact| filter(contact)).cloned());
        };

        // the closest keys are guaranteed to be in bucket which the key would reside
        extend(&mut ret, &self.buckets[index]);

        if ret.len() < count {
            // the distance between target key and keys is not necessarily monotonic
            // in range (index, self.buckets.len()), so we must iterate
            for bucket in &self.buckets[index + 1..] {
                extend(&mut ret, bucket);
            }
        }

        if ret.len() < count {
            // the distance between target key and keys in [0, index) is monotonically
            // decreasing by bucket
            for bucket in self.buckets[..index].iter().rev() {
                extend(&mut ret, bucket);
                if ret.len() >= count {
                    break;
                }
            }
        }

        ret.sort_by_key(|contact| contact.id.xor(target));
        ret.truncate(count);
        ret
    }

    /// Returns one random id per bucket due for a refresh and marks those buckets refreshed.
    ///
    /// While bootstrapping every bucket is due and the furthest buckets come first; otherwise
    /// only stale buckets are returned, starting from the local bucket.
    pub fn refresh_ids(&mut self, bootstrapping: bool) -> Vec<Key> {
        let mut indexes: Vec<usize> = (0..self.buckets.len())
            .filter(|&index| bootstrapping || self.buckets[index].is_stale(self.refresh_interval))
            .collect();
        if !bootstrapping {
            indexes.reverse();
        }

        let mut ret = Vec::with_capacity(indexes.len());
        for index in indexes {
            let (prefix, depth) = self.bucket_range(index);
            ret.push(Key::rand_with_prefix(&prefix, depth));
            self.buckets[index].touch();
        }
        ret
    }

    /// Discards every contact that is not alive and clears the replacement caches.
    pub fn purge(&mut self) {
        for bucket in &mut self.buckets {
            bucket.nodes.retain(Contact::is_alive);
            bucket.cache.clear();
        }
        self.consecutive_failures = 0;
        info!("{} - Purged routing table, {} contacts left", self.local.addr, self.len());
    }

    /// Rebuilds the table around a new local contact.
    pub fn rebuild(&mut self, local: Contact) {
        let buckets = mem::replace(&mut self.buckets, vec![RoutingBucket::new()]);
        self.local = local;
        self.consecutive_failures = 0;
        let (nodes, cache): (Vec<_>, Vec<_>) =
            buckets.into_iter().map(|bucket| (bucket.nodes, bucket.cache)).unzip();
        for contact in nodes.into_iter().flatten().chain(cache.into_iter().flatten()) {
            self.add(contact);
        }
    }

    /// Returns the entry for `id`, if any.
    pub fn get(&self, id: &Key) -> Option<&Contact> {
        let bucket = &self.buckets[self.bucket_index(id)];
        bucket.position(id).map(|position| &bucket.nodes[position])
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.buckets.iter().flat_map(|bucket| bucket.nodes.iter().cloned()).collect()
    }

    pub fn cached_contacts(&self) -> Vec<Contact> {
        self.buckets.iter().flat_map(|bucket| bucket.cache.iter().cloned()).collect()
    }

    /// Returns the prefix, depth and number of contacts of every bucket.
    pub fn buckets(&self) -> Vec<(Key, usize, usize)> {
        (0..self.buckets.len())
            .map(|index| {
                let (prefix, depth) = self.bucket_range(index);
                (prefix, depth, self.buckets[index].nodes.len())
            })
            .collect()
    }

    /// Returns the number of contacts in the routing table.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.nodes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of buckets in the routing table.
    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    pub fn local(&self) -> &Contact {
        &self.local
    }

    /// Estimates the network size from the density of the local bucket.
    pub fn estimate_network_size(&self) -> u64 {
        let depth = self.buckets.len() - 1;
        let local_count = self.buckets[depth].nodes.len() as u64 + 1;
        1u64.checked_shl(depth as u32)
            .and_then(|scale| scale.checked_mul(local_count))
            .unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigUint;
    use std::net::SocketAddr;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn table() -> RoutingTable {
        RoutingTable::new(
            Contact::alive(Key::rand(), addr(1)),
            &DhtConfig::default(),
            Arc::new(DhtStats::default()),
        )
    }

    fn assert_partitioned(table: &RoutingTable) {
        let mut total = BigUint::from(0u32);
        for (_, depth, _) in table.buckets() {
            total += BigUint::from(1u32) << (KEY_BITS - depth);
        }
        assert_eq!(total, BigUint::from(1u32) << KEY_BITS);

        for (index, bucket) in table.buckets.iter().enumerate() {
            let (prefix, depth) = table.bucket_range(index);
            assert!(bucket.nodes.len() <= table.k);
            for contact in bucket.nodes.iter().chain(bucket.cache.iter()) {
                assert!(contact.id.shares_prefix(&prefix, depth));
            }
        }
    }

    #[test]
    fn test_add_ignores_local_and_firewalled() {
        let mut table = table();
        let local = table.local().clone();
        assert_eq!(table.add(local), Admission::Ignored);

        let mut firewalled = Contact::alive(Key::rand(), addr(2));
        firewalled.firewalled = true;
        assert_eq!(table.add(firewalled), Admission::Ignored);
        assert!(table.is_empty());
    }

    #[test]
    fn test_add_and_refresh() {
        let mut table = table();
        let id = Key::rand();
        assert_eq!(table.add(Contact::new(id, addr(2))), Admission::Added);
        assert_eq!(table.add(Contact::new(id, addr(2))), Admission::Known);
        assert_eq!(table.add(Contact::alive(id, addr(3))), Admission::Updated);
        assert_eq!(table.get(&id).map(|contact| contact.addr), Some(addr(3)));
        assert!(table.get(&id).map_or(false, Contact::is_alive));
    }

    #[test]
    fn test_alive_entry_is_not_spoofed() {
        let mut table = table();
        let id = Key::rand();
        table.add(Contact::alive(id, addr(2)));
        assert_eq!(table.add(Contact::alive(id, addr(3))), Admission::Ignored);
        assert_eq!(table.get(&id).map(|contact| contact.addr), Some(addr(2)));
    }

    #[test]
    fn test_buckets_partition_key_space() {
        let mut table = table();
        for port in 0..2000 {
            table.add(Contact::alive(Key::rand(), addr(port)));
        }
        let local = table.local().id;
        for i in 0..40 {
            table.add(Contact::alive(Key::rand_with_prefix(&local, i), addr(3000 + i as u16)));
        }
        assert!(table.size() > 1);
        assert!(table.stats.bucket_splits.get() > 0);
        assert_partitioned(&table);
    }

    #[test]
    fn test_full_far_bucket_caches() {
        let mut table = table();
        let local = table.local().id;
        // fill the local side so that bucket 0 stops splitting
        for i in 0..table.k {
            let id = Key::rand_with_prefix(&local, 1);
            table.add(Contact::alive(id, addr(i as u16)));
        }
        let far = local.with_bit(0, !local.bit(0));
        for i in 0..=table.k + 5 {
            table.add(Contact::alive(Key::rand_with_prefix(&far, 1), addr(1000 + i as u16)));
        }
        assert_eq!(table.buckets[0].nodes.len(), table.k);
        assert!(!table.buckets[0].cache.is_empty());
        assert!(table.buckets[0].cache.len() <= table.replacement_cache_size);
        assert_partitioned(&table);
    }

    #[test]
    fn test_alive_contact_replaces_unconfirmed() {
        let mut table = table();
        let local = table.local().id;
        for i in 0..table.k {
            table.add(Contact::alive(Key::rand_with_prefix(&local, 1), addr(i as u16)));
        }
        let far = local.with_bit(0, !local.bit(0));
        let unconfirmed = Key::rand_with_prefix(&far, 1);
        table.add(Contact::new(unconfirmed, addr(500)));
        for i in 1..table.k {
            table.add(Contact::alive(Key::rand_with_prefix(&far, 1), addr(1000 + i as u16)));
        }
        let newcomer = Contact::alive(Key::rand_with_prefix(&far, 1), addr(2000));
        match table.add(newcomer.clone()) {
            Admission::Replaced(replaced) => assert_eq!(replaced.id, unconfirmed),
            other => panic!("unexpected admission {:?}", other),
        }
        assert!(table.get(&newcomer.id).is_some());
        assert!(table.get(&unconfirmed).is_none());
    }

    #[test]
    fn test_select_orders_by_distance() {
        let mut table = table();
        for port in 0..300 {
            table.add(Contact::alive(Key::rand(), addr(port)));
        }
        let target = Key::rand();
        let selected = table.select(&target, 20);
        assert_eq!(selected.len(), 20);
        for pair in selected.windows(2) {
            assert!(target.is_closer(&pair[0].id, &pair[1].id));
        }

        // nothing closer was skipped
        let furthest = selected[19].id.xor(&target);
        let closer = table
            .contacts()
            .into_iter()
            .filter(|contact| contact.id.xor(&target) <= furthest)
            .count();
        assert_eq!(closer, 20);
    }

    #[test]
    fn test_failures_kill_contacts_and_promote_cache() {
        let mut table = table();
        let local = table.local().id;
        for i in 0..table.k {
            table.add(Contact::alive(Key::rand_with_prefix(&local, 1), addr(i as u16)));
        }
        let far = local.with_bit(0, !local.bit(0));
        let victim = Key::rand_with_prefix(&far, 1);
        table.add(Contact::alive(victim, addr(100)));
        for i in 1..=table.k {
            table.add(Contact::alive(Key::rand_with_prefix(&far, 1), addr(200 + i as u16)));
        }
        let promoted = table.buckets[0].cache.last().cloned().unwrap();

        for _ in 1..table.max_alive_failures {
            assert!(table.handle_failure(&victim).is_none());
        }
        let dead = table.handle_failure(&victim).unwrap();
        assert_eq!(dead.state, ContactState::Dead);
        assert!(table.get(&victim).is_none());
        assert_eq!(
            table.get(&promoted.id).map(|contact| contact.state),
            Some(ContactState::Unknown)
        );
        assert_eq!(table.stats.contacts_dead.get(), 1);
    }

    #[test]
    fn test_unknown_contacts_die_faster() {
        let mut table = table();
        let id = Key::rand();
        table.add(Contact::new(id, addr(2)));
        for _ in 1..table.max_unknown_failures {
            assert!(table.handle_failure(&id).is_none());
        }
        assert!(table.handle_failure(&id).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_consecutive_failures_are_ignored() {
        let mut config = DhtConfig::default();
        config.max_consecutive_failures = 2;
        config.max_unknown_failures = 3;
        let mut table = RoutingTable::new(
            Contact::alive(Key::rand(), addr(1)),
            &config,
            Arc::new(DhtStats::default()),
        );
        let id = Key::rand();
        table.add(Contact::new(id, addr(2)));
        for _ in 0..5 {
            assert!(table.handle_failure(&id).is_none());
        }
        assert_eq!(table.get(&id).map(|contact| contact.failures), Some(2));

        // a live contact proves connectivity again
        table.add(Contact::alive(Key::rand(), addr(3)));
        assert!(table.handle_failure(&id).is_some());
    }

    #[test]
    fn test_refresh_ids_cover_buckets() {
        let mut table = table();
        for port in 0..500 {
            table.add(Contact::alive(Key::rand(), addr(port)));
        }
        let ids = table.refresh_ids(true);
        assert_eq!(ids.len(), table.size());
        for (index, id) in ids.iter().enumerate() {
            let (prefix, depth) = table.bucket_range(index);
            assert!(id.shares_prefix(&prefix, depth));
        }

        // freshly touched buckets are not stale
        assert!(table.refresh_ids(false).is_empty());
    }

    #[test]
    fn test_purge_keeps_alive_contacts() {
        let mut table = table();
        let alive = Key::rand();
        table.add(Contact::alive(alive, addr(2)));
        table.add(Contact::new(Key::rand(), addr(3)));
        table.purge();
        assert_eq!(table.len(), 1);
        assert!(table.get(&alive).is_some());
        assert!(table.cached_contacts().is_empty());
    }

    #[test]
    fn test_rebuild_moves_contacts() {
        let mut table = table();
        for port in 0..200 {
            table.add(Contact::alive(Key::rand(), addr(port)));
        }
        let new_local = Contact::alive(Key::rand(), addr(1));
        table.rebuild(new_local.clone());
        assert_eq!(table.local().id, new_local.id);
        assert!(table.len() > 0);
        assert_partitioned(&table);
    }

    #[test]
    fn test_estimate_network_size() {
        let mut table = table();
        assert_eq!(table.estimate_network_size(), 1);
        table.add(Contact::alive(Key::rand(), addr(2)));
        assert_eq!(table.estimate_network_size(), 2);
    }
}
