//! Kademlia routing table with XOR-distance metric.
//!
//! 256 k-buckets, each holding up to `k` contacts. A contact lives in the
//! bucket whose index is the length of the prefix it shares with the local
//! id, so bucket 0 holds the farthest half of the key space and bucket 255
//! the single closest id.
//!
//! ## Liveness-checked eviction
//!
//! When a bucket is full and a new contact is discovered, [`RoutingTable::insert`]
//! reports [`InsertOutcome::BucketFull`] with the least-recently-seen entry.
//! The caller pings it. If the ping fails the stale entry is replaced via
//! [`RoutingTable::evict_and_insert`]; if it answers, the caller calls
//! [`RoutingTable::mark_seen`] and the newcomer is discarded. The table itself
//! never performs I/O.

use std::collections::VecDeque;
use std::time::Instant;

use arxen_types::{Contact, Distance, NodeId};

use crate::NUM_BUCKETS;

/// Runtime metadata for a contact within a k-bucket.
#[derive(Clone, Debug)]
struct BucketEntry {
    contact: Contact,
    last_seen: Instant,
}

/// A single k-bucket, ordered by last-seen time.
///
/// The front of the deque holds the least-recently-seen entry;
/// the back holds the most-recently-seen entry.
#[derive(Clone, Debug, Default)]
struct KBucket {
    entries: VecDeque<BucketEntry>,
}

impl KBucket {
    fn find_index(&self, id: &NodeId) -> Option<usize> {
        self.entries.iter().position(|e| e.contact.id == *id)
    }

    /// Move an existing entry to the back, refreshing its address.
    fn touch(&mut self, index: usize, contact: Option<Contact>) {
        if let Some(mut entry) = self.entries.remove(index) {
            if let Some(contact) = contact {
                entry.contact = contact;
            }
            entry.last_seen = Instant::now();
            self.entries.push_back(entry);
        }
    }

    fn push(&mut self, contact: Contact) {
        self.entries.push_back(BucketEntry {
            contact,
            last_seen: Instant::now(),
        });
    }
}

/// Result of offering a contact to the routing table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The contact was newly inserted.
    Inserted,
    /// The contact was already present and moved to most-recently-seen.
    Updated,
    /// The contact is the local node.
    Ignored,
    /// The target bucket is full. The least-recently-seen entry should be
    /// pinged to decide whether the newcomer replaces it.
    BucketFull {
        bucket: usize,
        least_recently_seen: Contact,
    },
}

/// The Kademlia routing table.
#[derive(Debug)]
pub struct RoutingTable {
    local_id: NodeId,
    k: usize,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    /// Create an empty table for `local_id` with bucket capacity `k`.
    pub fn new(local_id: NodeId, k: usize) -> Self {
        Self {
            local_id,
            k: k.max(1),
            buckets: vec![KBucket::default(); NUM_BUCKETS],
        }
    }

    /// The id buckets are measured from.
    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Bucket capacity.
    pub fn k(&self) -> usize {
        self.k
    }

    /// The bucket `id` belongs in: the number of leading zero bits of its
    /// distance to the local id. `None` for the local id itself.
    pub fn bucket_index(&self, id: &NodeId) -> Option<usize> {
        self.local_id.distance(id).leading_zeros()
    }

    /// Offer a contact seen on the network.
    ///
    /// - Already present: moved to most-recently-seen, address refreshed.
    /// - Bucket has room: appended as most-recently-seen.
    /// - Bucket full: [`InsertOutcome::BucketFull`], table unchanged.
    pub fn insert(&mut self, contact: Contact) -> InsertOutcome {
        let Some(index) = self.bucket_index(&contact.id) else {
            return InsertOutcome::Ignored;
        };
        let k = self.k;
        let bucket = &mut self.buckets[index];

        if let Some(pos) = bucket.find_index(&contact.id) {
            bucket.touch(pos, Some(contact));
            return InsertOutcome::Updated;
        }

        if bucket.entries.len() < k {
            bucket.push(contact);
            return InsertOutcome::Inserted;
        }

        match bucket.entries.front() {
            Some(lrs) => InsertOutcome::BucketFull {
                bucket: index,
                least_recently_seen: lrs.contact,
            },
            None => InsertOutcome::Ignored,
        }
    }

    /// Move `id` to most-recently-seen. Returns `false` if it is not present.
    pub fn mark_seen(&mut self, id: &NodeId) -> bool {
        let Some(index) = self.bucket_index(id) else {
            return false;
        };
        let bucket = &mut self.buckets[index];
        match bucket.find_index(id) {
            Some(pos) => {
                bucket.touch(pos, None);
                true
            }
            None => false,
        }
    }

    /// Replace `stale_id` with `candidate` after a failed liveness probe.
    ///
    /// Returns `false` and leaves the table unchanged if `stale_id` is no
    /// longer present, or if the two do not share a bucket.
    pub fn evict_and_insert(&mut self, stale_id: &NodeId, candidate: Contact) -> bool {
        let (Some(index), Some(candidate_index)) = (
            self.bucket_index(stale_id),
            self.bucket_index(&candidate.id),
        ) else {
            return false;
        };
        if index != candidate_index {
            return false;
        }
        let bucket = &mut self.buckets[index];
        let Some(pos) = bucket.find_index(stale_id) else {
            return false;
        };
        bucket.entries.remove(pos);
        match bucket.find_index(&candidate.id) {
            Some(existing) => bucket.touch(existing, Some(candidate)),
            None => bucket.push(candidate),
        }
        true
    }

    /// Remove a contact.
    pub fn remove(&mut self, id: &NodeId) -> Option<Contact> {
        let index = self.bucket_index(id)?;
        let bucket = &mut self.buckets[index];
        let pos = bucket.find_index(id)?;
        bucket.entries.remove(pos).map(|e| e.contact)
    }

    /// Look up a contact by id.
    pub fn get(&self, id: &NodeId) -> Option<Contact> {
        let index = self.bucket_index(id)?;
        let bucket = &self.buckets[index];
        bucket.find_index(id).map(|pos| bucket.entries[pos].contact)
    }

    /// Whether `id` is in the table.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.get(id).is_some()
    }

    /// When `id` was last inserted or marked seen.
    pub fn last_seen(&self, id: &NodeId) -> Option<Instant> {
        let index = self.bucket_index(id)?;
        let bucket = &self.buckets[index];
        bucket.find_index(id).map(|pos| bucket.entries[pos].last_seen)
    }

    /// Up to `count` contacts ordered by ascending distance to `target`.
    ///
    /// Starts at the bucket `target` falls into and widens alternately to the
    /// neighbouring buckets on either side until `count` contacts are held.
    /// Every contact in a bucket above the target's shares a longer prefix
    /// with the target than any contact below it, so the remaining upper
    /// buckets are always drained before sorting.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        if count == 0 {
            return Vec::new();
        }

        let band = self.bucket_index(target).unwrap_or(NUM_BUCKETS);
        let mut found: Vec<(Distance, Contact)> = Vec::new();
        if band < NUM_BUCKETS {
            self.collect(band, target, &mut found);
        }

        let mut lower = band;
        let mut upper = band + 1;
        while found.len() < count && (lower > 0 || upper < NUM_BUCKETS) {
            if upper < NUM_BUCKETS {
                self.collect(upper, target, &mut found);
                upper += 1;
            }
            if found.len() < count && lower > 0 {
                lower -= 1;
                self.collect(lower, target, &mut found);
            }
        }
        for index in upper..NUM_BUCKETS {
            self.collect(index, target, &mut found);
        }

        found.sort_by(|a, b| a.0.cmp(&b.0));
        found.truncate(count);
        found.into_iter().map(|(_, contact)| contact).collect()
    }

    fn collect(&self, index: usize, target: &NodeId, out: &mut Vec<(Distance, Contact)>) {
        out.extend(
            self.buckets[index]
                .entries
                .iter()
                .map(|e| (e.contact.id.distance(target), e.contact)),
        );
    }

    /// Contacts in bucket `index`, least-recently-seen first.
    pub fn bucket(&self, index: usize) -> Vec<Contact> {
        self.buckets
            .get(index)
            .map(|b| b.entries.iter().map(|e| e.contact).collect())
            .unwrap_or_default()
    }

    /// Number of contacts in bucket `index`.
    pub fn bucket_len(&self, index: usize) -> usize {
        self.buckets.get(index).map_or(0, |b| b.entries.len())
    }

    /// Total number of contacts.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    /// Whether the table holds no contacts.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn make_contact(id: NodeId) -> Contact {
        Contact::new(id, SocketAddr::from(([127, 0, 0, 1], 4433)))
    }

    /// Contact `n` of bucket `bucket` relative to `local`.
    fn in_bucket(local: &NodeId, bucket: usize, n: u8) -> Contact {
        let mut bytes = *local.with_flipped_bit(bucket).as_bytes();
        // Vary only bits below the bucket's prefix.
        if bucket < 248 {
            bytes[31] ^= n;
        }
        make_contact(NodeId::from_bytes(bytes))
    }

    /// Reference answer: every contact sorted by distance.
    fn brute_force(table: &RoutingTable, target: &NodeId, count: usize) -> Vec<Contact> {
        let mut all: Vec<Contact> = (0..NUM_BUCKETS).flat_map(|i| table.bucket(i)).collect();
        all.sort_by_key(|c| c.id.distance(target));
        all.truncate(count);
        all
    }

    #[test]
    fn test_bucket_index() {
        let table = RoutingTable::new(NodeId::ZERO, 20);
        assert_eq!(table.bucket_index(&NodeId::ZERO), None);

        let mut far = [0u8; 32];
        far[0] = 0x80;
        assert_eq!(table.bucket_index(&NodeId::from_bytes(far)), Some(0));

        assert_eq!(table.bucket_index(&NodeId::from(1)), Some(255));
    }

    #[test]
    fn test_insert_and_update() {
        let mut table = RoutingTable::new(NodeId::ZERO, 20);
        let contact = make_contact(NodeId::from(1));

        assert_eq!(table.insert(contact), InsertOutcome::Inserted);
        assert_eq!(table.len(), 1);

        let moved = contact.with_addr(SocketAddr::from(([10, 0, 0, 1], 9000)));
        assert_eq!(table.insert(moved), InsertOutcome::Updated);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&contact.id).map(|c| c.addr), Some(moved.addr));
    }

    #[test]
    fn test_insert_self_ignored() {
        let local = NodeId::random();
        let mut table = RoutingTable::new(local, 20);
        assert_eq!(table.insert(make_contact(local)), InsertOutcome::Ignored);
        assert!(table.is_empty());
    }

    #[test]
    fn test_update_moves_to_back() {
        let local = NodeId::ZERO;
        let mut table = RoutingTable::new(local, 20);
        let a = in_bucket(&local, 0, 1);
        let b = in_bucket(&local, 0, 2);
        table.insert(a);
        table.insert(b);
        assert_eq!(table.bucket(0), vec![a, b]);

        table.insert(a);
        assert_eq!(table.bucket(0), vec![b, a]);

        assert!(table.mark_seen(&b.id));
        assert_eq!(table.bucket(0), vec![a, b]);
    }

    #[test]
    fn test_bucket_full_reports_least_recently_seen() {
        let local = NodeId::ZERO;
        let mut table = RoutingTable::new(local, 3);
        let first = in_bucket(&local, 0, 1);
        table.insert(first);
        table.insert(in_bucket(&local, 0, 2));
        table.insert(in_bucket(&local, 0, 3));

        let outcome = table.insert(in_bucket(&local, 0, 4));
        assert_eq!(
            outcome,
            InsertOutcome::BucketFull {
                bucket: 0,
                least_recently_seen: first,
            }
        );
        assert_eq!(table.bucket_len(0), 3);
        assert!(!table.contains(&in_bucket(&local, 0, 4).id));
    }

    #[test]
    fn test_evict_and_insert() {
        let local = NodeId::ZERO;
        let mut table = RoutingTable::new(local, 2);
        let stale = in_bucket(&local, 3, 1);
        let fresh = in_bucket(&local, 3, 2);
        let newcomer = in_bucket(&local, 3, 3);
        table.insert(stale);
        table.insert(fresh);

        assert!(table.evict_and_insert(&stale.id, newcomer));
        assert!(!table.contains(&stale.id));
        assert_eq!(table.bucket(3), vec![fresh, newcomer]);

        // Stale entry already gone.
        assert!(!table.evict_and_insert(&stale.id, in_bucket(&local, 3, 4)));
        assert_eq!(table.bucket_len(3), 2);
    }

    #[test]
    fn test_evict_rejects_other_bucket() {
        let local = NodeId::ZERO;
        let mut table = RoutingTable::new(local, 2);
        let stale = in_bucket(&local, 3, 1);
        table.insert(stale);
        assert!(!table.evict_and_insert(&stale.id, in_bucket(&local, 4, 1)));
        assert!(table.contains(&stale.id));
    }

    #[test]
    fn test_remove() {
        let mut table = RoutingTable::new(NodeId::ZERO, 20);
        let contact = make_contact(NodeId::from(7));
        table.insert(contact);
        assert_eq!(table.remove(&contact.id), Some(contact));
        assert!(table.is_empty());
        assert_eq!(table.remove(&contact.id), None);
    }

    #[test]
    fn test_closest_sorted_and_bounded() {
        let mut table = RoutingTable::new(NodeId::ZERO, 20);
        for i in 1..=50u64 {
            table.insert(make_contact(NodeId::from(i * 7919)));
        }
        let target = NodeId::from(12345);
        let closest = table.closest(&target, 10);
        assert_eq!(closest.len(), 10);
        for pair in closest.windows(2) {
            assert!(pair[0].id.distance(&target) <= pair[1].id.distance(&target));
        }
        assert!(table.closest(&target, 0).is_empty());
        assert_eq!(table.closest(&target, 500).len(), 50);
    }

    #[test]
    fn test_closest_matches_brute_force() {
        let local = NodeId::random();
        let mut table = RoutingTable::new(local, 4);
        for bucket in 0..40 {
            for n in 1..=6u8 {
                table.insert(in_bucket(&local, bucket, n));
            }
        }
        for _ in 0..50 {
            let target = NodeId::random();
            for count in [1, 3, 20, 200] {
                assert_eq!(
                    table.closest(&target, count),
                    brute_force(&table, &target, count)
                );
            }
        }
        // Targets near the local id exercise the upper buckets.
        for bucket in [0, 5, 39, 100] {
            let target = local.with_flipped_bit(bucket);
            assert_eq!(table.closest(&target, 20), brute_force(&table, &target, 20));
        }
    }

    #[test]
    fn test_closest_to_local_id() {
        let local = NodeId::random();
        let mut table = RoutingTable::new(local, 20);
        for bucket in [0, 10, 200] {
            table.insert(in_bucket(&local, bucket, 0));
        }
        let closest = table.closest(&local, 2);
        assert_eq!(closest.len(), 2);
        assert_eq!(table.bucket_index(&closest[0].id), Some(200));
        assert_eq!(table.bucket_index(&closest[1].id), Some(10));
    }

    #[test]
    fn test_last_seen_advances() {
        let mut table = RoutingTable::new(NodeId::ZERO, 20);
        let contact = make_contact(NodeId::from(3));
        table.insert(contact);
        let first = table.last_seen(&contact.id).expect("present");
        table.mark_seen(&contact.id);
        let second = table.last_seen(&contact.id).expect("present");
        assert!(second >= first);
        assert!(table.last_seen(&NodeId::from(4)).is_none());
    }
}
