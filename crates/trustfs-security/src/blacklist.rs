//! Revoked authentication entities.
//!
//! Readers load the current immutable [`AeHashTable`] through an atomic
//! pointer without taking a lock; the single writer builds a new table and
//! swaps it in. A table is never mutated while visible.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::info;

use crate::error::{Result, SecurityError};

/// Bucket count of the blacklist table.
pub const AE_HASH_BUCKETS: usize = 1023;

/// Fixed-bucket chained table of `(id, blacklist time)`.
#[derive(Debug, Clone)]
pub struct AeHashTable {
    buckets: Vec<Vec<(u32, u64)>>,
    len: usize,
}

impl Default for AeHashTable {
    fn default() -> Self {
        Self {
            buckets: vec![Vec::new(); AE_HASH_BUCKETS],
            len: 0,
        }
    }
}

impl AeHashTable {
    fn bucket(id: u32) -> usize {
        id as usize % AE_HASH_BUCKETS
    }

    /// Blacklist time of `id`.
    pub fn get(&self, id: u32) -> Option<u64> {
        self.buckets[Self::bucket(id)]
            .iter()
            .find(|(i, _)| *i == id)
            .map(|(_, t)| *t)
    }

    fn insert(&mut self, id: u32, time: u64) {
        let chain = &mut self.buckets[Self::bucket(id)];
        match chain.iter_mut().find(|(i, _)| *i == id) {
            Some(entry) => entry.1 = time,
            None => {
                chain.push((id, time));
                self.len += 1;
            }
        }
    }

    fn remove(&mut self, id: u32) -> bool {
        let chain = &mut self.buckets[Self::bucket(id)];
        match chain.iter().position(|(i, _)| *i == id) {
            Some(pos) => {
                chain.swap_remove(pos);
                self.len -= 1;
                true
            }
            None => false,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Published blacklist with a version counter bumped on every swap.
#[derive(Debug, Default)]
pub struct Blacklist {
    current: ArcSwap<AeHashTable>,
    version: AtomicU64,
    writer: Mutex<()>,
}

impl Blacklist {
    /// Creates an empty blacklist.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current table.
    pub fn snapshot(&self) -> Arc<AeHashTable> {
        self.current.load_full()
    }

    /// Number of swaps so far.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn publish(&self, table: AeHashTable) {
        self.current.store(Arc::new(table));
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Adds or refreshes entries. With `reinit` the table is rebuilt from
    /// exactly these entries.
    pub fn update(&self, ids: &[u32], times: &[u64], reinit: bool) -> Result<()> {
        if ids.len() != times.len() {
            return Err(SecurityError::InvalidArgument(format!(
                "{} ids but {} blacklist times",
                ids.len(),
                times.len()
            )));
        }
        let _w = self.writer.lock();
        let mut table = if reinit {
            AeHashTable::default()
        } else {
            (*self.snapshot()).clone()
        };
        for (&id, &t) in ids.iter().zip(times) {
            table.insert(id, t);
        }
        let entries = table.len();
        self.publish(table);
        info!(updated = ids.len(), entries, reinit, "blacklist updated");
        Ok(())
    }

    /// Removes entries. Ids not present are ignored.
    pub fn remove(&self, ids: &[u32]) {
        let _w = self.writer.lock();
        let mut table = (*self.snapshot()).clone();
        let removed = ids.iter().filter(|&&id| table.remove(id)).count();
        let entries = table.len();
        self.publish(table);
        info!(removed, entries, "blacklist entries removed");
    }

    /// Blacklist time of `id`.
    pub fn blacklist_time(&self, id: u32) -> Option<u64> {
        self.current.load().get(id)
    }

    /// True if `id` was blacklisted at or after `issued_at`.
    pub fn is_blacklisted(&self, id: u32, issued_at: u64) -> bool {
        matches!(self.blacklist_time(id), Some(t) if issued_at <= t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_lookup_remove() {
        let bl = Blacklist::new();
        bl.update(&[42], &[1000], false).unwrap();
        assert_eq!(bl.blacklist_time(42), Some(1000));
        assert!(bl.is_blacklisted(42, 999));
        assert!(bl.is_blacklisted(42, 1000));
        assert!(!bl.is_blacklisted(42, 1001));
        bl.remove(&[42]);
        assert_eq!(bl.blacklist_time(42), None);
        assert_eq!(bl.version(), 2);
    }

    #[test]
    fn test_colliding_ids_chain() {
        let bl = Blacklist::new();
        let ids = [5u32, 5 + 1023, 5 + 2 * 1023];
        bl.update(&ids, &[1, 2, 3], false).unwrap();
        assert_eq!(bl.blacklist_time(5 + 1023), Some(2));
        bl.remove(&[5]);
        assert_eq!(bl.blacklist_time(5), None);
        assert_eq!(bl.blacklist_time(5 + 2 * 1023), Some(3));
        assert_eq!(bl.snapshot().len(), 2);
    }

    #[test]
    fn test_reinit_replaces_table() {
        let bl = Blacklist::new();
        bl.update(&[1, 2], &[10, 20], false).unwrap();
        let old = bl.snapshot();
        bl.update(&[3], &[30], true).unwrap();
        assert_eq!(bl.blacklist_time(1), None);
        assert_eq!(bl.blacklist_time(3), Some(30));
        // Readers holding the old snapshot still see it intact.
        assert_eq!(old.get(1), Some(10));
        assert!(bl.update(&[1], &[], false).is_err());
    }

    #[test]
    fn test_lookup_proceeds_while_writer_busy() {
        let bl = Arc::new(Blacklist::new());
        bl.update(&[9], &[50], false).unwrap();
        let _w = bl.writer.lock();
        let reader = {
            let bl = bl.clone();
            std::thread::spawn(move || (bl.blacklist_time(9), bl.is_blacklisted(9, 10)))
        };
        assert_eq!(reader.join().unwrap(), (Some(50), true));
    }

    #[test]
    fn test_concurrent_readers_during_rebuilds() {
        let bl = Arc::new(Blacklist::new());
        bl.update(&[7], &[u64::MAX], false).unwrap();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let bl = bl.clone();
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        assert!(bl.is_blacklisted(7, 0));
                    }
                })
            })
            .collect();
        for i in 0..200u32 {
            bl.update(&[7, 100 + i], &[u64::MAX, 1], i % 2 == 0).unwrap();
        }
        for r in readers {
            r.join().unwrap();
        }
    }
}
