//! Chained hash table keyed by page-aligned virtual address.
//!
//! Both the page-statistics table and the sampler record table follow the
//! same discipline: a fixed prime number of buckets, a single readers-writer
//! lock, shared leases for lookup and iteration, and an exclusive lease only
//! for inserting a new entry or clearing the table. Entries are shared as
//! `Arc` so callers can mutate their atomic counters without holding the
//! table lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::util::{bucket_index, now_ns, page_align};

/// An entry addressable by the page it describes.
pub trait PageKeyed {
    fn create(page_addr: u64, now_ns: u64) -> Self;
    fn page_addr(&self) -> u64;
}

pub struct ChainedTable<T> {
    buckets: RwLock<Box<[Vec<Arc<T>>]>>,
    entries: AtomicU64,
}

impl<T: PageKeyed> ChainedTable<T> {
    pub fn new(bucket_count: usize) -> Self {
        let buckets: Vec<Vec<Arc<T>>> = (0..bucket_count).map(|_| Vec::new()).collect();
        ChainedTable {
            buckets: RwLock::new(buckets.into_boxed_slice()),
            entries: AtomicU64::new(0),
        }
    }

    /// Read-only lookup. Returns nothing if the page is not tracked.
    pub fn lookup(&self, addr: u64) -> Option<Arc<T>> {
        let page = page_align(addr);
        let buckets = self.buckets.read().unwrap();
        buckets[bucket_index(page, buckets.len())]
            .iter()
            .find(|e| e.page_addr() == page)
            .cloned()
    }

    /// Returns the entry for the page, creating it if absent. The chain is
    /// re-checked under the exclusive lease so two racing creators converge
    /// on a single entry.
    pub fn get_or_insert(&self, addr: u64) -> Arc<T> {
        if let Some(entry) = self.lookup(addr) {
            return entry;
        }
        let page = page_align(addr);
        let mut buckets = self.buckets.write().unwrap();
        let idx = bucket_index(page, buckets.len());
        if let Some(entry) = buckets[idx].iter().find(|e| e.page_addr() == page) {
            return entry.clone();
        }
        let entry = Arc::new(T::create(page, now_ns()));
        buckets[idx].push(entry.clone());
        self.entries.fetch_add(1, Ordering::Relaxed);
        entry
    }

    /// Number of tracked entries.
    pub fn len(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.read().unwrap().len()
    }

    /// Clones out one bucket's entries under the shared lease, so the caller
    /// can work on them with the lease dropped.
    pub fn bucket_entries(&self, idx: usize) -> Vec<Arc<T>> {
        self.buckets.read().unwrap()[idx].clone()
    }

    /// Visits every entry under a single shared lease.
    pub fn for_each<F: FnMut(&Arc<T>)>(&self, mut f: F) {
        let buckets = self.buckets.read().unwrap();
        for bucket in buckets.iter() {
            for entry in bucket {
                f(entry);
            }
        }
    }

    /// Drops every entry and empties every bucket.
    pub fn clear(&self) {
        let mut buckets = self.buckets.write().unwrap();
        for bucket in buckets.iter_mut() {
            bucket.clear();
        }
        self.entries.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::PAGE_SIZE;

    struct TestEntry {
        page: u64,
        created_ns: u64,
    }

    impl PageKeyed for TestEntry {
        fn create(page_addr: u64, now_ns: u64) -> Self {
            TestEntry {
                page: page_addr,
                created_ns: now_ns,
            }
        }
        fn page_addr(&self) -> u64 {
            self.page
        }
    }

    #[test]
    fn test_lookup_miss_then_insert() {
        let table: ChainedTable<TestEntry> = ChainedTable::new(97);
        assert!(table.lookup(0x1000).is_none());
        let e = table.get_or_insert(0x1000);
        assert_eq!(e.page_addr(), 0x1000);
        assert!(e.created_ns > 0);
        assert_eq!(table.len(), 1);
        assert!(table.lookup(0x1000).is_some());
    }

    #[test]
    fn test_get_or_insert_aligns_and_dedups() {
        let table: ChainedTable<TestEntry> = ChainedTable::new(97);
        let a = table.get_or_insert(0x5004);
        let b = table.get_or_insert(0x5ff8);
        assert_eq!(a.page_addr(), 0x5000);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_colliding_pages_share_a_bucket() {
        let buckets = 97usize;
        let table: ChainedTable<TestEntry> = ChainedTable::new(buckets);
        // Page frame numbers that differ by the bucket count hash to the
        // same bucket under the multiplicative hash.
        let a = 0x40_0000u64;
        let b = a + ((buckets as u64) << 12);
        table.get_or_insert(a);
        table.get_or_insert(b);
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup(a).unwrap().page_addr(), a);
        assert_eq!(table.lookup(b).unwrap().page_addr(), b);
        let idx = crate::util::bucket_index(a, buckets);
        assert_eq!(table.bucket_entries(idx).len(), 2);
    }

    #[test]
    fn test_for_each_and_clear() {
        let table: ChainedTable<TestEntry> = ChainedTable::new(97);
        for i in 0..10u64 {
            table.get_or_insert(i * PAGE_SIZE as u64);
        }
        let mut seen = 0;
        table.for_each(|_| seen += 1);
        assert_eq!(seen, 10);
        table.clear();
        assert_eq!(table.len(), 0);
        assert!(table.lookup(0).is_none());
    }
}
