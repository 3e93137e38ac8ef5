//! Per-page access statistics.
//!
//! Each tracked page carries the raw counters updated on the fault path and
//! by the sampler merge, plus the derived features (heat score, access
//! rate) recomputed by the policy thread each cycle. The counters are the
//! feature vector a learned migration policy consumes.

use std::fmt::{self, Display};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::constants::*;
use crate::table::{ChainedTable, PageKeyed};
use crate::tier::TierKind;
use crate::util::now_ns;

pub struct PageStats {
    page_addr: u64,

    /// Total accesses. Equals `read_count + write_count` at quiescent
    /// points (the sampler merge restores the equality).
    pub access_count: AtomicU64,
    pub read_count: AtomicU64,
    pub write_count: AtomicU64,

    first_access_ns: u64,
    pub last_access_ns: AtomicU64,
    allocation_ns: u64,

    // Derived features, written only by the policy thread. Stored as f64
    // bits so the entry stays share-able without a lock.
    heat_bits: AtomicU64,
    rate_bits: AtomicU64,

    current_tier: AtomicU8,
    pub last_migration_ns: AtomicU64,
    pub migration_count: AtomicU32,
}

impl PageKeyed for PageStats {
    fn create(page_addr: u64, now_ns: u64) -> Self {
        PageStats {
            page_addr,
            access_count: AtomicU64::new(0),
            read_count: AtomicU64::new(0),
            write_count: AtomicU64::new(0),
            first_access_ns: now_ns,
            last_access_ns: AtomicU64::new(now_ns),
            allocation_ns: now_ns,
            heat_bits: AtomicU64::new(0f64.to_bits()),
            rate_bits: AtomicU64::new(0f64.to_bits()),
            current_tier: AtomicU8::new(TierKind::Unknown as u8),
            last_migration_ns: AtomicU64::new(0),
            migration_count: AtomicU32::new(0),
        }
    }

    fn page_addr(&self) -> u64 {
        self.page_addr
    }
}

impl PageStats {
    pub fn page_addr(&self) -> u64 {
        self.page_addr
    }

    pub fn first_access_ns(&self) -> u64 {
        self.first_access_ns
    }

    pub fn allocation_ns(&self) -> u64 {
        self.allocation_ns
    }

    pub fn heat_score(&self) -> f64 {
        f64::from_bits(self.heat_bits.load(Ordering::Relaxed))
    }

    pub fn access_rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Relaxed))
    }

    pub fn current_tier(&self) -> TierKind {
        TierKind::from_u8(self.current_tier.load(Ordering::Relaxed))
    }

    pub fn set_current_tier(&self, tier: TierKind) {
        self.current_tier.store(tier as u8, Ordering::Relaxed);
    }

    pub(crate) fn set_heat_score(&self, heat: f64) {
        self.heat_bits.store(heat.to_bits(), Ordering::Relaxed);
    }

    fn set_access_rate(&self, rate: f64) {
        self.rate_bits.store(rate.to_bits(), Ordering::Relaxed);
    }

    /// Records one access: atomic counter bumps plus an atomic timestamp
    /// store. Called on the fault path, so it must stay cheap.
    pub fn note_access(&self, is_write: bool, now: u64) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
        if is_write {
            self.write_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.read_count.fetch_add(1, Ordering::Relaxed);
        }
        self.last_access_ns.store(now, Ordering::Relaxed);
    }

    /// Recomputes the derived features at time `now`.
    ///
    /// Access rate is accesses per second over the page's lifetime. The
    /// heat score combines a recency factor decaying at `HEAT_DECAY` per
    /// second since the last access with a frequency factor that saturates
    /// at `HOT_ACCESS_RATE` accesses per second, weighted 0.6/0.4 and
    /// clamped to [0, 1].
    pub fn compute_features(&self, now: u64) {
        let access_count = self.access_count.load(Ordering::Relaxed);
        let last_access = self.last_access_ns.load(Ordering::Relaxed);

        let lifetime_ns = now.saturating_sub(self.allocation_ns);
        let rate = if lifetime_ns > 0 {
            access_count as f64 * 1e9 / lifetime_ns as f64
        } else {
            0.0
        };
        self.set_access_rate(rate);

        let idle_secs = now.saturating_sub(last_access) as f64 / 1e9;
        let recency = (-HEAT_DECAY * idle_secs).exp();
        let frequency = (rate / HOT_ACCESS_RATE).min(1.0);
        let heat = (RECENCY_WEIGHT * recency + FREQUENCY_WEIGHT * frequency).clamp(0.0, 1.0);
        self.set_heat_score(heat);
    }
}

/// Aggregate view of the tracked pages, logged with the periodic status
/// line and at shutdown. A page counts as hot above heat 0.5.
pub struct StatsSummary {
    pub total_pages: u64,
    pub hot_pages: u64,
    pub cold_pages: u64,
    pub avg_heat: f64,
}

impl Display for StatsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "page stats: {} total, {} hot, {} cold, avg heat {:.3}",
            self.total_pages, self.hot_pages, self.cold_pages, self.avg_heat
        )
    }
}

pub struct PageStatsTable {
    table: ChainedTable<PageStats>,
}

impl PageStatsTable {
    pub fn new() -> Self {
        PageStatsTable {
            table: ChainedTable::new(PAGE_STATS_HASH_SIZE),
        }
    }

    pub fn lookup(&self, addr: u64) -> Option<Arc<PageStats>> {
        self.table.lookup(addr)
    }

    pub fn get_or_insert(&self, addr: u64) -> Arc<PageStats> {
        self.table.get_or_insert(addr)
    }

    /// Records an access to the page containing `addr`, creating the entry
    /// on first touch.
    pub fn record_access(&self, addr: u64, is_write: bool) {
        self.get_or_insert(addr).note_access(is_write, now_ns());
    }

    /// Recomputes derived features for every tracked page.
    pub fn update_all(&self, now: u64) {
        self.table.for_each(|entry| entry.compute_features(now));
    }

    pub fn pages_tracked(&self) -> u64 {
        self.table.len()
    }

    pub fn bucket_count(&self) -> usize {
        self.table.bucket_count()
    }

    pub fn bucket_entries(&self, idx: usize) -> Vec<Arc<PageStats>> {
        self.table.bucket_entries(idx)
    }

    pub fn for_each<F: FnMut(&Arc<PageStats>)>(&self, f: F) {
        self.table.for_each(f)
    }

    pub fn clear(&self) {
        self.table.clear()
    }

    pub fn summary(&self) -> StatsSummary {
        let mut hot = 0u64;
        let mut cold = 0u64;
        let mut total_heat = 0.0;
        self.table.for_each(|entry| {
            let heat = entry.heat_score();
            total_heat += heat;
            if heat > 0.5 {
                hot += 1;
            } else {
                cold += 1;
            }
        });
        let total = self.table.len();
        StatsSummary {
            total_pages: total,
            hot_pages: hot,
            cold_pages: cold,
            avg_heat: if total > 0 {
                total_heat / total as f64
            } else {
                0.0
            },
        }
    }
}

impl Default for PageStatsTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::PAGE_SIZE;
    use crate::table::PageKeyed;

    #[test]
    fn test_new_entry_state() {
        let entry = PageStats::create(0x1000, 123);
        assert_eq!(entry.page_addr(), 0x1000);
        assert_eq!(entry.access_count.load(Ordering::Relaxed), 0);
        assert_eq!(entry.first_access_ns(), 123);
        assert_eq!(entry.last_access_ns.load(Ordering::Relaxed), 123);
        assert_eq!(entry.allocation_ns(), 123);
        assert_eq!(entry.current_tier(), TierKind::Unknown);
        assert_eq!(entry.heat_score(), 0.0);
        assert_eq!(entry.migration_count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_record_access_counts() {
        let table = PageStatsTable::new();
        table.record_access(0x1000, false);
        table.record_access(0x1004, false);
        table.record_access(0x1008, true);
        let entry = table.lookup(0x1000).unwrap();
        assert_eq!(entry.access_count.load(Ordering::Relaxed), 3);
        assert_eq!(entry.read_count.load(Ordering::Relaxed), 2);
        assert_eq!(entry.write_count.load(Ordering::Relaxed), 1);
        assert!(
            entry.last_access_ns.load(Ordering::Relaxed) >= entry.first_access_ns(),
            "first access must not be after last access"
        );
        assert_eq!(table.pages_tracked(), 1);
    }

    #[test]
    fn test_features_hot_page() {
        let entry = PageStats::create(0x1000, 0);
        // 1000 accesses over one second, last access right now: fully hot.
        entry.access_count.store(1000, Ordering::Relaxed);
        entry.last_access_ns.store(1_000_000_000, Ordering::Relaxed);
        entry.compute_features(1_000_000_000);
        assert!((entry.access_rate() - 1000.0).abs() < 1e-6);
        assert!((entry.heat_score() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_features_cold_page() {
        let entry = PageStats::create(0x1000, 0);
        entry.access_count.store(3, Ordering::Relaxed);
        entry.last_access_ns.store(0, Ordering::Relaxed);
        // 100 seconds idle: recency has decayed to exp(-7).
        entry.compute_features(100_000_000_000);
        assert!(entry.heat_score() < COLD_THRESHOLD);
        assert!(entry.heat_score() >= 0.0);
    }

    #[test]
    fn test_features_zero_lifetime() {
        let entry = PageStats::create(0x1000, 77);
        entry.access_count.store(10, Ordering::Relaxed);
        entry.compute_features(77);
        assert_eq!(entry.access_rate(), 0.0);
    }

    #[test]
    fn test_heat_always_in_unit_interval() {
        let entry = PageStats::create(0x1000, 0);
        for (count, now) in [(0u64, 1u64), (1, 1), (1_000_000, 1), (5, u64::MAX / 2)] {
            entry.access_count.store(count, Ordering::Relaxed);
            entry.compute_features(now);
            let heat = entry.heat_score();
            assert!((0.0..=1.0).contains(&heat), "heat {} out of range", heat);
        }
    }

    #[test]
    fn test_update_all_and_summary() {
        let table = PageStatsTable::new();
        for i in 0..4u64 {
            let entry = table.get_or_insert(i * PAGE_SIZE as u64);
            entry.access_count.store(10_000, Ordering::Relaxed);
        }
        table.update_all(now_ns());
        let summary = table.summary();
        assert_eq!(summary.total_pages, 4);
        assert_eq!(summary.hot_pages + summary.cold_pages, 4);
        // Every page was touched moments ago, so the average heat is high.
        assert!(summary.avg_heat > 0.5);
        let line = format!("{}", summary);
        assert!(line.contains("4 total"));
    }

    #[test]
    fn test_clear() {
        let table = PageStatsTable::new();
        table.record_access(0x1000, false);
        table.clear();
        assert_eq!(table.pages_tracked(), 0);
        assert!(table.lookup(0x1000).is_none());
    }
}
