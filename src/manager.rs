//! The tiered memory manager.
//!
//! Ties together the fault channel, the per-page statistics, the managed
//! regions, the hardware sampler, and the policy loop. The manager is a
//! process-wide singleton: constructed once behind a `OnceCell`, handed out
//! as `&'static`, and restartable across init/shutdown cycles.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use once_cell::sync::OnceCell;

use crate::constants::*;
use crate::policy::{MigrationDecision, MigrationPolicy, DEFAULT_POLICY};
use crate::region::RegionTable;
use crate::sampler::Sampler;
use crate::stats::PageStatsTable;
use crate::tier::{TierKind, TierTable};
use crate::uffd::{CopyOutcome, PollOutcome, UffdChannel, UFFD_EVENT_PAGEFAULT};
use crate::util::{now_ns, page_align};

static MANAGER: OnceCell<TieredManager> = OnceCell::new();

pub struct TieredManager {
    tiers: TierTable,
    stats: PageStatsTable,
    regions: RegionTable,
    sampler: Sampler,

    uffd: RwLock<Option<UffdChannel>>,
    policy: RwLock<Arc<dyn MigrationPolicy>>,

    running: AtomicBool,
    fault_thread: Mutex<Option<JoinHandle<()>>>,
    policy_thread: Mutex<Option<JoinHandle<()>>>,

    total_faults: AtomicU64,
    total_migrations: AtomicU64,
    policy_cycles: AtomicU64,
}

impl TieredManager {
    fn new() -> Self {
        Self::with_tiers(TierTable::new())
    }

    fn with_tiers(tiers: TierTable) -> Self {
        TieredManager {
            tiers,
            stats: PageStatsTable::new(),
            regions: RegionTable::new(),
            sampler: Sampler::new(),
            uffd: RwLock::new(None),
            policy: RwLock::new(DEFAULT_POLICY.clone()),
            running: AtomicBool::new(false),
            fault_thread: Mutex::new(None),
            policy_thread: Mutex::new(None),
            total_faults: AtomicU64::new(0),
            total_migrations: AtomicU64::new(0),
            policy_cycles: AtomicU64::new(0),
        }
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    pub fn stats(&self) -> &PageStatsTable {
        &self.stats
    }

    pub fn regions(&self) -> &RegionTable {
        &self.regions
    }

    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    pub fn total_faults(&self) -> u64 {
        self.total_faults.load(Ordering::Relaxed)
    }

    pub fn total_migrations(&self) -> u64 {
        self.total_migrations.load(Ordering::Relaxed)
    }

    pub fn policy_cycles(&self) -> u64 {
        self.policy_cycles.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Brings the manager up: fault channel, sampler (best-effort), and the
    /// two background threads. Calling it while running is a no-op.
    fn start(&'static self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            debug!("manager already initialized");
            return Ok(());
        }
        info!("initializing tiered memory manager");
        info!(
            "tiers: {}={}GB, {}={}GB",
            self.tiers.fast().name,
            self.tiers.fast().capacity / BYTES_IN_GBYTE,
            self.tiers.slow().name,
            self.tiers.slow().capacity / BYTES_IN_GBYTE
        );

        let channel = UffdChannel::create()?;
        *self.uffd.write().unwrap() = Some(channel);

        // The sampler is a co-observer: losing it costs signal quality, not
        // correctness.
        match self.sampler.setup() {
            Ok(()) => {
                if let Err(e) = self.sampler.start() {
                    error!("failed to start hardware sampler: {:#}", e);
                }
            }
            Err(e) => {
                info!("hardware sampler inactive: {:#}", e);
            }
        }

        self.running.store(true, Ordering::SeqCst);

        let fault = std::thread::Builder::new()
            .name("memtier-fault".into())
            .spawn(move || self.fault_loop());
        let fault = match fault {
            Ok(handle) => handle,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                self.sampler.shutdown();
                *self.uffd.write().unwrap() = None;
                return Err(e).context("failed to spawn fault handler thread");
            }
        };
        *self.fault_thread.lock().unwrap() = Some(fault);

        let policy = std::thread::Builder::new()
            .name("memtier-policy".into())
            .spawn(move || self.policy_loop());
        match policy {
            Ok(handle) => {
                *self.policy_thread.lock().unwrap() = Some(handle);
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                if let Some(handle) = self.fault_thread.lock().unwrap().take() {
                    let _ = handle.join();
                }
                self.sampler.shutdown();
                *self.uffd.write().unwrap() = None;
                return Err(e).context("failed to spawn policy thread");
            }
        }

        info!("tiered memory manager initialized");
        Ok(())
    }

    /// Tears the manager down: threads, sampler, kernel registrations, and
    /// the statistics table, in that order.
    fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("shutting down tiered memory manager");

        if let Some(handle) = self.policy_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.fault_thread.lock().unwrap().take() {
            let _ = handle.join();
        }

        self.sampler.shutdown();

        info!(
            "final statistics: {} faults, {} migrations, {} policy cycles, {} pages tracked",
            self.total_faults(),
            self.total_migrations(),
            self.policy_cycles(),
            self.stats.pages_tracked()
        );
        info!("{}", self.stats.summary());

        {
            let guard = self.uffd.read().unwrap();
            if let Some(channel) = guard.as_ref() {
                for (base, len) in self.regions.deactivate_all() {
                    if let Err(e) = channel.unregister_range(base, len) {
                        error!("{:#}", e);
                    }
                }
            }
        }
        *self.uffd.write().unwrap() = None;

        self.stats.clear();
        info!("tiered memory manager shutdown complete");
    }

    // -----------------------------------------------------------------------
    // Region management
    // -----------------------------------------------------------------------

    /// Places `[addr, addr + length)` under management: pages in the range
    /// are left unbacked and resolved through the fault channel on first
    /// touch.
    pub fn register(&self, addr: u64, length: usize) -> Result<()> {
        let guard = self.uffd.read().unwrap();
        let channel = guard
            .as_ref()
            .ok_or_else(|| anyhow!("fault channel not initialized"))?;
        let slot = self
            .regions
            .insert_with(addr, length, channel.raw_fd(), || {
                channel.register_range(addr, length)
            })?;
        info!(
            "registered managed region 0x{:x} + {} bytes (slot {})",
            addr, length, slot
        );
        Ok(())
    }

    /// Removes the region starting at `addr` from management. No-op if the
    /// address is not a registered base.
    pub fn unregister(&self, addr: u64) {
        if let Some((base, len)) = self.regions.deactivate(addr) {
            let guard = self.uffd.read().unwrap();
            if let Some(channel) = guard.as_ref() {
                if let Err(e) = channel.unregister_range(base, len) {
                    error!("{:#}", e);
                }
            }
            info!("unregistered managed region 0x{:x}", base);
        }
    }

    // -----------------------------------------------------------------------
    // Fault handling
    // -----------------------------------------------------------------------

    fn fault_loop(&self) {
        info!("fault handler thread running");
        while self.running.load(Ordering::SeqCst) {
            let guard = self.uffd.read().unwrap();
            let channel = match guard.as_ref() {
                Some(c) => c,
                None => break,
            };
            match channel.poll_readable(FAULT_POLL_TIMEOUT_MS) {
                Ok(PollOutcome::TimedOut) => continue,
                Ok(PollOutcome::HangUp) => {
                    error!("fault channel reported error state");
                    break;
                }
                Ok(PollOutcome::Ready) => match channel.read_event() {
                    Ok(Some(msg)) if msg.event == UFFD_EVENT_PAGEFAULT => {
                        let addr = msg.pagefault_address();
                        debug!(
                            "page fault at 0x{:x} (flags=0x{:x})",
                            addr,
                            msg.pagefault_flags()
                        );
                        let tier = self.decide_initial_tier(addr);
                        if let Err(e) = self.resolve_fault(channel, addr, tier) {
                            error!("{:#}", e);
                        }
                    }
                    Ok(Some(msg)) => {
                        debug!("unhandled fault event 0x{:x}", msg.event);
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        error!("{:#}", e);
                        break;
                    }
                },
                Err(e) => {
                    error!("{:#}", e);
                    break;
                }
            }
        }
        info!("fault handler thread exiting");
    }

    /// Picks the tier for a freshly touched page: fast while it has room,
    /// then slow, then fast again under protest when both are full.
    ///
    /// The faulting address is reserved for future placement models and is
    /// ignored by the capacity fallback.
    pub(crate) fn decide_initial_tier(&self, _addr: u64) -> TierKind {
        let fast = self.tiers.fast();
        if fast.used() + PAGE_SIZE <= fast.capacity {
            return TierKind::Fast;
        }
        let slow = self.tiers.slow();
        if slow.used() + PAGE_SIZE <= slow.capacity {
            return TierKind::Slow;
        }
        error!("both tiers full, placing in {} anyway", fast.name);
        TierKind::Fast
    }

    fn resolve_fault(&self, channel: &UffdChannel, fault_addr: u64, tier: TierKind) -> Result<()> {
        let page = page_align(fault_addr);
        match channel.copy_zero_page(page)? {
            CopyOutcome::Installed | CopyOutcome::AlreadyMapped => {
                self.note_page_installed(page, tier);
                Ok(())
            }
        }
    }

    /// Bookkeeping for a page that just materialized in `tier`: tier
    /// accounting, the statistics entry (with its first access, a read),
    /// the containing region's counters, and the global fault counter.
    pub(crate) fn note_page_installed(&self, page: u64, tier: TierKind) {
        if let Some(t) = self.tiers.get(tier) {
            t.charge(PAGE_SIZE);
        }
        let entry = self.stats.get_or_insert(page);
        entry.set_current_tier(tier);
        self.stats.record_access(page, false);
        self.regions.note_fault(page, tier);
        self.total_faults.fetch_add(1, Ordering::Relaxed);
        debug!("resolved fault at 0x{:x} -> {}", page, tier);
    }

    // -----------------------------------------------------------------------
    // Policy loop
    // -----------------------------------------------------------------------

    fn policy_loop(&self) {
        info!("policy thread running (interval={}ms)", POLICY_INTERVAL_MS);
        loop {
            std::thread::sleep(Duration::from_millis(POLICY_INTERVAL_MS));
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            let cycle = self.policy_cycles.fetch_add(1, Ordering::Relaxed) + 1;
            self.run_policy_cycle();

            if cycle % STATUS_INTERVAL_CYCLES == 0 {
                info!(
                    "policy cycle {}: {} pages, {} faults, {} migrations",
                    cycle,
                    self.stats.pages_tracked(),
                    self.total_faults(),
                    self.total_migrations()
                );
                info!("{}", self.stats.summary());
            }
        }
        info!("policy thread exiting");
    }

    /// One policy cycle: merge the sampler's records, refresh derived
    /// features, then scan entries and execute what the policy proposes.
    /// Entries are lifted out of each bucket under the shared lease and
    /// evaluated with the lease dropped, so migrations never run under the
    /// statistics lock. Returns the number of migrations executed.
    pub(crate) fn run_policy_cycle(&self) -> u32 {
        self.sampler.merge_into(&self.stats);
        self.stats.update_all(now_ns());

        let policy = self.policy.read().unwrap().clone();
        let mut migrations = 0u32;
        'scan: for bucket in 0..self.stats.bucket_count() {
            for entry in self.stats.bucket_entries(bucket) {
                let mut decision = MigrationDecision::default();
                if policy.evaluate(&entry, &mut decision)
                    && decision.confidence >= CONFIDENCE_MIN
                    && self.execute_migration(&decision).is_ok()
                {
                    migrations += 1;
                    if migrations >= MAX_MIGRATIONS_PER_CYCLE {
                        break 'scan;
                    }
                }
            }
        }
        migrations
    }

    /// Moves a page's accounting between tiers. The destination must have
    /// room; the data itself never moves in this simulator.
    pub(crate) fn execute_migration(&self, decision: &MigrationDecision) -> Result<()> {
        let entry = self
            .stats
            .lookup(decision.page_addr)
            .ok_or_else(|| anyhow!("no statistics for page 0x{:x}", decision.page_addr))?;
        let dest = self
            .tiers
            .get(decision.to_tier)
            .ok_or_else(|| anyhow!("invalid destination tier for 0x{:x}", decision.page_addr))?;

        if !dest.try_charge(PAGE_SIZE) {
            debug!(
                "destination tier {} full, skipping migration of 0x{:x}",
                dest.name, decision.page_addr
            );
            return Err(anyhow!("destination tier {} full", dest.name));
        }
        if let Some(src) = self.tiers.get(decision.from_tier) {
            src.discharge(PAGE_SIZE);
        }

        entry.set_current_tier(decision.to_tier);
        entry.last_migration_ns.store(now_ns(), Ordering::Relaxed);
        entry.migration_count.fetch_add(1, Ordering::Relaxed);
        self.total_migrations.fetch_add(1, Ordering::Relaxed);

        debug!(
            "migrated 0x{:x}: {} -> {} ({}, confidence {:.2})",
            decision.page_addr, decision.from_tier, decision.to_tier, decision.reason,
            decision.confidence
        );
        Ok(())
    }

    /// Installs a new policy; `None` restores the default heuristic. The
    /// next policy cycle picks up the swap.
    pub fn set_policy(&self, policy: Option<Arc<dyn MigrationPolicy>>) {
        let mut slot = self.policy.write().unwrap();
        match policy {
            Some(p) => {
                info!("migration policy set to {}", p.name());
                *slot = p;
            }
            None => {
                info!("migration policy reset to default heuristic");
                *slot = DEFAULT_POLICY.clone();
            }
        }
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    /// Human-readable snapshot of counters, tier occupancy, regions, and
    /// the sampler.
    pub fn render_status(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== tiered memory manager status ===");
        let _ = writeln!(out, "page faults handled: {}", self.total_faults());
        let _ = writeln!(out, "migrations performed: {}", self.total_migrations());
        let _ = writeln!(out, "policy cycles completed: {}", self.policy_cycles());
        let _ = writeln!(out, "pages tracked: {}", self.stats.pages_tracked());

        let _ = writeln!(out, "tiers:");
        for tier in [self.tiers.fast(), self.tiers.slow()] {
            let pct = if tier.capacity > 0 {
                100.0 * tier.used() as f64 / tier.capacity as f64
            } else {
                0.0
            };
            let _ = writeln!(
                out,
                "  {}: {}/{} bytes ({:.1}%)",
                tier.name,
                tier.used(),
                tier.capacity,
                pct
            );
        }

        let _ = writeln!(out, "managed regions: {}", self.regions.count());
        for (slot, region) in self.regions.snapshot() {
            let _ = writeln!(
                out,
                "  region {}: 0x{:x} + {} bytes, faults={}, fast={}, slow={}",
                slot, region.base, region.len, region.total_faults, region.pages_in_fast,
                region.pages_in_slow
            );
        }

        let sampler = self.sampler.stats();
        let _ = writeln!(
            out,
            "sampler: active={}, samples={} ({} reads, {} writes), throttle={}, errors={}",
            if sampler.active { "yes" } else { "no" },
            sampler.total_samples,
            sampler.read_samples,
            sampler.write_samples,
            sampler.throttle_events,
            sampler.errors
        );
        let _ = write!(out, "====================================");
        out
    }
}

// ---------------------------------------------------------------------------
// Process-wide handle
// ---------------------------------------------------------------------------

/// The singleton manager, if it has been constructed.
pub fn manager() -> Option<&'static TieredManager> {
    MANAGER.get()
}

/// Initializes (or re-initializes after shutdown) the tiered memory
/// manager. Idempotent while running.
pub fn init() -> Result<()> {
    MANAGER.get_or_init(TieredManager::new).start()
}

/// Stops threads, releases kernel resources, and drops all statistics.
pub fn shutdown() {
    if let Some(mgr) = MANAGER.get() {
        mgr.stop();
    }
}

/// Registers `[addr, addr + length)` for managed demand paging.
pub fn register(addr: u64, length: usize) -> Result<()> {
    manager()
        .ok_or_else(|| anyhow!("tiered memory manager not initialized"))?
        .register(addr, length)
}

/// Idempotent unregistration by region base address.
pub fn unregister(addr: u64) {
    if let Some(mgr) = manager() {
        mgr.unregister(addr);
    }
}

/// Swaps the migration policy; `None` restores the default heuristic.
pub fn set_policy(policy: Option<Arc<dyn MigrationPolicy>>) {
    if let Some(mgr) = manager() {
        mgr.set_policy(policy);
    }
}

/// Prints the manager status to stderr.
pub fn status() {
    match manager() {
        Some(mgr) => eprintln!("{}", mgr.render_status()),
        None => eprintln!("tiered memory manager not initialized"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::SampleKind;

    const REGION_BASE: u64 = 0x1_0000_0000;
    const REGION_LEN: usize = 16 << 20;

    fn test_manager(fast_capacity: usize, slow_capacity: usize) -> TieredManager {
        TieredManager::with_tiers(TierTable::with_capacities(fast_capacity, slow_capacity))
    }

    fn add_region(mgr: &TieredManager) {
        mgr.regions
            .insert_with(REGION_BASE, REGION_LEN, 3, || Ok(()))
            .unwrap();
    }

    /// A hot slow-tier entry the default policy will want to promote.
    fn add_hot_slow_page(mgr: &TieredManager, page: u64) {
        let entry = mgr.stats.get_or_insert(page);
        entry.access_count.store(1_000_000, Ordering::Relaxed);
        entry.read_count.store(1_000_000, Ordering::Relaxed);
        entry.last_access_ns.store(now_ns(), Ordering::Relaxed);
        entry.set_current_tier(TierKind::Slow);
        mgr.tiers.slow().charge(PAGE_SIZE);
    }

    #[test]
    fn test_single_fault_placement() {
        let mgr = test_manager(4 * BYTES_IN_GBYTE, 16 * BYTES_IN_GBYTE);
        add_region(&mgr);

        let fault_addr = REGION_BASE + 7;
        let tier = mgr.decide_initial_tier(fault_addr);
        assert_eq!(tier, TierKind::Fast);
        mgr.note_page_installed(page_align(fault_addr), tier);

        assert_eq!(mgr.total_faults(), 1);
        assert_eq!(mgr.tiers.fast().used(), PAGE_SIZE);
        let entry = mgr.stats.lookup(REGION_BASE).expect("entry created");
        assert_eq!(entry.current_tier(), TierKind::Fast);
        assert_eq!(entry.access_count.load(Ordering::Relaxed), 1);
        assert_eq!(entry.read_count.load(Ordering::Relaxed), 1);
        let (_, region) = &mgr.regions.snapshot()[0];
        assert_eq!(region.total_faults, 1);
        assert_eq!(region.pages_in_fast, 1);
        // Global and per-region fault counts agree.
        assert_eq!(mgr.total_faults(), mgr.regions.total_faults());
    }

    #[test]
    fn test_capacity_driven_fallback() {
        let mgr = test_manager(PAGE_SIZE, 2 * PAGE_SIZE);
        add_region(&mgr);

        let first = mgr.decide_initial_tier(REGION_BASE);
        assert_eq!(first, TierKind::Fast);
        mgr.note_page_installed(REGION_BASE, first);

        let second_addr = REGION_BASE + PAGE_SIZE as u64;
        let second = mgr.decide_initial_tier(second_addr);
        assert_eq!(second, TierKind::Slow);
        mgr.note_page_installed(second_addr, second);

        assert_eq!(mgr.tiers.fast().used(), PAGE_SIZE);
        assert_eq!(mgr.tiers.slow().used(), PAGE_SIZE);
    }

    #[test]
    fn test_both_tiers_full_falls_back_to_fast() {
        let mgr = test_manager(0, 0);
        assert_eq!(mgr.decide_initial_tier(REGION_BASE), TierKind::Fast);
        // Placement still lands (and over-reports) in the fast tier.
        mgr.note_page_installed(REGION_BASE, TierKind::Fast);
        assert_eq!(mgr.tiers.fast().used(), PAGE_SIZE);
    }

    #[test]
    fn test_heat_driven_promotion_and_thrash_guard() {
        let mgr = test_manager(4 * BYTES_IN_GBYTE, 16 * BYTES_IN_GBYTE);
        add_hot_slow_page(&mgr, REGION_BASE);

        // The page is hot and resident in the slow tier: one promotion.
        let migrated = mgr.run_policy_cycle();
        assert_eq!(migrated, 1);
        let entry = mgr.stats.lookup(REGION_BASE).unwrap();
        assert_eq!(entry.current_tier(), TierKind::Fast);
        assert_eq!(entry.migration_count.load(Ordering::Relaxed), 1);
        assert!(entry.heat_score() > HOT_THRESHOLD);
        assert_eq!(mgr.tiers.fast().used(), PAGE_SIZE);
        assert_eq!(mgr.tiers.slow().used(), 0);
        assert_eq!(mgr.total_migrations(), 1);

        // An immediate second cycle migrates nothing: the page just moved.
        let migrated = mgr.run_policy_cycle();
        assert_eq!(migrated, 0);
        assert_eq!(entry.migration_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_migration_rate_limit() {
        let mgr = test_manager(4 * BYTES_IN_GBYTE, 16 * BYTES_IN_GBYTE);
        for i in 0..50u64 {
            add_hot_slow_page(&mgr, REGION_BASE + i * PAGE_SIZE as u64);
        }

        let migrated = mgr.run_policy_cycle();
        assert_eq!(migrated, MAX_MIGRATIONS_PER_CYCLE);
        assert_eq!(mgr.total_migrations(), MAX_MIGRATIONS_PER_CYCLE as u64);

        let mut still_slow = 0;
        mgr.stats.for_each(|entry| {
            if entry.current_tier() == TierKind::Slow {
                still_slow += 1;
            }
        });
        assert_eq!(still_slow, 40);
        assert_eq!(mgr.tiers.fast().used(), 10 * PAGE_SIZE);
        assert_eq!(mgr.tiers.slow().used(), 40 * PAGE_SIZE);
    }

    #[test]
    fn test_migration_rejected_when_destination_full() {
        let mgr = test_manager(PAGE_SIZE, 16 * BYTES_IN_GBYTE);
        // The fast tier is already at capacity.
        mgr.tiers.fast().charge(PAGE_SIZE);
        add_hot_slow_page(&mgr, REGION_BASE);

        let migrated = mgr.run_policy_cycle();
        assert_eq!(migrated, 0);
        let entry = mgr.stats.lookup(REGION_BASE).unwrap();
        assert_eq!(entry.current_tier(), TierKind::Slow);
        assert_eq!(entry.migration_count.load(Ordering::Relaxed), 0);
        // Accounting never exceeds capacity on the migration path.
        assert!(mgr.tiers.fast().used() <= mgr.tiers.fast().capacity);
        assert_eq!(mgr.tiers.slow().used(), PAGE_SIZE);
    }

    #[test]
    fn test_execute_migration_without_entry_fails() {
        let mgr = test_manager(4 * BYTES_IN_GBYTE, 16 * BYTES_IN_GBYTE);
        let decision = MigrationDecision {
            page_addr: 0x9000,
            from_tier: TierKind::Slow,
            to_tier: TierKind::Fast,
            confidence: 1.0,
            reason: "test",
        };
        assert!(mgr.execute_migration(&decision).is_err());
        assert_eq!(mgr.total_migrations(), 0);
    }

    #[test]
    fn test_sampler_merge_feeds_policy_cycle() {
        let mgr = test_manager(4 * BYTES_IN_GBYTE, 16 * BYTES_IN_GBYTE);
        // Only the sampler has seen this page.
        mgr.sampler
            .record_sample(REGION_BASE + 123, 40, SampleKind::Read, now_ns());
        mgr.run_policy_cycle();

        let entry = mgr.stats.lookup(REGION_BASE).expect("merge created entry");
        assert_eq!(entry.read_count.load(Ordering::Relaxed), SAMPLE_PERIOD);
        assert_eq!(
            entry.access_count.load(Ordering::Relaxed),
            entry.read_count.load(Ordering::Relaxed)
                + entry.write_count.load(Ordering::Relaxed)
        );
        // Derived features were refreshed in the same cycle.
        assert!(entry.heat_score() > 0.0);
    }

    struct VetoPolicy;
    impl MigrationPolicy for VetoPolicy {
        fn evaluate(&self, _stats: &PageStats, _decision: &mut MigrationDecision) -> bool {
            false
        }
        fn name(&self) -> &'static str {
            "veto"
        }
    }

    use crate::stats::PageStats;

    #[test]
    fn test_policy_swap_and_restore() {
        let mgr = test_manager(4 * BYTES_IN_GBYTE, 16 * BYTES_IN_GBYTE);
        add_hot_slow_page(&mgr, REGION_BASE);

        mgr.set_policy(Some(Arc::new(VetoPolicy)));
        assert_eq!(mgr.run_policy_cycle(), 0);

        // Restoring the default lets the promotion through.
        mgr.set_policy(None);
        assert_eq!(mgr.run_policy_cycle(), 1);
    }

    #[test]
    fn test_low_confidence_decisions_are_ignored() {
        struct Timid;
        impl MigrationPolicy for Timid {
            fn evaluate(&self, stats: &PageStats, decision: &mut MigrationDecision) -> bool {
                decision.page_addr = stats.page_addr();
                decision.from_tier = stats.current_tier();
                decision.to_tier = TierKind::Fast;
                decision.confidence = CONFIDENCE_MIN / 2.0;
                decision.reason = "hesitant";
                true
            }
        }
        let mgr = test_manager(4 * BYTES_IN_GBYTE, 16 * BYTES_IN_GBYTE);
        add_hot_slow_page(&mgr, REGION_BASE);
        mgr.set_policy(Some(Arc::new(Timid)));
        assert_eq!(mgr.run_policy_cycle(), 0);
        assert_eq!(mgr.total_migrations(), 0);
    }

    #[test]
    fn test_render_status() {
        let mgr = test_manager(4 * BYTES_IN_GBYTE, 16 * BYTES_IN_GBYTE);
        add_region(&mgr);
        mgr.note_page_installed(REGION_BASE, TierKind::Fast);

        let status = mgr.render_status();
        assert!(status.contains("page faults handled: 1"));
        assert!(status.contains("DRAM: 4096/"));
        assert!(status.contains("NVM: 0/"));
        assert!(status.contains("managed regions: 1"));
        assert!(status.contains("region 0: 0x100000000 + 16777216 bytes"));
        assert!(status.contains("sampler: active=no"));
    }

    // Full end-to-end fault resolution against the live kernel interface.
    // Requires userfaultfd privileges.
    #[test]
    #[ignore]
    fn test_live_fault_resolution() {
        use crate::util::{mmap_noreserve, munmap};

        init().unwrap();
        let len = 4 * (1 << 20);
        let base = mmap_noreserve(len).unwrap();
        register(base, len).unwrap();

        // Touching the unbacked page suspends this thread until the fault
        // thread installs a zero page.
        unsafe {
            std::ptr::write_volatile(base as *mut u8, 0xAB);
            assert_eq!(std::ptr::read_volatile(base as *const u8), 0xAB);
            assert_eq!(
                std::ptr::read_volatile((base + PAGE_SIZE as u64 / 2) as *const u8),
                0
            );
        }

        let mgr = manager().unwrap();
        for _ in 0..50 {
            if mgr.stats().lookup(base).is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let entry = mgr.stats().lookup(base).expect("fault recorded");
        assert!(matches!(
            entry.current_tier(),
            TierKind::Fast | TierKind::Slow
        ));

        unregister(base);
        munmap(base, len).unwrap();
        shutdown();
    }
}
