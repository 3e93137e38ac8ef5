//! C-compatible surface for the allocation shim.
//!
//! The preload shim that intercepts large anonymous mappings links against
//! the cdylib and drives the manager through these entry points. Errors are
//! reported as negative statuses; the library never exits the process.
//!
//! A policy written in C registers an `extern "C"` callback that receives a
//! plain-data snapshot of the page's statistics and fills in a raw
//! decision; the adapter below bridges it onto [`MigrationPolicy`].

use std::os::raw::{c_char, c_int, c_void};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::manager;
use crate::policy::{MigrationDecision, MigrationPolicy};
use crate::stats::PageStats;
use crate::tier::TierKind;

/// Snapshot of one page's statistics, in plain C layout.
#[repr(C)]
pub struct RawPageStats {
    pub page_addr: u64,
    pub access_count: u64,
    pub read_count: u64,
    pub write_count: u64,
    pub first_access_ns: u64,
    pub last_access_ns: u64,
    pub allocation_ns: u64,
    pub heat_score: f64,
    pub access_rate: f64,
    pub current_tier: u8,
    pub last_migration_ns: u64,
    pub migration_count: u32,
}

impl RawPageStats {
    fn snapshot(stats: &PageStats) -> Self {
        RawPageStats {
            page_addr: stats.page_addr(),
            access_count: stats.access_count.load(Ordering::Relaxed),
            read_count: stats.read_count.load(Ordering::Relaxed),
            write_count: stats.write_count.load(Ordering::Relaxed),
            first_access_ns: stats.first_access_ns(),
            last_access_ns: stats.last_access_ns.load(Ordering::Relaxed),
            allocation_ns: stats.allocation_ns(),
            heat_score: stats.heat_score(),
            access_rate: stats.access_rate(),
            current_tier: stats.current_tier() as u8,
            last_migration_ns: stats.last_migration_ns.load(Ordering::Relaxed),
            migration_count: stats.migration_count.load(Ordering::Relaxed),
        }
    }
}

/// Decision filled by an external policy callback.
#[repr(C)]
pub struct RawMigrationDecision {
    pub page_addr: u64,
    pub from_tier: u8,
    pub to_tier: u8,
    pub confidence: f64,
    /// Optional diagnostic string owned by the callback. Not retained.
    pub reason: *const c_char,
}

pub type RawPolicyFn =
    extern "C" fn(stats: *const RawPageStats, decision: *mut RawMigrationDecision) -> bool;

struct RawPolicyAdapter(RawPolicyFn);

impl MigrationPolicy for RawPolicyAdapter {
    fn evaluate(&self, stats: &PageStats, decision: &mut MigrationDecision) -> bool {
        let raw_stats = RawPageStats::snapshot(stats);
        let mut raw = RawMigrationDecision {
            page_addr: 0,
            from_tier: TierKind::Unknown as u8,
            to_tier: TierKind::Unknown as u8,
            confidence: 0.0,
            reason: std::ptr::null(),
        };
        if !(self.0)(&raw_stats, &mut raw) {
            return false;
        }
        decision.page_addr = raw.page_addr;
        decision.from_tier = TierKind::from_u8(raw.from_tier);
        decision.to_tier = TierKind::from_u8(raw.to_tier);
        decision.confidence = raw.confidence;
        decision.reason = "external policy";
        true
    }

    fn name(&self) -> &'static str {
        "external"
    }
}

/// Initializes the manager. Returns 0 on success (including when already
/// initialized) and -1 on failure.
#[no_mangle]
pub extern "C" fn memtier_init() -> c_int {
    match manager::init() {
        Ok(()) => 0,
        Err(e) => {
            error!("{:#}", e);
            -1
        }
    }
}

#[no_mangle]
pub extern "C" fn memtier_shutdown() {
    manager::shutdown();
}

/// Registers `[addr, addr + length)` for managed demand paging. The address
/// must be page-aligned and must not overlap an existing region; the length
/// must be a multiple of the page size. Returns 0 on success.
#[no_mangle]
pub extern "C" fn memtier_register(addr: *mut c_void, length: usize) -> c_int {
    match manager::register(addr as u64, length) {
        Ok(()) => 0,
        Err(e) => {
            error!("{:#}", e);
            -1
        }
    }
}

/// Removes the region starting at `addr` from management. No-op if the
/// address is not a registered base.
#[no_mangle]
pub extern "C" fn memtier_unregister(addr: *mut c_void) {
    manager::unregister(addr as u64);
}

/// Installs an external policy callback; a null pointer restores the
/// default heuristic. The swap takes effect on the next policy cycle.
#[no_mangle]
pub extern "C" fn memtier_set_policy(policy: Option<RawPolicyFn>) {
    manager::set_policy(policy.map(|f| Arc::new(RawPolicyAdapter(f)) as Arc<dyn MigrationPolicy>));
}

/// Prints the manager status to stderr.
#[no_mangle]
pub extern "C" fn memtier_status() {
    manager::status();
}

/// Shuts the manager down when the library is unloaded, mirroring an
/// explicit `memtier_shutdown` the host application never made.
#[ctor::dtor]
fn shutdown_on_unload() {
    manager::shutdown();
}
