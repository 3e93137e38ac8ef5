//! Managed-region table.
//!
//! A fixed-capacity table of address ranges whose pages are resolved
//! through the fault channel. Slots are reused after unregistration.
//! Every operation, including the fault-path containment sweep, runs under
//! the table mutex; the table is small enough (64 slots) that the linear
//! scans stay cheap.

use std::sync::Mutex;

use anyhow::{anyhow, Result};

use crate::constants::{MAX_MANAGED_REGIONS, PAGE_SIZE};
use crate::tier::TierKind;

#[derive(Clone, Debug, Default)]
pub struct ManagedRegion {
    pub base: u64,
    pub len: usize,
    pub active: bool,
    /// Fault channel descriptor this range is registered with.
    pub uffd_fd: i32,
    pub total_faults: u64,
    pub pages_in_fast: u64,
    pub pages_in_slow: u64,
}

impl ManagedRegion {
    fn contains(&self, page: u64) -> bool {
        self.active && page >= self.base && page < self.base + self.len as u64
    }

    fn overlaps(&self, base: u64, len: usize) -> bool {
        self.active && base < self.base + self.len as u64 && self.base < base + len as u64
    }
}

pub struct RegionTable {
    inner: Mutex<Slots>,
}

struct Slots {
    slots: Vec<ManagedRegion>,
    count: usize,
}

impl RegionTable {
    pub fn new() -> Self {
        RegionTable {
            inner: Mutex::new(Slots {
                slots: vec![ManagedRegion::default(); MAX_MANAGED_REGIONS],
                count: 0,
            }),
        }
    }

    /// Claims a free slot for `[base, base + len)` and records it, invoking
    /// `register` (the kernel range registration) while the table lock is
    /// held so the slot claim and the kernel state change in step. The slot
    /// is only committed if `register` succeeds.
    ///
    /// The base must be page-aligned, the length a positive multiple of the
    /// page size, and the range must not overlap an active region.
    pub fn insert_with(
        &self,
        base: u64,
        len: usize,
        uffd_fd: i32,
        register: impl FnOnce() -> Result<()>,
    ) -> Result<usize> {
        if base == 0 || base & (PAGE_SIZE as u64 - 1) != 0 {
            return Err(anyhow!("region base 0x{:x} is not page-aligned", base));
        }
        if len == 0 || len % PAGE_SIZE != 0 {
            return Err(anyhow!(
                "region length {} is not a positive multiple of the page size",
                len
            ));
        }

        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.slots.iter().find(|s| s.overlaps(base, len)) {
            return Err(anyhow!(
                "region 0x{:x}+{} overlaps managed region 0x{:x}+{}",
                base,
                len,
                existing.base,
                existing.len
            ));
        }
        let slot = inner
            .slots
            .iter()
            .position(|s| !s.active)
            .ok_or_else(|| anyhow!("no free region slots (max={})", MAX_MANAGED_REGIONS))?;

        register()?;

        inner.slots[slot] = ManagedRegion {
            base,
            len,
            active: true,
            uffd_fd,
            total_faults: 0,
            pages_in_fast: 0,
            pages_in_slow: 0,
        };
        inner.count += 1;
        Ok(slot)
    }

    /// Marks the region starting at `base` inactive and returns its range
    /// for kernel unregistration. No-op (returns `None`) if no active
    /// region starts there, so double unregistration is harmless.
    pub fn deactivate(&self, base: u64) -> Option<(u64, usize)> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let slot = inner
            .slots
            .iter_mut()
            .find(|s| s.active && s.base == base)?;
        slot.active = false;
        let range = (slot.base, slot.len);
        inner.count -= 1;
        Some(range)
    }

    /// Marks every active region inactive, returning their ranges.
    pub fn deactivate_all(&self) -> Vec<(u64, usize)> {
        let mut inner = self.inner.lock().unwrap();
        let mut ranges = Vec::new();
        for slot in inner.slots.iter_mut() {
            if slot.active {
                slot.active = false;
                ranges.push((slot.base, slot.len));
            }
        }
        inner.count = 0;
        ranges
    }

    /// Attributes one fault at `page` to its containing region. Returns
    /// false if the page is in no active region.
    pub fn note_fault(&self, page: u64, tier: TierKind) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.slots.iter_mut().find(|s| s.contains(page)) {
            Some(slot) => {
                slot.total_faults += 1;
                match tier {
                    TierKind::Fast => slot.pages_in_fast += 1,
                    TierKind::Slow => slot.pages_in_slow += 1,
                    TierKind::Unknown => {}
                }
                true
            }
            None => false,
        }
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().count
    }

    /// Clones out the active slots (with their indexes) for status
    /// reporting.
    pub fn snapshot(&self) -> Vec<(usize, ManagedRegion)> {
        let inner = self.inner.lock().unwrap();
        inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.active)
            .map(|(i, s)| (i, s.clone()))
            .collect()
    }

    /// Sum of per-region fault counters across active regions.
    pub fn total_faults(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner
            .slots
            .iter()
            .filter(|s| s.active)
            .map(|s| s.total_faults)
            .sum()
    }
}

impl Default for RegionTable {
    fn default() -> Self {
        Self::new()
    }
}
