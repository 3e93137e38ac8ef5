//! Simulated memory tiers.
//!
//! Two tiers back every managed page: a small fast tier ("DRAM") and a
//! large slow tier ("NVM"). This implementation is a simulator: the tiers
//! carry accounting and latency hints only, no backing memory, and a
//! migration never moves bytes.

use std::fmt::{self, Display};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::constants::BYTES_IN_GBYTE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TierKind {
    Unknown = 0,
    Fast = 1,
    Slow = 2,
}

impl TierKind {
    pub fn from_u8(raw: u8) -> TierKind {
        match raw {
            1 => TierKind::Fast,
            2 => TierKind::Slow,
            _ => TierKind::Unknown,
        }
    }
}

impl Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierKind::Unknown => write!(f, "unknown"),
            TierKind::Fast => write!(f, "DRAM"),
            TierKind::Slow => write!(f, "NVM"),
        }
    }
}

pub struct Tier {
    pub name: &'static str,
    pub capacity: usize,
    used: AtomicU64,
    pub read_latency_ns: u64,
    pub write_latency_ns: u64,
}

impl Tier {
    fn new(name: &'static str, capacity: usize, read_latency_ns: u64, write_latency_ns: u64) -> Self {
        Tier {
            name,
            capacity,
            used: AtomicU64::new(0),
            read_latency_ns,
            write_latency_ns,
        }
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed) as usize
    }

    /// Unconditional accounting for fault-path placement. When both tiers
    /// are full the fault path still places into the fast tier, so `used`
    /// may exceed `capacity` here.
    pub fn charge(&self, bytes: usize) {
        self.used.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Admission-checked accounting for migrations. Fails without changing
    /// `used` when the tier cannot take `bytes` more.
    pub fn try_charge(&self, bytes: usize) -> bool {
        self.used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                let next = used + bytes as u64;
                if next <= self.capacity as u64 {
                    Some(next)
                } else {
                    None
                }
            })
            .is_ok()
    }

    pub fn discharge(&self, bytes: usize) {
        let _ = self
            .used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                Some(used.saturating_sub(bytes as u64))
            });
    }
}

pub struct TierTable {
    fast: Tier,
    slow: Tier,
}

impl TierTable {
    /// Default configuration: 4 GiB of simulated DRAM at 80/100 ns and
    /// 16 GiB of simulated NVM at 300/500 ns.
    pub fn new() -> Self {
        Self::with_capacities(4 * BYTES_IN_GBYTE, 16 * BYTES_IN_GBYTE)
    }

    pub fn with_capacities(fast_capacity: usize, slow_capacity: usize) -> Self {
        TierTable {
            fast: Tier::new("DRAM", fast_capacity, 80, 100),
            slow: Tier::new("NVM", slow_capacity, 300, 500),
        }
    }

    pub fn fast(&self) -> &Tier {
        &self.fast
    }

    pub fn slow(&self) -> &Tier {
        &self.slow
    }

    pub fn get(&self, kind: TierKind) -> Option<&Tier> {
        match kind {
            TierKind::Fast => Some(&self.fast),
            TierKind::Slow => Some(&self.slow),
            TierKind::Unknown => None,
        }
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self::new()
    }
}
