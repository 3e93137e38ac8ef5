#[macro_use]
extern crate lazy_static;

#[macro_use]
extern crate log;

pub mod api;
#[allow(dead_code)]
mod constants;
mod manager;
mod policy;
mod region;
mod sampler;
mod stats;
mod table;
mod tier;
mod uffd;
mod util;

pub use crate::constants::{LARGE_ALLOC_THRESHOLD, PAGE_SIZE};
pub use crate::manager::{
    init, manager, register, set_policy, shutdown, status, unregister, TieredManager,
};
pub use crate::policy::{DefaultPolicy, MigrationDecision, MigrationPolicy};
pub use crate::region::{ManagedRegion, RegionTable};
pub use crate::sampler::{SampleKind, SampleRecord, Sampler, SamplerStats};
pub use crate::stats::{PageStats, PageStatsTable, StatsSummary};
pub use crate::tier::{Tier, TierKind, TierTable};
pub use crate::util::{mmap_noreserve, munmap, now_ns, page_align};
