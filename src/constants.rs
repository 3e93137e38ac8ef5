pub const LOG_BYTES_IN_PAGE: u8 = 12;
pub const PAGE_SIZE: usize = 1 << LOG_BYTES_IN_PAGE;

pub const LOG_BYTES_IN_GBYTE: u8 = 30;
pub const BYTES_IN_GBYTE: usize = 1 << LOG_BYTES_IN_GBYTE;

/// Allocations at or above this size are candidates for management by the
/// preload shim. Smaller mappings stay on the kernel's default paging path.
pub const LARGE_ALLOC_THRESHOLD: usize = BYTES_IN_GBYTE;

/// Policy thread wake interval.
pub const POLICY_INTERVAL_MS: u64 = 10;

/// Fixed capacity of the managed-region table.
pub const MAX_MANAGED_REGIONS: usize = 64;

/// Bucket count for the page-statistics table. Prime, near one million.
pub const PAGE_STATS_HASH_SIZE: usize = 1_048_583;

/// Bucket count for the sampler record table. Prime.
pub const SAMPLE_HASH_SIZE: usize = 65_537;

/// Hardware sample period: one sample every ~100K memory operations.
pub const SAMPLE_PERIOD: u64 = 100_007;

/// Ring buffer size per sample stream: header page + 2^8 data pages.
pub const SAMPLE_BUFFER_PAGES: usize = 1 + (1 << 8);

/// Heat score above which a slow-tier page is promoted.
pub const HOT_THRESHOLD: f64 = 0.7;
/// Heat score below which a fast-tier page is demoted.
pub const COLD_THRESHOLD: f64 = 0.3;
/// Minimum policy confidence to act on a decision.
pub const CONFIDENCE_MIN: f64 = 0.5;

/// Minimum residence time after a migration before the page may move again.
pub const MIN_RESIDENCE_NS: u64 = 100_000_000;

/// Rate limit on migrations executed per policy cycle.
pub const MAX_MIGRATIONS_PER_CYCLE: u32 = 10;

/// Exponential decay rate of the heat recency factor, per second of
/// inactivity (half-life of roughly ten seconds).
pub const HEAT_DECAY: f64 = 0.07;

/// Access rate (accesses per second) treated as fully "hot" when computing
/// the heat frequency factor.
pub const HOT_ACCESS_RATE: f64 = 1000.0;

pub const RECENCY_WEIGHT: f64 = 0.6;
pub const FREQUENCY_WEIGHT: f64 = 0.4;

/// Emit a status line every this many policy cycles (~1 second).
pub const STATUS_INTERVAL_CYCLES: u64 = 100;

/// Poll timeout on the fault channel, bounding shutdown latency.
pub const FAULT_POLL_TIMEOUT_MS: i32 = 100;

/// Collector poll interval for the sampler ring buffers.
pub const COLLECTOR_INTERVAL_MS: u64 = 1;
