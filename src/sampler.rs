//! Statistical hardware sampler.
//!
//! A co-observer that supplements fault-based access data with sampled
//! load/store events from the CPU's precise-event facility. Two sample
//! streams (reads and writes) are opened in precise mode and drained by a
//! collector thread into per-page sample records; the policy thread merges
//! those records into the page-statistics table each cycle.
//!
//! The sampler is best-effort: when the facility is unavailable (wrong
//! hardware, perf_event_paranoid too strict) setup fails, the manager logs
//! it, and the sampler stays inactive for the life of the process.

use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use std::io;

use crate::constants::*;
use crate::stats::PageStatsTable;
use crate::table::{ChainedTable, PageKeyed};
use crate::util::{now_ns, page_align};

// ---------------------------------------------------------------------------
// Kernel ABI (linux/perf_event.h)
// ---------------------------------------------------------------------------

const PERF_TYPE_RAW: u32 = 4;

const PERF_SAMPLE_IP: u64 = 1 << 0;
const PERF_SAMPLE_TID: u64 = 1 << 1;
const PERF_SAMPLE_ADDR: u64 = 1 << 3;
const PERF_SAMPLE_WEIGHT: u64 = 1 << 14;

const PERF_RECORD_THROTTLE: u32 = 5;
const PERF_RECORD_UNTHROTTLE: u32 = 6;
const PERF_RECORD_SAMPLE: u32 = 9;

const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;

const PERF_ATTR_SIZE_VER5: u32 = 112;

// Bit positions in the perf_event_attr flag word.
const ATTR_DISABLED: u64 = 1 << 0;
const ATTR_EXCLUDE_KERNEL: u64 = 1 << 5;
const ATTR_EXCLUDE_HV: u64 = 1 << 6;
const ATTR_PRECISE_IP_SHIFT: u64 = 15;
const ATTR_EXCLUDE_CALLCHAIN_KERNEL: u64 = 1 << 21;
const ATTR_EXCLUDE_CALLCHAIN_USER: u64 = 1 << 22;

/// perf_event_attr, version 5 layout. The flag bitfield is a single word
/// assembled from the `ATTR_*` bits above.
#[repr(C)]
#[allow(dead_code)]
struct PerfEventAttr {
    type_: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events: u32,
    bp_type: u32,
    config1: u64,
    config2: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    __reserved_2: u16,
}

/// Ring buffer header page. Only the data_* fields matter here; the
/// reserved block keeps `data_head` at its ABI offset of 1024.
#[repr(C)]
#[allow(dead_code)]
struct PerfEventMmapPage {
    version: u32,
    compat_version: u32,
    lock: u32,
    index: u32,
    offset: i64,
    time_enabled: u64,
    time_running: u64,
    capabilities: u64,
    pmc_width: u16,
    time_shift: u16,
    time_mult: u32,
    time_offset: u64,
    time_zero: u64,
    size: u32,
    __reserved_1: u32,
    time_cycles: u64,
    time_mask: u64,
    __reserved: [u8; 116 * 8],
    data_head: u64,
    data_tail: u64,
    data_offset: u64,
    data_size: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct PerfEventHeader {
    type_: u32,
    misc: u16,
    size: u16,
}

/// Sample record body for our sample_type: IP | TID | ADDR | WEIGHT.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct PerfSample {
    header: PerfEventHeader,
    ip: u64,
    pid: u32,
    tid: u32,
    addr: u64,
    weight: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleKind {
    Read,
    Write,
}

impl SampleKind {
    /// Raw event code: retired memory loads or stores, PEBS-capable.
    fn config(self) -> u64 {
        match self {
            SampleKind::Read => 0x80d1,  // MEM_LOAD_RETIRED.ALL_LOADS
            SampleKind::Write => 0x82d0, // MEM_INST_RETIRED.ALL_STORES
        }
    }
}

// ---------------------------------------------------------------------------
// Sample streams
// ---------------------------------------------------------------------------

struct PerfStream {
    fd: libc::c_int,
    ring: *mut PerfEventMmapPage,
    mmap_len: usize,
    kind: SampleKind,
}

// The ring pointer is only dereferenced by the collector while the stream
// table mutex is held; teardown takes the same mutex after the collector
// has been joined.
unsafe impl Send for PerfStream {}

impl PerfStream {
    fn open(kind: SampleKind) -> Result<PerfStream> {
        let mut attr: PerfEventAttr = unsafe { std::mem::zeroed() };
        attr.type_ = PERF_TYPE_RAW;
        attr.size = PERF_ATTR_SIZE_VER5;
        attr.config = kind.config();
        attr.sample_period = SAMPLE_PERIOD;
        attr.sample_type = PERF_SAMPLE_IP | PERF_SAMPLE_TID | PERF_SAMPLE_ADDR | PERF_SAMPLE_WEIGHT;
        attr.flags = ATTR_DISABLED
            | ATTR_EXCLUDE_KERNEL
            | ATTR_EXCLUDE_HV
            | ATTR_EXCLUDE_CALLCHAIN_KERNEL
            | ATTR_EXCLUDE_CALLCHAIN_USER
            | (1 << ATTR_PRECISE_IP_SHIFT);

        let fd = unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                &attr as *const PerfEventAttr,
                0 as libc::pid_t,
                -1 as libc::c_int,
                -1 as libc::c_int,
                0 as libc::c_ulong,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error()).with_context(|| {
                format!(
                    "perf_event_open failed for {:?} (config=0x{:x})",
                    kind,
                    kind.config()
                )
            });
        }
        let fd = fd as libc::c_int;

        let mmap_len = SAMPLE_BUFFER_PAGES * PAGE_SIZE;
        let ring = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mmap_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ring == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
            }
            return Err(err).context("mmap of sample ring buffer failed");
        }

        Ok(PerfStream {
            fd,
            ring: ring as *mut PerfEventMmapPage,
            mmap_len,
            kind,
        })
    }

    fn enable(&self) -> Result<()> {
        let ret = unsafe { libc::ioctl(self.fd, PERF_EVENT_IOC_ENABLE, 0) };
        if ret < 0 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("failed to enable {:?} sample stream", self.kind));
        }
        Ok(())
    }

    fn disable(&self) {
        unsafe {
            libc::ioctl(self.fd, PERF_EVENT_IOC_DISABLE, 0);
        }
    }

    fn close(self) {
        unsafe {
            libc::munmap(self.ring as *mut libc::c_void, self.mmap_len);
            libc::close(self.fd);
        }
    }
}

// ---------------------------------------------------------------------------
// Per-page sample records
// ---------------------------------------------------------------------------

pub struct SampleRecord {
    page_addr: u64,
    pub read_samples: AtomicU64,
    pub write_samples: AtomicU64,
    pub total_latency: AtomicU64,
    pub last_sample_ns: AtomicU64,
}

impl PageKeyed for SampleRecord {
    fn create(page_addr: u64, _now_ns: u64) -> Self {
        SampleRecord {
            page_addr,
            read_samples: AtomicU64::new(0),
            write_samples: AtomicU64::new(0),
            total_latency: AtomicU64::new(0),
            last_sample_ns: AtomicU64::new(0),
        }
    }

    fn page_addr(&self) -> u64 {
        self.page_addr
    }
}

impl SampleRecord {
    pub fn page_addr(&self) -> u64 {
        self.page_addr
    }
}

/// Snapshot of the sampler's global counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct SamplerStats {
    pub total_samples: u64,
    pub read_samples: u64,
    pub write_samples: u64,
    pub throttle_events: u64,
    pub errors: u64,
    pub active: bool,
}

// ---------------------------------------------------------------------------
// Sampler
// ---------------------------------------------------------------------------

pub struct Sampler {
    streams: Mutex<Vec<PerfStream>>,
    records: ChainedTable<SampleRecord>,
    initialized: AtomicBool,
    running: AtomicBool,
    collector: Mutex<Option<JoinHandle<()>>>,

    total_samples: AtomicU64,
    read_samples: AtomicU64,
    write_samples: AtomicU64,
    throttle_events: AtomicU64,
    errors: AtomicU64,
}

impl Sampler {
    pub fn new() -> Self {
        Sampler {
            streams: Mutex::new(Vec::new()),
            records: ChainedTable::new(SAMPLE_HASH_SIZE),
            initialized: AtomicBool::new(false),
            running: AtomicBool::new(false),
            collector: Mutex::new(None),
            total_samples: AtomicU64::new(0),
            read_samples: AtomicU64::new(0),
            write_samples: AtomicU64::new(0),
            throttle_events: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Opens both sample streams, disabled. Fails when the sampling
    /// facility is unavailable; the caller decides whether that is fatal.
    pub fn setup(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            debug!("sampler already initialized");
            return Ok(());
        }
        let read_stream = PerfStream::open(SampleKind::Read)
            .context("sampling facility unavailable for loads")?;
        let write_stream = match PerfStream::open(SampleKind::Write) {
            Ok(s) => s,
            Err(e) => {
                read_stream.close();
                return Err(e).context("sampling facility unavailable for stores");
            }
        };
        let mut streams = self.streams.lock().unwrap();
        streams.push(read_stream);
        streams.push(write_stream);
        self.initialized.store(true, Ordering::SeqCst);
        info!("hardware sampler initialized (period={})", SAMPLE_PERIOD);
        Ok(())
    }

    /// Enables the streams and spawns the collector loop.
    pub fn start(&'static self) -> Result<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(anyhow!("sampler not initialized"));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let streams = self.streams.lock().unwrap();
            for stream in streams.iter() {
                stream.enable()?;
            }
        }
        let handle = std::thread::Builder::new()
            .name("memtier-sampler".into())
            .spawn(move || self.collector_loop())
            .context("failed to spawn sampler collector")?;
        *self.collector.lock().unwrap() = Some(handle);
        info!("hardware sampling started");
        Ok(())
    }

    /// Stops collection without releasing the streams.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.collector.lock().unwrap().take() {
            let _ = handle.join();
        }
        let streams = self.streams.lock().unwrap();
        for stream in streams.iter() {
            stream.disable();
        }
        info!("hardware sampling stopped");
    }

    /// Stops collection, releases the kernel resources, and clears all
    /// records.
    pub fn shutdown(&self) {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop();
        let streams = std::mem::take(&mut *self.streams.lock().unwrap());
        for stream in streams {
            stream.close();
        }
        self.clear_records();
        info!("hardware sampler shut down");
    }

    pub fn is_active(&self) -> bool {
        self.initialized.load(Ordering::SeqCst) && self.running.load(Ordering::SeqCst)
    }

    fn collector_loop(&self) {
        info!("sampler collector thread running");
        while self.running.load(Ordering::Relaxed) {
            {
                let streams = self.streams.lock().unwrap();
                for stream in streams.iter() {
                    unsafe {
                        self.drain_stream(stream);
                    }
                }
            }
            std::thread::sleep(Duration::from_millis(COLLECTOR_INTERVAL_MS));
        }
        info!("sampler collector thread exiting");
    }

    /// Walks one stream's ring from data_tail to data_head, accumulating
    /// samples into the record table, then publishes the new tail.
    unsafe fn drain_stream(&self, stream: &PerfStream) {
        let page = stream.ring;
        let data_size = std::ptr::read_volatile(std::ptr::addr_of!((*page).data_size));
        if data_size == 0 {
            return;
        }
        let data = (page as *mut u8).add((*page).data_offset as usize);

        let head = std::ptr::read_volatile(std::ptr::addr_of!((*page).data_head));
        fence(Ordering::Acquire);
        let mut tail = (*page).data_tail;

        while tail != head {
            let mut header = PerfEventHeader {
                type_: 0,
                misc: 0,
                size: 0,
            };
            copy_from_ring(
                data,
                data_size as usize,
                tail,
                &mut header as *mut PerfEventHeader as *mut u8,
                std::mem::size_of::<PerfEventHeader>(),
            );
            if header.size == 0 {
                // Malformed record; abandon this drain rather than spin.
                self.errors.fetch_add(1, Ordering::Relaxed);
                break;
            }
            match header.type_ {
                PERF_RECORD_SAMPLE
                    if header.size as usize >= std::mem::size_of::<PerfSample>() =>
                {
                    let mut sample: PerfSample = std::mem::zeroed();
                    copy_from_ring(
                        data,
                        data_size as usize,
                        tail,
                        &mut sample as *mut PerfSample as *mut u8,
                        std::mem::size_of::<PerfSample>(),
                    );
                    self.record_sample(sample.addr, sample.weight, stream.kind, now_ns());
                }
                PERF_RECORD_THROTTLE | PERF_RECORD_UNTHROTTLE => {
                    self.throttle_events.fetch_add(1, Ordering::Relaxed);
                }
                _ => {}
            }
            tail += header.size as u64;
        }

        fence(Ordering::Release);
        std::ptr::write_volatile(std::ptr::addr_of_mut!((*page).data_tail), tail);
    }

    /// Accumulates one sample into its page record. Samples without an
    /// address are ignored.
    pub(crate) fn record_sample(&self, addr: u64, weight: u64, kind: SampleKind, now: u64) {
        if addr == 0 {
            return;
        }
        let record = self.records.get_or_insert(page_align(addr));
        match kind {
            SampleKind::Read => {
                record.read_samples.fetch_add(1, Ordering::Relaxed);
                self.read_samples.fetch_add(1, Ordering::Relaxed);
            }
            SampleKind::Write => {
                record.write_samples.fetch_add(1, Ordering::Relaxed);
                self.write_samples.fetch_add(1, Ordering::Relaxed);
            }
        }
        record.total_latency.fetch_add(weight, Ordering::Relaxed);
        record.last_sample_ns.store(now, Ordering::Relaxed);
        self.total_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Merges every sample record into the page-statistics table.
    ///
    /// Sample counts scaled by the sample period are statistical floors;
    /// fault-path counts are ground truth. Taking the max preserves the
    /// better signal and never decrements a counter.
    pub fn merge_into(&self, stats: &PageStatsTable) {
        self.records.for_each(|record| {
            let entry = stats.get_or_insert(record.page_addr());
            let estimated_reads = record
                .read_samples
                .load(Ordering::Relaxed)
                .saturating_mul(SAMPLE_PERIOD);
            let estimated_writes = record
                .write_samples
                .load(Ordering::Relaxed)
                .saturating_mul(SAMPLE_PERIOD);

            entry.read_count.fetch_max(estimated_reads, Ordering::Relaxed);
            entry
                .write_count
                .fetch_max(estimated_writes, Ordering::Relaxed);
            let total = entry.read_count.load(Ordering::Relaxed)
                + entry.write_count.load(Ordering::Relaxed);
            entry.access_count.store(total, Ordering::Relaxed);

            entry.last_access_ns.fetch_max(
                record.last_sample_ns.load(Ordering::Relaxed),
                Ordering::Relaxed,
            );
        });
    }

    pub fn lookup_record(&self, addr: u64) -> Option<Arc<SampleRecord>> {
        self.records.lookup(addr)
    }

    pub fn records_tracked(&self) -> u64 {
        self.records.len()
    }

    /// Drops all records and zeroes the global counters.
    pub fn clear_records(&self) {
        self.records.clear();
        self.total_samples.store(0, Ordering::Relaxed);
        self.read_samples.store(0, Ordering::Relaxed);
        self.write_samples.store(0, Ordering::Relaxed);
        self.throttle_events.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> SamplerStats {
        SamplerStats {
            total_samples: self.total_samples.load(Ordering::Relaxed),
            read_samples: self.read_samples.load(Ordering::Relaxed),
            write_samples: self.write_samples.load(Ordering::Relaxed),
            throttle_events: self.throttle_events.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            active: self.is_active(),
        }
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Copies `len` bytes out of the ring starting at absolute position `pos`,
/// splitting the copy when the record wraps past the ring's edge.
unsafe fn copy_from_ring(data: *const u8, data_size: usize, pos: u64, dst: *mut u8, len: usize) {
    let offset = (pos % data_size as u64) as usize;
    let first = len.min(data_size - offset);
    std::ptr::copy_nonoverlapping(data.add(offset), dst, first);
    if first < len {
        std::ptr::copy_nonoverlapping(data, dst.add(first), len - first);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abi_layouts() {
        assert_eq!(std::mem::size_of::<PerfEventAttr>(), 112);
        assert_eq!(std::mem::size_of::<PerfEventHeader>(), 8);
        assert_eq!(std::mem::size_of::<PerfSample>(), 40);
        // data_head must sit at its documented offset in the header page.
        let page: PerfEventMmapPage = unsafe { std::mem::zeroed() };
        let base = &page as *const _ as usize;
        assert_eq!(std::ptr::addr_of!(page.data_head) as usize - base, 1024);
        assert_eq!(std::ptr::addr_of!(page.data_tail) as usize - base, 1032);
        assert_eq!(std::ptr::addr_of!(page.data_offset) as usize - base, 1040);
        assert_eq!(std::ptr::addr_of!(page.data_size) as usize - base, 1048);
    }

    #[test]
    fn test_copy_from_ring_handles_wrap() {
        let ring: Vec<u8> = (0u8..16).collect();
        let mut out = [0u8; 6];
        // A record starting 3 bytes before the edge wraps to the front.
        unsafe {
            copy_from_ring(ring.as_ptr(), ring.len(), 13, out.as_mut_ptr(), out.len());
        }
        assert_eq!(out, [13, 14, 15, 0, 1, 2]);
        // Absolute positions larger than the ring reduce modulo its size.
        unsafe {
            copy_from_ring(
                ring.as_ptr(),
                ring.len(),
                16 * 5 + 2,
                out.as_mut_ptr(),
                out.len(),
            );
        }
        assert_eq!(out, [2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_record_sample_accumulates() {
        let sampler = Sampler::new();
        sampler.record_sample(0x2001, 30, SampleKind::Read, 100);
        sampler.record_sample(0x2abc, 50, SampleKind::Read, 200);
        sampler.record_sample(0x2fff, 20, SampleKind::Write, 300);
        // Address zero is dropped.
        sampler.record_sample(0, 99, SampleKind::Read, 400);

        let record = sampler.lookup_record(0x2000).unwrap();
        assert_eq!(record.read_samples.load(Ordering::Relaxed), 2);
        assert_eq!(record.write_samples.load(Ordering::Relaxed), 1);
        assert_eq!(record.total_latency.load(Ordering::Relaxed), 100);
        assert_eq!(record.last_sample_ns.load(Ordering::Relaxed), 300);

        let stats = sampler.stats();
        assert_eq!(stats.total_samples, 3);
        assert_eq!(stats.read_samples, 2);
        assert_eq!(stats.write_samples, 1);
        assert!(!stats.active);
        assert_eq!(sampler.records_tracked(), 1);
    }

    #[test]
    fn test_merge_takes_max_of_estimate_and_fault_count() {
        let sampler = Sampler::new();
        let stats = PageStatsTable::new();

        // Fault path saw five reads.
        let entry = stats.get_or_insert(0x3000);
        entry.read_count.store(5, Ordering::Relaxed);
        entry.access_count.store(5, Ordering::Relaxed);

        // One read sample scales to a much larger estimate.
        sampler.record_sample(0x3000, 10, SampleKind::Read, 42);
        sampler.merge_into(&stats);

        assert_eq!(entry.read_count.load(Ordering::Relaxed), SAMPLE_PERIOD);
        assert_eq!(entry.write_count.load(Ordering::Relaxed), 0);
        assert_eq!(entry.access_count.load(Ordering::Relaxed), SAMPLE_PERIOD);
    }

    #[test]
    fn test_merge_never_decrements() {
        let sampler = Sampler::new();
        let stats = PageStatsTable::new();

        // Fault path counts dwarf the sample estimate.
        let entry = stats.get_or_insert(0x4000);
        let big = SAMPLE_PERIOD * 10;
        entry.read_count.store(big, Ordering::Relaxed);
        entry.write_count.store(3, Ordering::Relaxed);
        entry.last_access_ns.store(1_000, Ordering::Relaxed);

        sampler.record_sample(0x4000, 10, SampleKind::Read, 500);
        sampler.merge_into(&stats);

        assert_eq!(entry.read_count.load(Ordering::Relaxed), big);
        assert_eq!(entry.write_count.load(Ordering::Relaxed), 3);
        assert_eq!(entry.access_count.load(Ordering::Relaxed), big + 3);
        // The stale sample timestamp does not move last_access backwards.
        assert_eq!(entry.last_access_ns.load(Ordering::Relaxed), 1_000);

        // Re-merging is idempotent: nothing decreases.
        sampler.merge_into(&stats);
        assert_eq!(entry.read_count.load(Ordering::Relaxed), big);
        assert_eq!(entry.access_count.load(Ordering::Relaxed), big + 3);
    }

    #[test]
    fn test_merge_creates_entries_and_advances_last_access() {
        let sampler = Sampler::new();
        let stats = PageStatsTable::new();

        sampler.record_sample(0x5000, 10, SampleKind::Write, u64::MAX / 2);
        sampler.merge_into(&stats);

        let entry = stats.lookup(0x5000).expect("merge creates the entry");
        assert_eq!(entry.write_count.load(Ordering::Relaxed), SAMPLE_PERIOD);
        assert_eq!(
            entry.access_count.load(Ordering::Relaxed),
            entry.read_count.load(Ordering::Relaxed)
                + entry.write_count.load(Ordering::Relaxed)
        );
        assert_eq!(entry.last_access_ns.load(Ordering::Relaxed), u64::MAX / 2);
    }

    #[test]
    fn test_clear_records() {
        let sampler = Sampler::new();
        sampler.record_sample(0x6000, 10, SampleKind::Read, 1);
        sampler.clear_records();
        assert_eq!(sampler.records_tracked(), 0);
        assert!(sampler.lookup_record(0x6000).is_none());
        assert_eq!(sampler.stats().total_samples, 0);
    }

    // Requires perf_event access (perf_event_paranoid permitting) and a
    // PEBS-capable CPU.
    #[test]
    #[ignore]
    fn test_live_setup_and_shutdown() {
        let sampler: &'static Sampler = Box::leak(Box::new(Sampler::new()));
        sampler.setup().unwrap();
        sampler.start().unwrap();
        assert!(sampler.is_active());
        std::thread::sleep(Duration::from_millis(50));
        sampler.stop();
        sampler.shutdown();
        assert!(!sampler.is_active());
    }
}
