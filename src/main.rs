//! Demo driver for the tiered memory manager.
//!
//! Initializes the manager, registers a small demand-paged region, and runs
//! a workload with hot and cold pages so the fault path, the sampler, and
//! the policy loop all have something to chew on. The region is deliberately
//! smaller than the shim's interception threshold so the demo works without
//! huge allocations.

#[macro_use]
extern crate log;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use memtier::*;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_signal(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

fn keep_going() -> bool {
    RUNNING.load(Ordering::SeqCst)
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Tiered memory manager demo", long_about = None)]
struct Args {
    /// Print LD_PRELOAD shim usage and exit.
    #[arg(long)]
    shim: bool,

    /// Size of the demo region in MiB.
    #[arg(long, default_value_t = 16)]
    region_mib: usize,

    /// Rounds of hot-set accesses in phase 2.
    #[arg(long, default_value_t = 50)]
    hot_rounds: usize,
}

fn print_shim_usage() {
    println!("The preload shim intercepts anonymous private mmap calls of");
    println!(
        "{} bytes or more and places them under managed demand paging.",
        LARGE_ALLOC_THRESHOLD
    );
    println!();
    println!("To run a real workload under management:");
    println!("  LD_PRELOAD=./target/release/libmemtier.so ./your_application");
}

/// Touches the first byte of every page, in parallel, so every page in the
/// region faults exactly once.
fn phase_sequential_touch(base: u64, num_pages: usize) {
    let threads = num_cpus::get().min(num_pages.max(1));
    info!(
        "phase 1: sequential initialization of {} pages on {} threads",
        num_pages, threads
    );
    let chunk = num_pages.div_ceil(threads);
    crossbeam::thread::scope(|scope| {
        for t in 0..threads {
            scope.spawn(move |_| {
                let start = t * chunk;
                let end = ((t + 1) * chunk).min(num_pages);
                for i in start..end {
                    if !keep_going() {
                        return;
                    }
                    let addr = base + (i * PAGE_SIZE) as u64;
                    unsafe {
                        std::ptr::write_volatile(addr as *mut u8, b'A');
                    }
                }
            });
        }
    })
    .expect("workload thread panicked");
}

/// Repeatedly hits the first tenth of the region with a mix of reads and
/// writes, building up a clearly hot set.
fn phase_hot_set(base: u64, num_pages: usize, rounds: usize) {
    let hot_pages = (num_pages / 10).max(1);
    info!("phase 2: heating the first {} pages", hot_pages);
    for round in 0..rounds {
        if !keep_going() {
            return;
        }
        for i in 0..hot_pages {
            let addr = base + (i * PAGE_SIZE) as u64;
            unsafe {
                if round % 3 == 0 {
                    let v = std::ptr::read_volatile(addr as *const u8);
                    std::ptr::write_volatile(addr as *mut u8, v.wrapping_add(1));
                } else {
                    std::ptr::read_volatile(addr as *const u8);
                }
            }
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Biased random traffic: seventy percent of accesses land in the hot set.
fn phase_random_access(base: u64, num_pages: usize) {
    info!("phase 3: biased random access");
    let hot_pages = (num_pages / 10).max(1);
    let mut rng = SmallRng::seed_from_u64(42);
    for i in 0..1000 {
        if !keep_going() {
            return;
        }
        let page = if rng.gen_range(0..100) < 70 {
            rng.gen_range(0..hot_pages)
        } else {
            rng.gen_range(hot_pages..num_pages.max(hot_pages + 1))
        };
        let addr = base + (page * PAGE_SIZE) as u64;
        unsafe {
            std::ptr::write_volatile(addr as *mut u8, (i & 0xFF) as u8);
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn run_demo(region_bytes: usize, hot_rounds: usize) -> Result<()> {
    init()?;

    info!("allocating demo region of {} bytes", region_bytes);
    let base = mmap_noreserve(region_bytes)?;
    if let Err(e) = register(base, region_bytes) {
        error!("failed to register demo region: {:#}", e);
        munmap(base, region_bytes)?;
        shutdown();
        return Err(e);
    }

    // Give the background threads a moment to come up.
    std::thread::sleep(Duration::from_secs(1));
    status();

    let num_pages = region_bytes / PAGE_SIZE;
    phase_sequential_touch(base, num_pages);
    if keep_going() {
        phase_hot_set(base, num_pages, hot_rounds);
    }
    if keep_going() {
        phase_random_access(base, num_pages);
    }

    info!("letting the policy thread settle");
    std::thread::sleep(Duration::from_secs(2));
    status();

    unregister(base);
    munmap(base, region_bytes)?;
    shutdown();
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.shim {
        print_shim_usage();
        return Ok(());
    }

    unsafe {
        libc::signal(libc::SIGINT, handle_signal as usize);
        libc::signal(libc::SIGTERM, handle_signal as usize);
    }

    run_demo(args.region_mib << 20, args.hot_rounds)
}
