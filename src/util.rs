use anyhow::Result;

use crate::constants::{LOG_BYTES_IN_PAGE, PAGE_SIZE};

/// Golden-ratio multiplier for the address hash.
const GOLDEN: u64 = 0x9E3779B97F4A7C15;

/// Current time in nanoseconds on the monotonic clock. Used for all
/// timestamp tracking.
pub fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Aligns an address down to the page boundary.
pub fn page_align(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

/// Maps a page-aligned address to a bucket index via a multiplicative hash
/// of its page frame number.
pub fn bucket_index(page_addr: u64, buckets: usize) -> usize {
    let pfn = page_addr >> LOG_BYTES_IN_PAGE;
    (pfn.wrapping_mul(GOLDEN) % buckets as u64) as usize
}

fn wrap_libc_call<T: PartialEq>(f: &dyn Fn() -> T, expect: T) -> Result<()> {
    let ret = f();
    if ret == expect {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error().into())
    }
}

/// Anonymous private NORESERVE mapping. Pages stay unbacked until touched,
/// which is what lets the fault channel observe first accesses.
pub fn mmap_noreserve(size: usize) -> Result<u64> {
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let flags = libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_NORESERVE;
    let ptr = unsafe { libc::mmap(std::ptr::null_mut(), size, prot, flags, -1, 0) };
    if ptr == libc::MAP_FAILED {
        Err(std::io::Error::last_os_error().into())
    } else {
        Ok(ptr as u64)
    }
}

pub fn munmap(start: u64, size: usize) -> Result<()> {
    let ptr = start as *mut libc::c_void;
    wrap_libc_call(&|| unsafe { libc::munmap(ptr, size) }, 0)
}
