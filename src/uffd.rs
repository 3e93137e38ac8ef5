//! Fault channel: userfaultfd plumbing.
//!
//! The channel delivers missing-page faults for registered ranges to the
//! fault-handler thread, which resolves each fault by installing a zeroed
//! page through the copy ioctl. The kernel ABI (ioctl numbers and message
//! layout) is declared here; the fault-handling logic itself lives with the
//! manager, which owns the tier and statistics state.

use anyhow::{Context, Result};
use std::io;

use crate::constants::PAGE_SIZE;

// ---------------------------------------------------------------------------
// Kernel ABI (linux/userfaultfd.h)
// ---------------------------------------------------------------------------

const IOC_WRITE: libc::c_ulong = 1;
const IOC_READ: libc::c_ulong = 2;

const fn ioc(dir: libc::c_ulong, ty: libc::c_ulong, nr: libc::c_ulong, size: usize) -> libc::c_ulong {
    (dir << 30) | ((size as libc::c_ulong) << 16) | (ty << 8) | nr
}

/// Requested API version in the handshake.
const UFFD_API: u64 = 0xAA;
/// ioctl type byte for all userfaultfd requests.
const UFFDIO: libc::c_ulong = 0xAA;

const UFFDIO_API: libc::c_ulong = ioc(IOC_READ | IOC_WRITE, UFFDIO, 0x3F, 24);
const UFFDIO_REGISTER: libc::c_ulong = ioc(IOC_READ | IOC_WRITE, UFFDIO, 0x00, 32);
const UFFDIO_UNREGISTER: libc::c_ulong = ioc(IOC_READ, UFFDIO, 0x01, 16);
const UFFDIO_COPY: libc::c_ulong = ioc(IOC_READ | IOC_WRITE, UFFDIO, 0x03, 40);

const UFFDIO_REGISTER_MODE_MISSING: u64 = 1 << 0;

pub const UFFD_EVENT_PAGEFAULT: u8 = 0x12;

#[repr(C)]
#[allow(dead_code)]
struct UffdioApi {
    api: u64,
    features: u64,
    ioctls: u64,
}

#[repr(C)]
#[allow(dead_code)]
struct UffdioRange {
    start: u64,
    len: u64,
}

#[repr(C)]
#[allow(dead_code)]
struct UffdioRegister {
    range: UffdioRange,
    mode: u64,
    ioctls: u64,
}

#[repr(C)]
#[allow(dead_code)]
struct UffdioCopy {
    dst: u64,
    src: u64,
    len: u64,
    mode: u64,
    copy: i64,
}

/// One event read from the channel. Only pagefault events carry meaning
/// for us; the argument words are interpreted per the event type.
#[repr(C)]
#[allow(dead_code)]
pub struct UffdMsg {
    pub event: u8,
    reserved1: u8,
    reserved2: u16,
    reserved3: u32,
    arg: [u64; 3],
}

impl UffdMsg {
    pub fn pagefault_flags(&self) -> u64 {
        self.arg[0]
    }

    pub fn pagefault_address(&self) -> u64 {
        self.arg[1]
    }
}

// ---------------------------------------------------------------------------
// Zero-page source buffer
// ---------------------------------------------------------------------------

#[repr(C, align(4096))]
struct PageBuf([u8; PAGE_SIZE]);

thread_local! {
    // The copy ioctl reads from a page-aligned source buffer; one zeroed
    // page per thread outlives any in-flight ioctl on that thread.
    static ZERO_PAGE: Box<PageBuf> = Box::new(PageBuf([0; PAGE_SIZE]));
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

pub enum CopyOutcome {
    /// The kernel installed the page and woke the faulting thread.
    Installed,
    /// Another resolution beat us to this page. Benign race.
    AlreadyMapped,
}

pub enum PollOutcome {
    Ready,
    TimedOut,
    HangUp,
}

pub struct UffdChannel {
    fd: libc::c_int,
}

impl UffdChannel {
    /// Creates the channel and negotiates the API version. The feature
    /// request is left empty for portability across kernel versions.
    pub fn create() -> Result<UffdChannel> {
        let fd = unsafe {
            libc::syscall(
                libc::SYS_userfaultfd,
                libc::O_CLOEXEC | libc::O_NONBLOCK,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error()).context(
                "userfaultfd syscall failed (requires Linux >= 4.3 and either \
                 CAP_SYS_PTRACE or vm.unprivileged_userfaultfd = 1)",
            );
        }
        let channel = UffdChannel {
            fd: fd as libc::c_int,
        };

        let mut api = UffdioApi {
            api: UFFD_API,
            features: 0,
            ioctls: 0,
        };
        let ret = unsafe { libc::ioctl(channel.fd, UFFDIO_API, &mut api) };
        if ret < 0 {
            return Err(io::Error::last_os_error()).context("UFFDIO_API handshake failed");
        }
        info!("fault channel initialized (fd={})", channel.fd);
        Ok(channel)
    }

    pub fn raw_fd(&self) -> libc::c_int {
        self.fd
    }

    /// Registers `[start, start + len)` for missing-page fault delivery.
    pub fn register_range(&self, start: u64, len: usize) -> Result<()> {
        let mut register = UffdioRegister {
            range: UffdioRange {
                start,
                len: len as u64,
            },
            mode: UFFDIO_REGISTER_MODE_MISSING,
            ioctls: 0,
        };
        let ret = unsafe { libc::ioctl(self.fd, UFFDIO_REGISTER, &mut register) };
        if ret < 0 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("UFFDIO_REGISTER failed for 0x{:x}+{}", start, len));
        }
        Ok(())
    }

    pub fn unregister_range(&self, start: u64, len: usize) -> Result<()> {
        let mut range = UffdioRange {
            start,
            len: len as u64,
        };
        let ret = unsafe { libc::ioctl(self.fd, UFFDIO_UNREGISTER, &mut range) };
        if ret < 0 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("UFFDIO_UNREGISTER failed for 0x{:x}+{}", start, len));
        }
        Ok(())
    }

    /// Resolves a missing-page fault by installing a zeroed page at `dst`
    /// (which must be page-aligned). A concurrent resolution of the same
    /// page surfaces as `AlreadyMapped`.
    pub fn copy_zero_page(&self, dst: u64) -> Result<CopyOutcome> {
        let src = ZERO_PAGE.with(|z| z.0.as_ptr() as u64);
        let mut copy = UffdioCopy {
            dst,
            src,
            len: PAGE_SIZE as u64,
            mode: 0,
            copy: 0,
        };
        let ret = unsafe { libc::ioctl(self.fd, UFFDIO_COPY, &mut copy) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EEXIST) {
                debug!("page 0x{:x} already mapped", dst);
                return Ok(CopyOutcome::AlreadyMapped);
            }
            return Err(err).with_context(|| format!("UFFDIO_COPY failed for 0x{:x}", dst));
        }
        Ok(CopyOutcome::Installed)
    }

    /// Waits up to `timeout_ms` for the channel to become readable.
    pub fn poll_readable(&self, timeout_ms: i32) -> Result<PollOutcome> {
        let mut pollfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(PollOutcome::TimedOut);
            }
            return Err(err).context("poll on fault channel failed");
        }
        if ret == 0 {
            return Ok(PollOutcome::TimedOut);
        }
        if pollfd.revents & (libc::POLLERR | libc::POLLHUP) != 0 {
            return Ok(PollOutcome::HangUp);
        }
        Ok(PollOutcome::Ready)
    }

    /// Reads one event. Returns `None` when nothing is pending or a partial
    /// message was dropped.
    pub fn read_event(&self) -> Result<Option<UffdMsg>> {
        let mut msg = std::mem::MaybeUninit::<UffdMsg>::uninit();
        let want = std::mem::size_of::<UffdMsg>();
        let n = unsafe { libc::read(self.fd, msg.as_mut_ptr() as *mut libc::c_void, want) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EAGAIN) {
                return Ok(None);
            }
            return Err(err).context("read from fault channel failed");
        }
        if n as usize != want {
            error!("partial read from fault channel: {} bytes", n);
            return Ok(None);
        }
        Ok(Some(unsafe { msg.assume_init() }))
    }
}

impl Drop for UffdChannel {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
