//! Guarded reads of this process's own memory.
//!
//! Both methods go through the kernel, which reports a bad source address as
//! an error instead of delivering SIGSEGV to us. `process_vm_readv` is tried
//! first; sandboxes that filter it (seccomp, old kernels) fall back to
//! `pread` on `/proc/self/mem`. The method that works is remembered.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, Ordering};

const UNPROBED: u8 = 0;
const VM_READV: u8 = 1;
const PROC_MEM: u8 = 2;
const UNAVAILABLE: u8 = 3;

static METHOD: AtomicU8 = AtomicU8::new(UNPROBED);
static PROC_MEM_FD: OnceLock<Option<OwnedFd>> = OnceLock::new();

pub(crate) fn copy_memory(src: usize, dst: &mut [u8]) -> usize {
    if dst.is_empty() {
        return 0;
    }
    match METHOD.load(Ordering::Relaxed) {
        VM_READV => vm_readv(src, dst).unwrap_or(0),
        PROC_MEM => proc_mem(src, dst).unwrap_or(0),
        UNAVAILABLE => 0,
        _ => probe(src, dst),
    }
}

fn probe(src: usize, dst: &mut [u8]) -> usize {
    let readv = vm_readv(src, dst);
    let method = choose_method(readv, || proc_mem_fd().is_some());
    METHOD.store(method, Ordering::Relaxed);
    match method {
        // The call works; a failure here is about this particular address.
        VM_READV => readv.unwrap_or(0),
        PROC_MEM => {
            tracing::debug!(?readv, "process_vm_readv unavailable, using /proc/self/mem");
            proc_mem(src, dst).unwrap_or(0)
        }
        _ => {
            tracing::warn!("no guarded memory read available; stack walks will be empty");
            0
        }
    }
}

/// Picks the read method from the outcome of the first `process_vm_readv`.
///
/// Only `ENOSYS` and `EPERM` mean the call itself is unusable; any other error
/// is about the address that was read.
fn choose_method(readv: Result<usize, i32>, proc_mem_available: impl FnOnce() -> bool) -> u8 {
    match readv {
        Ok(_) => VM_READV,
        Err(errno) if errno != libc::ENOSYS && errno != libc::EPERM => VM_READV,
        Err(_) => {
            if proc_mem_available() {
                PROC_MEM
            } else {
                UNAVAILABLE
            }
        }
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn vm_readv(src: usize, dst: &mut [u8]) -> Result<usize, i32> {
    let local = libc::iovec {
        iov_base: dst.as_mut_ptr().cast(),
        iov_len: dst.len(),
    };
    let remote = libc::iovec {
        iov_base: src as *mut libc::c_void,
        iov_len: dst.len(),
    };
    let copied = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
    if copied < 0 {
        return Err(last_errno());
    }
    Ok(copied as usize)
}

fn proc_mem_fd() -> Option<&'static OwnedFd> {
    PROC_MEM_FD
        .get_or_init(|| {
            let raw = unsafe {
                libc::open(
                    c"/proc/self/mem".as_ptr(),
                    libc::O_RDONLY | libc::O_CLOEXEC,
                )
            };
            (raw >= 0).then(|| unsafe { OwnedFd::from_raw_fd(raw) })
        })
        .as_ref()
}

fn proc_mem(src: usize, dst: &mut [u8]) -> Result<usize, i32> {
    let fd = proc_mem_fd().ok_or(libc::EBADF)?;
    let offset = libc::off_t::try_from(src).map_err(|_| libc::EINVAL)?;
    let copied = unsafe {
        libc::pread(
            fd.as_raw_fd(),
            dst.as_mut_ptr().cast(),
            dst.len(),
            offset,
        )
    };
    if copied < 0 {
        return Err(last_errno());
    }
    Ok(copied as usize)
}
