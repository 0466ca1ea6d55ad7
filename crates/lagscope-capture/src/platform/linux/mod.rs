use crate::error::CaptureError;
use crate::thread::{ThreadHandle, ThreadList};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

mod memory;
mod sampler;

pub(crate) use memory::copy_memory;
pub use sampler::SAMPLE_TIMEOUT;
pub(crate) use sampler::{install_sampler, thread_state};

pub(crate) fn gettid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

pub(crate) fn current_thread() -> ThreadHandle {
    ThreadHandle::from_raw(gettid() as u64)
}

/// Thread ids are plain numbers on Linux; there is nothing to give back.
pub(crate) fn release_thread(_thread: ThreadHandle) {}

/// `struct linux_dirent64` header: d_ino (8), d_off (8), d_reclen (2), d_type (1).
const DIRENT_NAME_OFFSET: usize = 19;
const DIRENT_RECLEN_OFFSET: usize = 16;

#[repr(C, align(8))]
struct DirentBuffer([u8; 4096]);

pub(crate) fn enumerate_threads<const CAP: usize>(
    list: &mut ThreadList<CAP>,
) -> Result<(), CaptureError> {
    let raw = unsafe {
        libc::open(
            c"/proc/self/task".as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    };
    if raw < 0 {
        return Err(CaptureError::last_os_error("open(/proc/self/task)"));
    }
    // Closed on every return path below.
    let dir = unsafe { OwnedFd::from_raw_fd(raw) };

    let mut buffer = DirentBuffer([0; 4096]);
    loop {
        let read = unsafe {
            libc::syscall(
                libc::SYS_getdents64,
                dir.as_raw_fd(),
                buffer.0.as_mut_ptr(),
                buffer.0.len(),
            )
        };
        if read < 0 {
            return Err(CaptureError::last_os_error("getdents64"));
        }
        if read == 0 {
            return Ok(());
        }

        let filled = &buffer.0[..read as usize];
        let mut offset = 0;
        while offset + DIRENT_NAME_OFFSET <= filled.len() {
            let record = &filled[offset..];
            let reclen = u16::from_ne_bytes([
                record[DIRENT_RECLEN_OFFSET],
                record[DIRENT_RECLEN_OFFSET + 1],
            ]) as usize;
            if reclen < DIRENT_NAME_OFFSET || reclen > record.len() {
                break;
            }
            if let Some(tid) = parse_tid(&record[DIRENT_NAME_OFFSET..reclen]) {
                list.push(ThreadHandle::from_raw(tid));
            }
            offset += reclen;
        }
    }
}

/// Parses a NUL-terminated decimal directory name; `.` and `..` yield `None`.
fn parse_tid(name: &[u8]) -> Option<u64> {
    let len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
    let digits = &name[..len];
    if digits.is_empty() {
        return None;
    }
    let mut value: u64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value.checked_mul(10)?.checked_add(u64::from(b - b'0'))?;
    }
    (value != 0).then_some(value)
}
