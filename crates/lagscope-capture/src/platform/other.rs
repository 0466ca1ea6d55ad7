use crate::arch::RegisterState;
use crate::error::CaptureError;
use crate::thread::{ThreadHandle, ThreadList};
use std::sync::atomic::{AtomicU64, Ordering};

fn unsupported() -> CaptureError {
    CaptureError::UnsupportedPlatform {
        target_os: std::env::consts::OS,
    }
}

static NEXT_THREAD_TAG: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TAG: u64 = NEXT_THREAD_TAG.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn current_thread() -> ThreadHandle {
    ThreadHandle::from_raw(THREAD_TAG.with(|tag| *tag))
}

pub(crate) fn release_thread(_thread: ThreadHandle) {}

pub(crate) fn enumerate_threads<const CAP: usize>(
    _list: &mut ThreadList<CAP>,
) -> Result<(), CaptureError> {
    Err(unsupported())
}

pub(crate) fn thread_state(_thread: ThreadHandle) -> Result<RegisterState, CaptureError> {
    Err(unsupported())
}

pub(crate) fn install_sampler() -> Result<(), CaptureError> {
    Err(unsupported())
}

pub(crate) fn copy_memory(_src: usize, _dst: &mut [u8]) -> usize {
    0
}
