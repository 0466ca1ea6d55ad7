use crate::error::CaptureError;
use crate::platform;

/// Upper bound on the threads recorded in a crashed context.
pub const MAX_CAPTURED_THREADS: usize = 100;

/// Opaque identifier of a schedulable OS thread in this process.
///
/// On Linux this is the kernel thread id (`gettid`); on macOS it is the Mach
/// port name of the thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ThreadHandle(u64);

impl ThreadHandle {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

/// Handle of the calling thread.
pub fn current_thread() -> ThreadHandle {
    platform::current_thread()
}

/// Fixed-capacity list of thread handles.
///
/// Never grows: handles past `CAP` are dropped at enumeration time (and their
/// OS resources released there). Handles the list keeps are released when the
/// list is dropped.
pub struct ThreadList<const CAP: usize = MAX_CAPTURED_THREADS> {
    handles: [ThreadHandle; CAP],
    len: usize,
    seen: usize,
}

impl<const CAP: usize> ThreadList<CAP> {
    pub const fn new() -> Self {
        Self {
            handles: [ThreadHandle(0); CAP],
            len: 0,
            seen: 0,
        }
    }

    pub const fn capacity(&self) -> usize {
        CAP
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Threads the OS reported, including those that did not fit.
    pub const fn total_seen(&self) -> usize {
        self.seen
    }

    pub const fn is_truncated(&self) -> bool {
        self.seen > self.len
    }

    pub fn as_slice(&self) -> &[ThreadHandle] {
        &self.handles[..self.len]
    }

    pub fn iter(&self) -> impl Iterator<Item = ThreadHandle> + '_ {
        self.as_slice().iter().copied()
    }

    pub fn contains(&self, thread: ThreadHandle) -> bool {
        self.as_slice().contains(&thread)
    }

    /// Records one reported thread. Returns `false` when the list is full, in
    /// which case the caller still owns whatever OS resource backs `thread`.
    pub(crate) fn push(&mut self, thread: ThreadHandle) -> bool {
        self.seen += 1;
        if self.len == CAP {
            return false;
        }
        self.handles[self.len] = thread;
        self.len += 1;
        true
    }

    pub(crate) fn clear(&mut self) {
        for thread in self.as_slice() {
            platform::release_thread(*thread);
        }
        self.len = 0;
        self.seen = 0;
    }
}

impl<const CAP: usize> Default for ThreadList<CAP> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CAP: usize> Drop for ThreadList<CAP> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<const CAP: usize> std::fmt::Debug for ThreadList<CAP> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadList")
            .field("threads", &self.as_slice())
            .field("total_seen", &self.seen)
            .finish()
    }
}

/// Lists every thread of this process into `list`, replacing its contents.
///
/// On failure the list is left empty.
pub fn enumerate_threads<const CAP: usize>(
    list: &mut ThreadList<CAP>,
) -> Result<(), CaptureError> {
    list.clear();
    let result = platform::enumerate_threads(list);
    if result.is_err() {
        list.clear();
    } else if list.is_truncated() {
        tracing::debug!(
            kept = list.len(),
            seen = list.total_seen(),
            "thread list truncated to capacity"
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_stops_at_capacity_but_counts_everything() {
        let mut list = ThreadList::<2>::new();
        assert!(list.push(ThreadHandle::from_raw(1)));
        assert!(list.push(ThreadHandle::from_raw(2)));
        assert!(!list.push(ThreadHandle::from_raw(3)));
        assert_eq!(list.len(), 2);
        assert_eq!(list.total_seen(), 3);
        assert!(list.is_truncated());
        assert_eq!(
            list.as_slice(),
            &[ThreadHandle::from_raw(1), ThreadHandle::from_raw(2)]
        );
        // Handles made up by the test must not reach the OS on drop.
        list.len = 0;
    }

    #[test]
    fn current_thread_is_stable_and_distinct_per_thread() {
        let here = current_thread();
        assert_eq!(here, current_thread());
        assert_ne!(here.as_raw(), 0);

        let other = std::thread::spawn(current_thread)
            .join()
            .expect("spawned thread should not panic");
        assert_ne!(here, other);
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    fn enumeration_includes_the_calling_thread() {
        let mut list = ThreadList::<{ MAX_CAPTURED_THREADS }>::new();
        enumerate_threads(&mut list).expect("enumeration should succeed");
        assert!(!list.is_empty());
        assert!(list.len() <= list.capacity());
        if !list.is_truncated() {
            assert!(list.contains(current_thread()));
        }
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    fn enumeration_truncates_to_capacity() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        let stop = Arc::new(AtomicBool::new(false));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        std::thread::sleep(std::time::Duration::from_millis(1));
                    }
                })
            })
            .collect();

        let mut list = ThreadList::<2>::new();
        let result = enumerate_threads(&mut list);

        stop.store(true, Ordering::Release);
        for worker in workers {
            worker.join().expect("worker should not panic");
        }

        result.expect("enumeration should succeed");
        assert_eq!(list.len(), 2);
        assert!(list.total_seen() >= 5);
        assert!(list.is_truncated());
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    fn repeated_enumeration_does_not_leak_os_resources() {
        // Far more iterations than the default descriptor / port budget, so a
        // leak per call turns into an enumeration failure.
        for _ in 0..4096 {
            let mut list = ThreadList::<4>::new();
            enumerate_threads(&mut list).expect("enumeration should keep succeeding");
        }
    }
}
