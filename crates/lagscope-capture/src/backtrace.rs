use crate::context::MachineContext;
use crate::cursor::{Cursor, StackCursor};
use crate::symbolicate::NoSymbolicator;
use crate::thread::{ThreadHandle, current_thread};

/// Fills `out` with the return addresses of `thread`, innermost first, and
/// returns how many were written. `out.len()` is the depth limit.
///
/// For the calling thread the first entry is the call site inside this
/// function, followed by its callers. For any other thread it starts wherever
/// the thread was when its registers were sampled. A thread whose registers
/// cannot be read yields 0.
#[inline(never)]
pub fn capture_backtrace(thread: ThreadHandle, out: &mut [usize]) -> usize {
    if out.is_empty() {
        return 0;
    }
    let context = if thread == current_thread() {
        MachineContext::capture_here()
    } else {
        MachineContext::capture(thread, false)
    };
    walk_context(&context, out)
}

/// [`capture_backtrace`] for the calling thread.
#[inline(never)]
pub fn capture_current_backtrace(out: &mut [usize]) -> usize {
    if out.is_empty() {
        return 0;
    }
    let context = MachineContext::capture_here();
    walk_context(&context, out)
}

/// Walks an already-captured context into `out`.
pub fn walk_context(context: &MachineContext, out: &mut [usize]) -> usize {
    let mut cursor = Cursor::frame_pointer(context, out.len(), &NoSymbolicator);
    drain_cursor(&mut cursor, out)
}

/// Advances `cursor` until it stops or `out` is full, storing each address.
pub fn drain_cursor(cursor: &mut dyn StackCursor, out: &mut [usize]) -> usize {
    let mut count = 0;
    while count < out.len() && cursor.advance() {
        out[count] = cursor.entry().address;
        count += 1;
    }
    count
}

/// Captures `thread` as a crashed context: registers, overflow probe and the
/// process's thread list.
pub fn capture_crash_context(thread: ThreadHandle) -> MachineContext {
    MachineContext::capture(thread, true)
}

/// Captures the calling thread as a crashed context from inside a signal
/// handler.
///
/// # Safety
///
/// Same contract as [`MachineContext::from_signal_context`].
#[cfg(unix)]
pub unsafe fn capture_crash_context_for_signal(ucontext: *const libc::c_void) -> MachineContext {
    unsafe { MachineContext::from_signal_context(ucontext, true) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_capacity_returns_zero() {
        assert_eq!(capture_backtrace(current_thread(), &mut []), 0);
        assert_eq!(capture_backtrace(ThreadHandle::from_raw(12345), &mut []), 0);
        assert_eq!(capture_current_backtrace(&mut []), 0);
    }

    #[cfg(all(
        any(target_os = "linux", target_os = "macos"),
        any(target_arch = "x86_64", target_arch = "aarch64")
    ))]
    #[test]
    fn current_thread_backtrace_is_not_empty() {
        let mut out = [0usize; 64];
        let count = capture_backtrace(current_thread(), &mut out);
        assert!(count > 1, "expected a real stack, got {count} entries");
        assert!(out[..count].iter().all(|&address| address > 1));
    }

    #[cfg(all(
        any(target_os = "linux", target_os = "macos"),
        any(target_arch = "x86_64", target_arch = "aarch64")
    ))]
    #[test]
    fn capacity_bounds_the_backtrace() {
        let mut out = [0usize; 3];
        let count = capture_current_backtrace(&mut out);
        assert!(count <= 3);
        assert!(count > 0);
    }

    #[test]
    fn drain_stops_at_capacity() {
        let addresses = [0x1000, 0x2000, 0x3000, 0x4000];
        let mut cursor = Cursor::backtrace(&addresses, 0, &NoSymbolicator);
        let mut out = [0usize; 2];
        assert_eq!(drain_cursor(&mut cursor, &mut out), 2);
        assert_eq!(out, [0x1000, 0x2000]);
    }

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
    #[test]
    fn walk_context_matches_the_synthetic_chain() {
        use crate::walker::tests::SyntheticStack;

        let stack = SyntheticStack::new(6);
        let context = stack.context(0x4444);
        let mut out = [0usize; 16];
        let count = walk_context(&context, &mut out);
        assert_eq!(count, 6);
        assert_eq!(out[0], 0x4444);
        assert_eq!(out[1], SyntheticStack::FIRST_RETURN);
    }
}
