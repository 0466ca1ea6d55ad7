#![cfg(all(
    any(target_os = "linux", target_os = "macos"),
    any(target_arch = "x86_64", target_arch = "aarch64")
))]

use lagscope_capture::{RegisterSource, capture_crash_context_for_signal, walk_context};
use std::hint::black_box;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

const CRASH_SIGNAL: libc::c_int = libc::SIGUSR1;
const MAX_ENTRIES: usize = 64;

static HANDLED: AtomicBool = AtomicBool::new(false);
static FROM_SIGNAL: AtomicBool = AtomicBool::new(false);
static CRASHED: AtomicBool = AtomicBool::new(false);
static OVERFLOW: AtomicBool = AtomicBool::new(false);
static THREADS: AtomicUsize = AtomicUsize::new(0);
static COUNT: AtomicUsize = AtomicUsize::new(0);

extern "C" fn on_crash_signal(
    _sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    let context = unsafe { capture_crash_context_for_signal(ucontext.cast_const()) };
    let mut out = [0usize; MAX_ENTRIES];
    let count = walk_context(&context, &mut out);

    FROM_SIGNAL.store(
        context.is_signal_context() && context.register_source() == RegisterSource::SignalContext,
        Ordering::Relaxed,
    );
    CRASHED.store(context.is_crashed_context(), Ordering::Relaxed);
    OVERFLOW.store(context.is_stack_overflow(), Ordering::Relaxed);
    THREADS.store(context.thread_count(), Ordering::Relaxed);
    COUNT.store(count, Ordering::Relaxed);
    HANDLED.store(true, Ordering::Release);
}

fn install_crash_handler() {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_crash_signal as *const () as libc::sighandler_t;
        action.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut action.sa_mask);
        assert_eq!(
            libc::sigaction(CRASH_SIGNAL, &action, std::ptr::null_mut()),
            0
        );
    }
}

#[inline(never)]
fn recurse_then_raise(depth: usize) -> usize {
    if depth == 0 {
        unsafe { libc::raise(CRASH_SIGNAL) };
        return 0;
    }
    black_box(recurse_then_raise(black_box(depth - 1))) + 1
}

#[derive(Debug)]
struct Outcome {
    from_signal: bool,
    crashed: bool,
    overflow: bool,
    threads: usize,
    count: usize,
}

fn crash_at_depth(depth: usize) -> Outcome {
    HANDLED.store(false, Ordering::Release);
    std::thread::Builder::new()
        .name("crashing".to_owned())
        .stack_size(8 << 20)
        .spawn(move || recurse_then_raise(depth))
        .expect("failed to spawn crashing thread")
        .join()
        .expect("crashing thread should not panic");
    assert!(HANDLED.load(Ordering::Acquire), "signal handler never ran");
    Outcome {
        from_signal: FROM_SIGNAL.load(Ordering::Relaxed),
        crashed: CRASHED.load(Ordering::Relaxed),
        overflow: OVERFLOW.load(Ordering::Relaxed),
        threads: THREADS.load(Ordering::Relaxed),
        count: COUNT.load(Ordering::Relaxed),
    }
}

// One test, so the two crashes never share the handler's statics.
#[test]
fn crash_handler_walks_the_interrupted_stack() {
    install_crash_handler();

    let shallow = crash_at_depth(10);
    assert!(shallow.from_signal, "{shallow:?}");
    assert!(shallow.crashed, "{shallow:?}");
    assert!(!shallow.overflow, "{shallow:?}");
    assert!(shallow.threads >= 2, "{shallow:?}");
    assert!(shallow.count > 10, "{shallow:?}");
    assert!(shallow.count < MAX_ENTRIES, "{shallow:?}");

    let deep = crash_at_depth(300);
    assert!(deep.from_signal, "{deep:?}");
    assert!(deep.overflow, "{deep:?}");
    assert_eq!(deep.count, MAX_ENTRIES, "{deep:?}");
}
