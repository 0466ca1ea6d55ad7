//! Register snapshots of other threads via `tgkill(SIGPROF)`.
//!
//! Linux has no call that reads another thread's registers from inside the
//! same process, so the capturer asks the kernel to interrupt the target with
//! a signal and the handler copies the interrupted `ucontext_t` registers out.
//! The handler does nothing else: no allocation, no locks, no waiting, and it
//! runs on the target thread without any code of the target's own taking
//! part.
//!
//! Requests live in a fixed array of slots. Each slot is one atomic word
//! packing the target tid with the slot state, so the handler can claim
//! exactly the requests addressed to its own thread with a single
//! compare-exchange.

use super::gettid;
use crate::arch::RegisterState;
use crate::error::CaptureError;
use crate::thread::ThreadHandle;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

pub(crate) const SAMPLE_SIGNAL: libc::c_int = libc::SIGPROF;

/// How long a capturer waits for the target's handler to run.
pub const SAMPLE_TIMEOUT: Duration = Duration::from_millis(100);

const SLOT_COUNT: usize = 16;

const REQUESTED: u64 = 1;
const WRITING: u64 = 2;
const READY: u64 = 3;

const fn pack(tid: libc::pid_t, state: u64) -> u64 {
    ((tid as u32 as u64) << 8) | state
}

struct SampleSlot {
    word: AtomicU64,
    ip: AtomicUsize,
    fp: AtomicUsize,
    lr: AtomicUsize,
    sp: AtomicUsize,
}

impl SampleSlot {
    const fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
            ip: AtomicUsize::new(0),
            fp: AtomicUsize::new(0),
            lr: AtomicUsize::new(0),
            sp: AtomicUsize::new(0),
        }
    }

    fn try_claim(&self, tid: libc::pid_t) -> bool {
        self.word
            .compare_exchange(0, pack(tid, REQUESTED), Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Withdraws a request the handler has not picked up yet.
    fn cancel(&self, tid: libc::pid_t) -> bool {
        self.word
            .compare_exchange(pack(tid, REQUESTED), 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    fn release(&self) {
        self.word.store(0, Ordering::Release);
    }

    fn take_ready(&self, tid: libc::pid_t) -> Option<SampledRegisters> {
        if self.word.load(Ordering::Acquire) != pack(tid, READY) {
            return None;
        }
        let sampled = SampledRegisters {
            ip: self.ip.load(Ordering::Relaxed),
            fp: self.fp.load(Ordering::Relaxed),
            lr: self.lr.load(Ordering::Relaxed),
            sp: self.sp.load(Ordering::Relaxed),
        };
        self.release();
        Some(sampled)
    }

    /// Signal-handler side. Fills the slot if it holds a request for `tid`.
    fn fulfil(&self, tid: libc::pid_t, registers: &SampledRegisters) {
        let requested = pack(tid, REQUESTED);
        if self
            .word
            .compare_exchange(requested, pack(tid, WRITING), Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        self.ip.store(registers.ip, Ordering::Relaxed);
        self.fp.store(registers.fp, Ordering::Relaxed);
        self.lr.store(registers.lr, Ordering::Relaxed);
        self.sp.store(registers.sp, Ordering::Relaxed);
        self.word.store(pack(tid, READY), Ordering::Release);
    }
}

#[derive(Clone, Copy)]
struct SampledRegisters {
    ip: usize,
    fp: usize,
    lr: usize,
    sp: usize,
}

#[cfg(target_arch = "x86_64")]
fn to_register_state(sampled: SampledRegisters) -> RegisterState {
    RegisterState {
        rip: sampled.ip,
        rbp: sampled.fp,
        rsp: sampled.sp,
    }
}

#[cfg(target_arch = "aarch64")]
fn to_register_state(sampled: SampledRegisters) -> RegisterState {
    RegisterState {
        pc: sampled.ip,
        fp: sampled.fp,
        lr: sampled.lr,
        sp: sampled.sp,
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn to_register_state(sampled: SampledRegisters) -> RegisterState {
    RegisterState {
        ip: sampled.ip,
        fp: sampled.fp,
    }
}

static SLOTS: [SampleSlot; SLOT_COUNT] = [const { SampleSlot::new() }; SLOT_COUNT];
static INSTALLED: OnceLock<Result<(), CaptureError>> = OnceLock::new();

/// Installs the `SIGPROF` handler used to sample other threads.
///
/// Idempotent. Call it early (at startup) if captures may later run from a
/// crash handler, where installing signal handlers is best avoided.
pub(crate) fn install_sampler() -> Result<(), CaptureError> {
    INSTALLED.get_or_init(install_handler).clone()
}

fn install_handler() -> Result<(), CaptureError> {
    let mut previous: libc::sigaction = unsafe { std::mem::zeroed() };
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = sample_handler_address();
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(SAMPLE_SIGNAL, &action, &mut previous) != 0 {
            return Err(CaptureError::last_os_error("sigaction(SIGPROF)"));
        }
    }
    if is_foreign_handler(previous.sa_sigaction) {
        tracing::warn!(
            previous = previous.sa_sigaction,
            "replaced an existing SIGPROF handler; a profiler using it will stop getting samples"
        );
    }
    tracing::debug!("register sampler installed on SIGPROF");
    Ok(())
}

fn sample_handler_address() -> libc::sighandler_t {
    on_sample_signal as *const () as libc::sighandler_t
}

/// Whether `handler` belongs to someone else: neither a default disposition
/// nor the sampler itself.
fn is_foreign_handler(handler: libc::sighandler_t) -> bool {
    handler != libc::SIG_DFL && handler != libc::SIG_IGN && handler != sample_handler_address()
}

extern "C" fn on_sample_signal(
    _sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    if ucontext.is_null() {
        return;
    }
    let registers = unsafe { RegisterState::from_ucontext(ucontext as *const libc::ucontext_t) };
    let sampled = SampledRegisters {
        ip: crate::arch::CpuRegisters::instruction_address(&registers),
        fp: crate::arch::CpuRegisters::frame_pointer(&registers),
        lr: crate::arch::CpuRegisters::link_register(&registers),
        sp: crate::arch::CpuRegisters::stack_pointer(&registers),
    };
    let tid = gettid();
    for slot in SLOTS.iter() {
        slot.fulfil(tid, &sampled);
    }
}

/// Interrupts `thread` and returns the registers it was interrupted at.
pub(crate) fn thread_state(thread: ThreadHandle) -> Result<RegisterState, CaptureError> {
    install_sampler().map_err(|_| CaptureError::SamplerUnavailable)?;

    let tid = libc::pid_t::try_from(thread.as_raw()).map_err(|_| CaptureError::Os {
        call: "tgkill",
        errno: libc::ESRCH,
    })?;
    let slot = SLOTS
        .iter()
        .find(|slot| slot.try_claim(tid))
        .ok_or(CaptureError::SamplerBusy)?;

    let sent = unsafe { libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, SAMPLE_SIGNAL) };
    if sent != 0 {
        let err = CaptureError::last_os_error("tgkill");
        slot.release();
        return Err(err);
    }

    let deadline = Instant::now() + SAMPLE_TIMEOUT;
    loop {
        if let Some(sampled) = slot.take_ready(tid) {
            return Ok(to_register_state(sampled));
        }
        // Once the handler has started writing it finishes without blocking,
        // so only a still-pending request can time out.
        if Instant::now() >= deadline && slot.cancel(tid) {
            return Err(CaptureError::SampleTimeout { thread });
        }
        std::thread::yield_now();
    }
}
