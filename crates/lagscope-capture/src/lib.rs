//! Call-stack capture for any thread of the running process.
//!
//! A capture takes a snapshot of a thread's registers ([`MachineContext`])
//! and walks its frame-pointer chain with a [`StackCursor`]. The target thread
//! does not need to cooperate, may be stuck or crashing, and may have a
//! corrupted stack: every stack read goes through [`copy_safely`], which
//! reports unreadable memory instead of faulting.
//!
//! The walker relies on frame pointers. Build with
//! `-C force-frame-pointers=yes` (the workspace `.cargo/config.toml` does).
//!
//! ```no_run
//! let mut out = [0usize; 128];
//! let count = lagscope_capture::capture_current_backtrace(&mut out);
//! for address in &out[..count] {
//!     println!("0x{address:x}");
//! }
//! ```
//!
//! Platform support:
//! - Linux: threads from `/proc/self/task`, registers of other threads via a
//!   `SIGPROF` sampler (see [`install_sampler`]), reads via
//!   `process_vm_readv` or `/proc/self/mem`.
//! - macOS: `task_threads`, `thread_get_state`, `mach_vm_read_overwrite`.
//! - Elsewhere: every capture comes back empty.

mod arch;
mod backtrace;
mod context;
mod cursor;
mod error;
mod memory;
mod platform;
mod symbolicate;
mod thread;
mod walker;

pub use arch::{CpuRegisters, PAC_STRIPPING_MASK, RegisterState, normalize_instruction_pointer};
#[cfg(unix)]
pub use backtrace::capture_crash_context_for_signal;
pub use backtrace::{
    capture_backtrace, capture_crash_context, capture_current_backtrace, drain_cursor,
    walk_context,
};
pub use context::{MachineContext, RegisterSource};
pub use cursor::{Cursor, StackCursor, StackEntry, WalkState};
pub use error::CaptureError;
pub use memory::{copy_safely, read_word};
#[cfg(unix)]
pub use symbolicate::DladdrSymbolicator;
pub use symbolicate::{InlineName, NAME_CAPACITY, NoSymbolicator, Symbol, Symbolicator};
pub use thread::{MAX_CAPTURED_THREADS, ThreadHandle, ThreadList, current_thread, enumerate_threads};
pub use walker::{
    FrameRecord, OVERFLOW_PROBE_DEPTH, SOFT_DEPTH_LIMIT, is_stack_overflow,
};

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use platform::SAMPLE_TIMEOUT;

/// Prepares whatever the platform needs to read other threads' registers.
///
/// On Linux this installs the `SIGPROF` handler of the register sampler; the
/// first cross-thread capture does it too, but a crash handler should not be
/// the one installing signal handlers, so call this at startup. No-op on
/// macOS. Idempotent.
pub fn install_sampler() -> Result<(), CaptureError> {
    platform::install_sampler()
}
