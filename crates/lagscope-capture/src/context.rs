use crate::arch::{self, CpuRegisters, RegisterState};
use crate::memory::read_word;
use crate::platform;
use crate::thread::{self, ThreadHandle, ThreadList, current_thread};
use crate::walker;

/// Where the registers of a [`MachineContext`] came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RegisterSource {
    /// Nothing was captured; the registers are zero.
    #[default]
    None,
    /// Queried from the OS for another thread.
    ThreadState,
    /// Copied out of a signal handler's `ucontext_t`.
    SignalContext,
    /// Taken from the calling thread's own frame record.
    Live,
    /// Handed in by the caller.
    Supplied,
}

/// Snapshot of one thread's CPU state, plus the crash metadata that goes
/// with it.
///
/// Built fresh for each capture and dropped after the walk.
#[derive(Debug)]
pub struct MachineContext {
    thread: ThreadHandle,
    threads: ThreadList,
    is_crashed_context: bool,
    is_current_thread: bool,
    is_stack_overflow: bool,
    is_signal_context: bool,
    registers: RegisterState,
    register_source: RegisterSource,
}

impl MachineContext {
    fn empty(thread: ThreadHandle) -> Self {
        Self {
            thread,
            threads: ThreadList::new(),
            is_crashed_context: false,
            is_current_thread: false,
            is_stack_overflow: false,
            is_signal_context: false,
            registers: RegisterState::default(),
            register_source: RegisterSource::None,
        }
    }

    /// Captures `thread` as it is right now.
    ///
    /// The registers of another thread are queried from the OS. The calling
    /// thread's registers are not: it cannot describe itself through that
    /// query, so its context keeps zeroed registers (use
    /// [`MachineContext::capture_here`] for a live self-capture).
    ///
    /// With `is_crashed` set, the context also runs the stack-overflow probe
    /// and lists every thread of the process.
    pub fn capture(thread: ThreadHandle, is_crashed: bool) -> Self {
        let mut context = Self::empty(thread);
        context.is_crashed_context = is_crashed;
        context.is_current_thread = thread == current_thread();

        if context.can_have_cpu_state() {
            match platform::thread_state(thread) {
                Ok(registers) => {
                    context.registers = registers;
                    context.register_source = RegisterSource::ThreadState;
                }
                Err(err) => {
                    tracing::debug!(thread = thread.as_raw(), %err, "register query failed");
                }
            }
        }

        if is_crashed {
            context.collect_crash_details();
        }
        context
    }

    /// Captures the calling thread from inside a signal handler.
    ///
    /// # Safety
    ///
    /// `ucontext` must be null or the third argument of an `SA_SIGINFO`
    /// handler that is still running on this thread.
    #[cfg(unix)]
    pub unsafe fn from_signal_context(ucontext: *const libc::c_void, is_crashed: bool) -> Self {
        let mut context = Self::empty(current_thread());
        context.is_crashed_context = is_crashed;
        context.is_current_thread = true;
        context.is_signal_context = true;

        let registers = unsafe { RegisterState::from_ucontext(ucontext.cast()) };
        if !registers.is_zeroed() {
            context.registers = registers;
            context.register_source = RegisterSource::SignalContext;
        }

        if is_crashed {
            context.collect_crash_details();
        }
        context
    }

    /// Captures the calling thread at the point where this function was
    /// called.
    ///
    /// The walk starts at the return address into the caller and continues
    /// from the caller's frame, so this function itself never shows up in
    /// the backtrace. Needs frame pointers; without them the registers stay
    /// zero.
    #[inline(never)]
    pub fn capture_here() -> Self {
        let mut context = Self::empty(current_thread());
        context.is_current_thread = true;

        let frame = arch::read_frame_pointer();
        let caller_frame = read_word(frame);
        let return_address = read_word(frame.wrapping_add(size_of::<usize>()));
        match (caller_frame, return_address) {
            (Some(caller_frame), Some(return_address))
                if caller_frame != 0 && return_address != 0 =>
            {
                context.registers = RegisterState::from_frame(return_address, caller_frame);
                context.register_source = RegisterSource::Live;
            }
            _ => {
                tracing::debug!(frame, "no readable frame record for a live capture");
            }
        }
        context
    }

    /// Wraps registers captured elsewhere, such as by an exception handler.
    pub fn from_registers(thread: ThreadHandle, registers: RegisterState) -> Self {
        let mut context = Self::empty(thread);
        context.is_current_thread = thread == current_thread();
        context.registers = registers;
        context.register_source = RegisterSource::Supplied;
        context
    }

    fn collect_crash_details(&mut self) {
        let overflowed = walker::is_stack_overflow(self);
        self.is_stack_overflow = overflowed;
        if overflowed {
            tracing::debug!(thread = self.thread.as_raw(), "stack overflow detected");
        }

        if let Err(err) = thread::enumerate_threads(&mut self.threads) {
            tracing::warn!(%err, "thread enumeration failed; crash context has no thread list");
        }
    }

    /// Whether the registers may describe a real CPU state: either the
    /// context is for another thread, or it was captured from a signal.
    pub fn can_have_cpu_state(&self) -> bool {
        !self.is_current_thread || self.is_signal_context
    }

    pub fn thread(&self) -> ThreadHandle {
        self.thread
    }

    /// Every thread of the process; only populated for crashed contexts.
    pub fn threads(&self) -> &ThreadList {
        &self.threads
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn is_crashed_context(&self) -> bool {
        self.is_crashed_context
    }

    pub fn is_current_thread(&self) -> bool {
        self.is_current_thread
    }

    pub fn is_stack_overflow(&self) -> bool {
        self.is_stack_overflow
    }

    pub fn is_signal_context(&self) -> bool {
        self.is_signal_context
    }

    pub fn registers(&self) -> &RegisterState {
        &self.registers
    }

    pub fn register_source(&self) -> RegisterSource {
        self.register_source
    }
}
