use super::CpuRegisters;

/// x86_64 return addresses carry no authentication bits.
pub const PAC_STRIPPING_MASK: usize = usize::MAX;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct X86_64Registers {
    pub rip: usize,
    pub rbp: usize,
    pub rsp: usize,
}

impl CpuRegisters for X86_64Registers {
    fn from_frame(instruction_address: usize, frame_pointer: usize) -> Self {
        Self {
            rip: instruction_address,
            rbp: frame_pointer,
            rsp: 0,
        }
    }

    fn instruction_address(&self) -> usize {
        self.rip
    }

    fn frame_pointer(&self) -> usize {
        self.rbp
    }

    fn link_register(&self) -> usize {
        0
    }

    fn stack_pointer(&self) -> usize {
        self.rsp
    }
}

impl X86_64Registers {
    /// # Safety
    ///
    /// `ucontext` must be null or point at the `ucontext_t` the kernel passed
    /// to an `SA_SIGINFO` handler that is still running.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub(crate) unsafe fn from_ucontext(ucontext: *const libc::ucontext_t) -> Self {
        if ucontext.is_null() {
            return Self::default();
        }
        let gregs = unsafe { &(*ucontext).uc_mcontext.gregs };
        Self {
            rip: gregs[libc::REG_RIP as usize] as usize,
            rbp: gregs[libc::REG_RBP as usize] as usize,
            rsp: gregs[libc::REG_RSP as usize] as usize,
        }
    }

    /// # Safety
    ///
    /// Same contract as the Linux variant; `uc_mcontext` is a pointer on Darwin.
    #[cfg(target_os = "macos")]
    pub(crate) unsafe fn from_ucontext(ucontext: *const libc::ucontext_t) -> Self {
        if ucontext.is_null() {
            return Self::default();
        }
        let mcontext = unsafe { (*ucontext).uc_mcontext };
        if mcontext.is_null() {
            return Self::default();
        }
        let ss = unsafe { &(*mcontext).__ss };
        Self {
            rip: ss.__rip as usize,
            rbp: ss.__rbp as usize,
            rsp: ss.__rsp as usize,
        }
    }
}

#[inline(always)]
pub(crate) fn read_frame_pointer() -> usize {
    let frame_ptr: usize;
    unsafe {
        core::arch::asm!(
            "mov {}, rbp",
            out(reg) frame_ptr,
            options(nomem, nostack, preserves_flags)
        );
    }
    frame_ptr
}
