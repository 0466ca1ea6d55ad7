use super::CpuRegisters;

/// Apple arm64e signs return addresses above bit 36.
#[cfg(target_vendor = "apple")]
pub const PAC_STRIPPING_MASK: usize = 0x0000_000f_ffff_ffff;

/// Linux user space uses a 48-bit virtual address range; anything above it is
/// a PAC signature or a top-byte tag.
#[cfg(not(target_vendor = "apple"))]
pub const PAC_STRIPPING_MASK: usize = 0x0000_ffff_ffff_ffff;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Aarch64Registers {
    pub pc: usize,
    /// x29
    pub fp: usize,
    /// x30
    pub lr: usize,
    pub sp: usize,
}

impl CpuRegisters for Aarch64Registers {
    fn from_frame(instruction_address: usize, frame_pointer: usize) -> Self {
        Self {
            pc: instruction_address,
            fp: frame_pointer,
            lr: 0,
            sp: 0,
        }
    }

    fn instruction_address(&self) -> usize {
        self.pc
    }

    fn frame_pointer(&self) -> usize {
        self.fp
    }

    fn link_register(&self) -> usize {
        self.lr
    }

    fn stack_pointer(&self) -> usize {
        self.sp
    }
}

impl Aarch64Registers {
    /// # Safety
    ///
    /// `ucontext` must be null or point at the `ucontext_t` the kernel passed
    /// to an `SA_SIGINFO` handler that is still running.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub(crate) unsafe fn from_ucontext(ucontext: *const libc::ucontext_t) -> Self {
        if ucontext.is_null() {
            return Self::default();
        }
        let mcontext = unsafe { &(*ucontext).uc_mcontext };
        Self {
            pc: mcontext.pc as usize,
            fp: mcontext.regs[29] as usize,
            lr: mcontext.regs[30] as usize,
            sp: mcontext.sp as usize,
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
            pc: ss.__pc as usize,
            fp: ss.__fp as usize,
            lr: ss.__lr as usize,
            sp: ss.__sp as usize,
        }
    }
}

#[inline(always)]
pub(crate) fn read_frame_pointer() -> usize {
    let frame_ptr: usize;
    unsafe {
        core::arch::asm!(
            "mov {}, x29",
            out(reg) frame_ptr,
            options(nomem, nostack, preserves_flags)
        );
    }
    frame_ptr
}
