use super::CpuRegisters;

pub const PAC_STRIPPING_MASK: usize = usize::MAX;

/// Placeholder for targets without a frame walker. Nothing ever fills it from
/// a real thread, so walks on these targets end before the first frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenericRegisters {
    pub ip: usize,
    pub fp: usize,
}

impl CpuRegisters for GenericRegisters {
    fn from_frame(instruction_address: usize, frame_pointer: usize) -> Self {
        Self {
            ip: instruction_address,
            fp: frame_pointer,
        }
    }

    fn instruction_address(&self) -> usize {
        self.ip
    }

    fn frame_pointer(&self) -> usize {
        self.fp
    }

    fn link_register(&self) -> usize {
        0
    }

    fn stack_pointer(&self) -> usize {
        0
    }
}

impl GenericRegisters {
    #[cfg(unix)]
    pub(crate) unsafe fn from_ucontext(_ucontext: *const libc::ucontext_t) -> Self {
        Self::default()
    }
}

pub(crate) fn read_frame_pointer() -> usize {
    0
}
