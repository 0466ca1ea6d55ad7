//! Per-architecture register sets.
//!
//! The frame walker only ever asks a register set for its instruction address
//! and frame pointer, through [`CpuRegisters`]. Each supported architecture
//! provides one register type plus the conversions from whatever the OS hands
//! us (a signal `ucontext_t`, a Mach thread state), and [`RegisterState`] names
//! the one for the build target.

use std::fmt;

/// Read access to the registers a frame-pointer walk needs.
pub trait CpuRegisters: Copy + Default + fmt::Debug + PartialEq + Eq {
    /// Builds a register set holding only an instruction address and a frame
    /// pointer; everything else is zero.
    fn from_frame(instruction_address: usize, frame_pointer: usize) -> Self;

    fn instruction_address(&self) -> usize;

    fn frame_pointer(&self) -> usize;

    /// Zero on architectures without a link register.
    fn link_register(&self) -> usize;

    fn stack_pointer(&self) -> usize;

    fn is_zeroed(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
mod generic;
#[cfg(target_arch = "x86_64")]
mod x86_64;

#[cfg(target_arch = "aarch64")]
pub use aarch64::{Aarch64Registers as RegisterState, PAC_STRIPPING_MASK};
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub use generic::{GenericRegisters as RegisterState, PAC_STRIPPING_MASK};
#[cfg(target_arch = "x86_64")]
pub use x86_64::{PAC_STRIPPING_MASK, X86_64Registers as RegisterState};

#[cfg(target_arch = "aarch64")]
pub(crate) use aarch64::read_frame_pointer;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub(crate) use generic::read_frame_pointer;
#[cfg(target_arch = "x86_64")]
pub(crate) use x86_64::read_frame_pointer;

/// Strips pointer-authentication bits from a code address.
///
/// Every address is passed through this before it is stored or compared, so a
/// signed and an unsigned copy of the same return address end up equal.
#[inline]
pub const fn normalize_instruction_pointer(address: usize) -> usize {
    address & PAC_STRIPPING_MASK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_is_idempotent() {
        for address in [0usize, 1, 0x1000, 0x7fff_dead_beef, usize::MAX] {
            let once = normalize_instruction_pointer(address);
            assert_eq!(normalize_instruction_pointer(once), once);
        }
    }

    #[test]
    fn tagged_and_untagged_addresses_compare_equal() {
        let plain = normalize_instruction_pointer(0x0000_0001_0203_0405);
        let tag_bits = !PAC_STRIPPING_MASK;
        let tagged = plain | (tag_bits & 0xa5a5_0000_0000_0000_u64 as usize);
        assert_eq!(normalize_instruction_pointer(tagged), plain);
    }

    #[test]
    fn from_frame_sets_only_ip_and_fp() {
        let regs = RegisterState::from_frame(0x4000, 0x8000);
        assert_eq!(regs.instruction_address(), 0x4000);
        assert_eq!(regs.frame_pointer(), 0x8000);
        assert_eq!(regs.stack_pointer(), 0);
        assert!(!regs.is_zeroed());
        assert!(RegisterState::default().is_zeroed());
    }
}
