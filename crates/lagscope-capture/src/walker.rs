//! Frame-pointer chain walking.
//!
//! With frame pointers enabled every function prologue pushes a two-word
//! record `{previous frame pointer, return address}` and points the frame
//! pointer register at it, on x86_64 (`rbp`) and aarch64 (`x29`) alike. The
//! walker starts from a captured register set, emits the instruction address,
//! then follows the `previous` links and emits each return address.
//!
//! Every record is read with [`copy_safely`], so a corrupted chain ends the
//! walk instead of crashing it.

use crate::arch::{CpuRegisters, normalize_instruction_pointer};
use crate::context::MachineContext;
use crate::cursor::WalkState;
use crate::memory::copy_safely;

/// Depth ceiling of the stack-overflow probe; a walk that hits it is treated
/// as an overflowed stack.
pub const OVERFLOW_PROBE_DEPTH: usize = 150;

/// Depth past which an ordinary walk reports `has_given_up` while it keeps
/// going. Override per cursor with `Cursor::with_soft_limit`.
pub const SOFT_DEPTH_LIMIT: usize = 150;

/// One frame record as laid out on the stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct FrameRecord {
    pub previous: usize,
    pub return_address: usize,
}

impl FrameRecord {
    pub const SIZE: usize = size_of::<Self>();

    /// Reads the record at `address`; `None` if any byte of it is unreadable.
    pub fn read(address: usize) -> Option<Self> {
        let mut bytes = [0u8; Self::SIZE];
        if copy_safely(address, &mut bytes) != Self::SIZE {
            return None;
        }
        let word = size_of::<usize>();
        let mut previous = [0u8; size_of::<usize>()];
        let mut return_address = [0u8; size_of::<usize>()];
        previous.copy_from_slice(&bytes[..word]);
        return_address.copy_from_slice(&bytes[word..]);
        Some(Self {
            previous: usize::from_ne_bytes(previous),
            return_address: usize::from_ne_bytes(return_address),
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FrameWalkState<'a> {
    context: &'a MachineContext,
    current_frame: FrameRecord,
    instruction_address: usize,
    max_stack_depth: usize,
    soft_limit: usize,
    has_crossed_initial_frame: bool,
}

impl<'a> FrameWalkState<'a> {
    pub(crate) fn new(context: &'a MachineContext, max_stack_depth: usize) -> Self {
        Self {
            context,
            current_frame: FrameRecord::default(),
            instruction_address: 0,
            max_stack_depth,
            soft_limit: SOFT_DEPTH_LIMIT,
            has_crossed_initial_frame: false,
        }
    }

    pub(crate) fn set_soft_limit(&mut self, soft_limit: usize) {
        self.soft_limit = soft_limit;
    }

    pub(crate) fn reset(&mut self) {
        self.current_frame = FrameRecord::default();
        self.instruction_address = 0;
        self.has_crossed_initial_frame = false;
    }

    /// Produces the next address of the walk, or `None` once the walk is over.
    pub(crate) fn advance(&mut self, walk: &mut WalkState) -> Option<usize> {
        if walk.current_depth >= self.soft_limit {
            walk.has_given_up = true;
        }
        if walk.current_depth >= self.max_stack_depth {
            walk.has_given_up = true;
            return None;
        }

        let registers = self.context.registers();
        if self.instruction_address == 0 {
            let address = normalize_instruction_pointer(registers.instruction_address());
            if address == 0 {
                return None;
            }
            self.instruction_address = address;
            walk.current_depth += 1;
            return Some(address);
        }

        if self.current_frame.previous == 0 {
            if self.has_crossed_initial_frame {
                return None;
            }
            self.current_frame.previous = registers.frame_pointer();
            self.has_crossed_initial_frame = true;
        }

        let record = FrameRecord::read(self.current_frame.previous)?;
        self.current_frame = record;
        if record.previous == 0 || record.return_address == 0 {
            return None;
        }

        walk.current_depth += 1;
        Some(normalize_instruction_pointer(record.return_address))
    }
}

/// Walks `context` to the probe ceiling and reports whether the walk had to
/// give up, which is taken to mean the stack overflowed.
pub fn is_stack_overflow(context: &MachineContext) -> bool {
    let mut state = FrameWalkState::new(context, OVERFLOW_PROBE_DEPTH);
    state.set_soft_limit(OVERFLOW_PROBE_DEPTH);
    let mut walk = WalkState::default();
    while state.advance(&mut walk).is_some() {}
    walk.has_given_up
}

#[cfg(all(
    test,
    any(target_os = "linux", target_os = "android", target_os = "macos")
))]
pub(crate) mod tests {
    use super::*;
    use crate::arch::RegisterState;
    use crate::thread::current_thread;

    /// A chain of frame records in one heap buffer, linked the way a real
    /// stack is: record `i` points at record `i + 1`, the last one at zero.
    pub(crate) struct SyntheticStack {
        words: Vec<usize>,
    }

    impl SyntheticStack {
        pub(crate) const FIRST_RETURN: usize = 0x10_0000;

        pub(crate) fn new(frames: usize) -> Self {
            let mut stack = Self {
                words: vec![0; frames * 2],
            };
            let base = stack.words.as_ptr() as usize;
            for i in 0..frames {
                let next = if i + 1 < frames {
                    base + (i + 1) * FrameRecord::SIZE
                } else {
                    0
                };
                stack.words[i * 2] = next;
                stack.words[i * 2 + 1] = Self::FIRST_RETURN + i * 0x10;
            }
            stack
        }

        pub(crate) fn frame_address(&self, index: usize) -> usize {
            self.words.as_ptr() as usize + index * FrameRecord::SIZE
        }

        pub(crate) fn set_previous(&mut self, index: usize, previous: usize) {
            self.words[index * 2] = previous;
        }

        pub(crate) fn set_return_address(&mut self, index: usize, address: usize) {
            self.words[index * 2 + 1] = address;
        }

        pub(crate) fn context(&self, instruction_address: usize) -> MachineContext {
            MachineContext::from_registers(
                current_thread(),
                RegisterState::from_frame(instruction_address, self.frame_address(0)),
            )
        }
    }

    fn collect(context: &MachineContext, max: usize) -> (Vec<usize>, WalkState) {
        let mut state = FrameWalkState::new(context, max);
        let mut walk = WalkState::default();
        let mut out = Vec::new();
        while let Some(address) = state.advance(&mut walk) {
            out.push(address);
        }
        (out, walk)
    }

    #[test]
    fn walk_emits_ip_then_every_return_address_but_the_terminal_one() {
        let stack = SyntheticStack::new(5);
        let context = stack.context(0xabc0);
        let (addresses, walk) = collect(&context, 100);

        // The last record has a zero `previous`, which ends the walk without
        // emitting its return address.
        assert_eq!(
            addresses,
            vec![0xabc0, 0x10_0000, 0x10_0010, 0x10_0020, 0x10_0030]
        );
        assert_eq!(walk.current_depth, 5);
        assert!(!walk.has_given_up);
    }

    #[test]
    fn zero_instruction_address_ends_the_walk_immediately() {
        let stack = SyntheticStack::new(5);
        let context = stack.context(0);
        let (addresses, walk) = collect(&context, 100);
        assert!(addresses.is_empty());
        assert_eq!(walk.current_depth, 0);
    }

    #[test]
    fn zero_return_address_ends_the_walk() {
        let mut stack = SyntheticStack::new(6);
        stack.set_return_address(2, 0);
        let context = stack.context(0x1);
        let (addresses, _) = collect(&context, 100);
        assert_eq!(addresses, vec![0x1, 0x10_0000, 0x10_0010]);
    }

    #[test]
    fn corrupted_link_stops_without_faulting() {
        let mut stack = SyntheticStack::new(6);
        stack.set_previous(1, 0x10);
        let context = stack.context(0x1);
        let (addresses, walk) = collect(&context, 100);
        assert_eq!(addresses, vec![0x1, 0x10_0000, 0x10_0010]);
        assert!(!walk.has_given_up);
    }

    #[test]
    fn cyclic_chain_is_bounded_by_the_depth_ceiling() {
        let mut stack = SyntheticStack::new(2);
        let first = stack.frame_address(0);
        stack.set_previous(1, first);
        let context = stack.context(0x1);
        let (addresses, walk) = collect(&context, 40);
        assert_eq!(addresses.len(), 40);
        assert!(walk.has_given_up);
    }

    #[test]
    fn max_depth_caps_the_walk_and_sets_given_up() {
        let stack = SyntheticStack::new(20);
        let context = stack.context(0x1);
        let (addresses, walk) = collect(&context, 7);
        assert_eq!(addresses.len(), 7);
        assert_eq!(walk.current_depth, 7);
        assert!(walk.has_given_up);
    }

    #[test]
    fn soft_limit_flags_without_stopping() {
        let stack = SyntheticStack::new(20);
        let context = stack.context(0x1);
        let mut state = FrameWalkState::new(&context, 100);
        state.set_soft_limit(5);
        let mut walk = WalkState::default();
        let mut count = 0;
        while state.advance(&mut walk).is_some() {
            count += 1;
        }
        assert_eq!(count, 20);
        assert!(walk.has_given_up);
    }

    #[test]
    fn tagged_return_addresses_are_normalized() {
        let mut stack = SyntheticStack::new(3);
        let tag = !crate::arch::PAC_STRIPPING_MASK & (0x2a << 56);
        stack.set_return_address(0, 0x4000 | tag);
        let context = stack.context(0x1 | tag);
        let (addresses, _) = collect(&context, 100);
        assert_eq!(addresses[0], 0x1);
        assert_eq!(addresses[1], 0x4000);
    }

    #[test]
    fn overflow_probe_separates_deep_from_shallow_stacks() {
        let shallow = SyntheticStack::new(20);
        assert!(!is_stack_overflow(&shallow.context(0x1)));

        let deep = SyntheticStack::new(OVERFLOW_PROBE_DEPTH + 10);
        assert!(is_stack_overflow(&deep.context(0x1)));
    }

    #[test]
    fn reset_replays_the_same_walk() {
        let stack = SyntheticStack::new(8);
        let context = stack.context(0x77);
        let mut state = FrameWalkState::new(&context, 100);

        let mut first = Vec::new();
        let mut walk = WalkState::default();
        while let Some(address) = state.advance(&mut walk) {
            first.push(address);
        }

        state.reset();
        let mut second = Vec::new();
        let mut walk = WalkState::default();
        while let Some(address) = state.advance(&mut walk) {
            second.push(address);
        }
        assert_eq!(first, second);
    }
}
