//! Stack cursors: one interface over the ways a backtrace can be walked.

use crate::arch::normalize_instruction_pointer;
use crate::context::MachineContext;
use crate::symbolicate::{InlineName, Symbolicator};
use crate::walker::FrameWalkState;

/// The frame a cursor is positioned on.
///
/// `address` is set by [`StackCursor::advance`]; everything else is only
/// filled in by [`StackCursor::symbolicate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackEntry {
    pub address: usize,
    pub image_name: Option<InlineName>,
    pub image_address: usize,
    pub symbol_name: Option<InlineName>,
    pub symbol_address: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkState {
    /// Entries produced so far; 1 once the first entry is out.
    pub current_depth: usize,
    /// Set once the walk hit a depth limit.
    pub has_given_up: bool,
}

pub trait StackCursor {
    /// Rewinds to before the first entry.
    fn reset(&mut self);

    /// Moves to the next entry. Returns `false` once the walk is over, in
    /// which case the current entry is left as it was.
    fn advance(&mut self) -> bool;

    /// Fills in image and symbol details of the current entry. Returns
    /// `false` (with those details blanked) if nothing was found.
    fn symbolicate(&mut self) -> bool;

    fn entry(&self) -> &StackEntry;

    fn walk_state(&self) -> &WalkState;
}

/// Replays an already-captured list of addresses.
#[derive(Debug, Clone)]
struct BacktraceWalkState<'a> {
    addresses: &'a [usize],
    skipped_entries: usize,
}

impl<'a> BacktraceWalkState<'a> {
    fn new(addresses: &'a [usize], skipped_entries: usize) -> Self {
        Self {
            addresses,
            skipped_entries,
        }
    }

    fn advance(&mut self, walk: &mut WalkState) -> Option<usize> {
        let index = self.skipped_entries.checked_add(walk.current_depth)?;
        let address = *self.addresses.get(index)?;
        // Some platform backtraces end on a bogus 0 or 1 entry.
        if address <= 1 {
            return None;
        }
        walk.current_depth += 1;
        Some(normalize_instruction_pointer(address))
    }
}

#[derive(Debug, Clone)]
enum Strategy<'a> {
    FramePointer(FrameWalkState<'a>),
    Backtrace(BacktraceWalkState<'a>),
}

pub struct Cursor<'a> {
    entry: StackEntry,
    walk: WalkState,
    strategy: Strategy<'a>,
    symbolicator: &'a dyn Symbolicator,
}

impl<'a> Cursor<'a> {
    /// A cursor that follows the frame-pointer chain of `context`, producing
    /// at most `max_stack_depth` entries.
    pub fn frame_pointer(
        context: &'a MachineContext,
        max_stack_depth: usize,
        symbolicator: &'a dyn Symbolicator,
    ) -> Self {
        Self {
            entry: StackEntry::default(),
            walk: WalkState::default(),
            strategy: Strategy::FramePointer(FrameWalkState::new(context, max_stack_depth)),
            symbolicator,
        }
    }

    /// A cursor over `addresses`, starting after the first `skipped_entries`.
    pub fn backtrace(
        addresses: &'a [usize],
        skipped_entries: usize,
        symbolicator: &'a dyn Symbolicator,
    ) -> Self {
        Self {
            entry: StackEntry::default(),
            walk: WalkState::default(),
            strategy: Strategy::Backtrace(BacktraceWalkState::new(addresses, skipped_entries)),
            symbolicator,
        }
    }

    /// Sets the depth past which the walk reports `has_given_up` while it
    /// keeps going. No effect on replay cursors.
    pub fn with_soft_limit(mut self, soft_limit: usize) -> Self {
        if let Strategy::FramePointer(state) = &mut self.strategy {
            state.set_soft_limit(soft_limit);
        }
        self
    }
}

impl StackCursor for Cursor<'_> {
    fn reset(&mut self) {
        self.entry = StackEntry::default();
        self.walk = WalkState::default();
        if let Strategy::FramePointer(state) = &mut self.strategy {
            state.reset();
        }
    }

    fn advance(&mut self) -> bool {
        let next = match &mut self.strategy {
            Strategy::FramePointer(state) => state.advance(&mut self.walk),
            Strategy::Backtrace(state) => state.advance(&mut self.walk),
        };
        match next {
            Some(address) => {
                self.entry = StackEntry {
                    address,
                    ..StackEntry::default()
                };
                true
            }
            None => false,
        }
    }

    fn symbolicate(&mut self) -> bool {
        // Past the first entry every address is a return address; the call
        // that produced it is the instruction before.
        let lookup = if self.walk.current_depth > 1 {
            self.entry.address.wrapping_sub(1)
        } else {
            self.entry.address
        };
        let address = self.entry.address;
        self.entry = StackEntry {
            address,
            ..StackEntry::default()
        };
        if address == 0 {
            return false;
        }

        let Some(symbol) = self.symbolicator.resolve(lookup) else {
            return false;
        };
        self.entry.image_name = symbol.image_name;
        self.entry.image_address = symbol.image_address;
        self.entry.symbol_name = symbol.symbol_name;
        self.entry.symbol_address = symbol.symbol_address;
        true
    }

    fn entry(&self) -> &StackEntry {
        &self.entry
    }

    fn walk_state(&self) -> &WalkState {
        &self.walk
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolicate::{NoSymbolicator, Symbol};
    use std::cell::RefCell;

    struct RecordingSymbolicator {
        asked: RefCell<Vec<usize>>,
    }

    impl Symbolicator for RecordingSymbolicator {
        fn resolve(&self, address: usize) -> Option<Symbol> {
            self.asked.borrow_mut().push(address);
            (address >= 0x1000).then_some(Symbol {
                image_name: Some(InlineName::new(c"libdemo.so")),
                image_address: 0x1000,
                symbol_name: Some(InlineName::new(c"demo_fn")),
                symbol_address: address & !0xf,
            })
        }
    }

    fn drain(cursor: &mut Cursor<'_>) -> Vec<usize> {
        let mut out = Vec::new();
        while cursor.advance() {
            out.push(cursor.entry().address);
        }
        out
    }

    #[test]
    fn replay_stops_at_the_first_bogus_entry() {
        let addresses = [0x1000, 0x2000, 0x1, 0x3000];
        let mut cursor = Cursor::backtrace(&addresses, 0, &NoSymbolicator);
        assert_eq!(drain(&mut cursor), vec![0x1000, 0x2000]);
        assert_eq!(cursor.walk_state().current_depth, 2);
        assert!(!cursor.walk_state().has_given_up);
    }

    #[test]
    fn replay_honours_skipped_entries() {
        let addresses = [0x1000, 0x2000, 0x3000, 0x4000];
        let mut cursor = Cursor::backtrace(&addresses, 2, &NoSymbolicator);
        assert_eq!(drain(&mut cursor), vec![0x3000, 0x4000]);

        let mut past_the_end = Cursor::backtrace(&addresses, 9, &NoSymbolicator);
        assert!(!past_the_end.advance());
    }

    #[test]
    fn failed_advance_keeps_the_current_entry() {
        let addresses = [0x1000];
        let mut cursor = Cursor::backtrace(&addresses, 0, &NoSymbolicator);
        assert!(cursor.advance());
        assert!(!cursor.advance());
        assert_eq!(cursor.entry().address, 0x1000);
    }

    #[test]
    fn reset_rewinds_a_replay() {
        let addresses = [0x1000, 0x2000];
        let mut cursor = Cursor::backtrace(&addresses, 0, &NoSymbolicator);
        let first = drain(&mut cursor);
        cursor.reset();
        assert_eq!(*cursor.entry(), StackEntry::default());
        assert_eq!(*cursor.walk_state(), WalkState::default());
        assert_eq!(drain(&mut cursor), first);
    }

    #[test]
    fn symbolicate_looks_up_the_call_instruction_after_the_first_entry() {
        let symbolicator = RecordingSymbolicator {
            asked: RefCell::new(Vec::new()),
        };
        let addresses = [0x1100, 0x2200];
        let mut cursor = Cursor::backtrace(&addresses, 0, &symbolicator);

        assert!(cursor.advance());
        assert!(cursor.symbolicate());
        assert!(cursor.advance());
        assert!(cursor.symbolicate());

        assert_eq!(*symbolicator.asked.borrow(), vec![0x1100, 0x21ff]);
        let entry = cursor.entry();
        assert_eq!(entry.address, 0x2200);
        assert_eq!(entry.image_name, Some(InlineName::new(c"libdemo.so")));
        assert_eq!(entry.symbol_name, Some(InlineName::new(c"demo_fn")));
        assert_eq!(entry.symbol_address, 0x21f0);
    }

    #[test]
    fn symbolicate_leaves_address_and_walk_state_alone() {
        let symbolicator = RecordingSymbolicator {
            asked: RefCell::new(Vec::new()),
        };
        let addresses = [0x500, 0x2000];
        let mut cursor = Cursor::backtrace(&addresses, 0, &symbolicator);
        assert!(cursor.advance());
        let walk_before = *cursor.walk_state();

        assert!(!cursor.symbolicate());
        assert_eq!(cursor.entry().address, 0x500);
        assert_eq!(cursor.entry().image_name, None);
        assert_eq!(cursor.entry().symbol_name, None);
        assert_eq!(*cursor.walk_state(), walk_before);

        assert!(cursor.advance());
        assert_eq!(cursor.entry().address, 0x2000);
    }

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
    mod frame_pointer {
        use super::*;
        use crate::walker::tests::SyntheticStack;

        #[test]
        fn frame_pointer_cursor_walks_a_synthetic_chain() {
            let stack = SyntheticStack::new(4);
            let context = stack.context(0x9000);
            let mut cursor = Cursor::frame_pointer(&context, 64, &NoSymbolicator);
            assert_eq!(
                drain(&mut cursor),
                vec![
                    0x9000,
                    SyntheticStack::FIRST_RETURN,
                    SyntheticStack::FIRST_RETURN + 0x10,
                    SyntheticStack::FIRST_RETURN + 0x20,
                ]
            );
        }

        #[test]
        fn reset_is_deterministic() {
            let stack = SyntheticStack::new(12);
            let context = stack.context(0x9000);
            let mut cursor = Cursor::frame_pointer(&context, 64, &NoSymbolicator);
            let first = drain(&mut cursor);
            cursor.reset();
            assert_eq!(drain(&mut cursor), first);
        }

        #[test]
        fn soft_limit_is_configurable() {
            let stack = SyntheticStack::new(12);
            let context = stack.context(0x9000);
            let mut cursor =
                Cursor::frame_pointer(&context, 64, &NoSymbolicator).with_soft_limit(3);
            assert_eq!(drain(&mut cursor).len(), 12);
            assert!(cursor.walk_state().has_given_up);

            let mut default = Cursor::frame_pointer(&context, 64, &NoSymbolicator);
            drain(&mut default);
            assert!(!default.walk_state().has_given_up);
        }
    }
}
