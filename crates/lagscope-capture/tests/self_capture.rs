#![cfg(all(
    any(target_os = "linux", target_os = "macos"),
    any(target_arch = "x86_64", target_arch = "aarch64")
))]

use lagscope_capture::{capture_backtrace, capture_current_backtrace, current_thread};
use std::hint::black_box;

#[inline(never)]
fn nested(depth: usize, out: &mut [usize]) -> usize {
    if depth == 0 {
        return capture_current_backtrace(out);
    }
    black_box(nested(black_box(depth - 1), out))
}

#[test]
fn backtrace_grows_with_call_depth() {
    let mut shallow = [0usize; 256];
    let shallow_count = nested(2, &mut shallow);

    let mut deep = [0usize; 256];
    let deep_count = nested(22, &mut deep);

    assert!(shallow_count > 2);
    assert_eq!(deep_count, shallow_count + 20);
}

#[test]
fn current_thread_by_handle_matches_the_shorthand() {
    let mut by_handle = [0usize; 128];
    let mut shorthand = [0usize; 128];
    let a = capture_backtrace(current_thread(), &mut by_handle);
    let b = capture_current_backtrace(&mut shorthand);
    assert!(a > 2);
    assert_eq!(a, b);
    // The first two entries are call sites that differ between the two
    // calls; everything from this function's caller outwards is shared.
    assert_eq!(by_handle[2..a], shorthand[2..b]);
}

#[test]
fn zero_capacity_is_a_no_op() {
    assert_eq!(capture_current_backtrace(&mut []), 0);
}
