use lagscope_capture::{
    Cursor, InlineName, MachineContext, RegisterSource, StackCursor, StackEntry, Symbolicator,
    ThreadHandle,
};
use lagscope_types::{
    CrashSummary, DumpType, InvariantError, RegisterOrigin, StackFrame, TOO_MANY_THREADS,
    ThreadBacktrace, ThreadId,
};

pub(crate) fn register_origin(source: RegisterSource) -> RegisterOrigin {
    match source {
        RegisterSource::None => RegisterOrigin::None,
        RegisterSource::ThreadState => RegisterOrigin::ThreadState,
        RegisterSource::SignalContext => RegisterOrigin::SignalContext,
        RegisterSource::Live => RegisterOrigin::Live,
        RegisterSource::Supplied => RegisterOrigin::Supplied,
    }
}

fn lossy(name: Option<&InlineName>) -> Option<String> {
    name.filter(|name| !name.is_empty())
        .map(|name| name.to_string_lossy().into_owned())
}

pub(crate) fn frame_from_entry(entry: &StackEntry) -> StackFrame {
    StackFrame {
        image: lossy(entry.image_name.as_ref()),
        image_base: entry.image_address as u64,
        symbol: lossy(entry.symbol_name.as_ref()),
        symbol_address: entry.symbol_address as u64,
        ..StackFrame::unresolved(entry.address as u64)
    }
}

/// Drains `cursor`, symbolicating each entry on the way.
pub(crate) fn collect_frames(cursor: &mut dyn StackCursor) -> Vec<StackFrame> {
    let mut frames = Vec::new();
    while cursor.advance() {
        cursor.symbolicate();
        frames.push(frame_from_entry(cursor.entry()));
    }
    frames
}

/// Symbolicates an already-captured address list.
pub(crate) fn frames_from_addresses(
    addresses: &[usize],
    symbolicator: &dyn Symbolicator,
) -> Vec<StackFrame> {
    let mut cursor = Cursor::backtrace(addresses, 0, symbolicator);
    collect_frames(&mut cursor)
}

pub(crate) fn thread_id(thread: ThreadHandle) -> Result<ThreadId, InvariantError> {
    ThreadId::new(thread.as_raw())
}

/// Walks `context` and turns the result into a report record.
pub(crate) fn backtrace_for_context(
    context: &MachineContext,
    max_frames: usize,
    symbolicator: &dyn Symbolicator,
) -> Result<ThreadBacktrace, InvariantError> {
    let mut cursor = Cursor::frame_pointer(context, max_frames, symbolicator);
    let frames = collect_frames(&mut cursor);
    let gave_up = cursor.walk_state().has_given_up;
    let mut backtrace = ThreadBacktrace::new(
        thread_id(context.thread())?,
        register_origin(context.register_source()),
        frames,
    )?;
    backtrace.gave_up = gave_up;
    backtrace.name = thread_name(context.thread());
    Ok(backtrace)
}

pub(crate) fn crash_summary(context: &MachineContext) -> Result<CrashSummary, InvariantError> {
    let threads = context
        .threads()
        .iter()
        .map(thread_id)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(CrashSummary {
        crashed_thread: thread_id(context.thread())?,
        is_stack_overflow: context.is_stack_overflow(),
        threads,
        threads_seen: u32::try_from(context.threads().total_seen()).unwrap_or(u32::MAX),
    })
}

/// Report kind of a main-thread block, given how many threads were alive.
pub(crate) fn block_dump_type(threads_seen: usize) -> DumpType {
    if threads_seen > TOO_MANY_THREADS {
        DumpType::BlockThreadTooMuch
    } else {
        DumpType::MainThreadBlock
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn thread_name(thread: ThreadHandle) -> Option<String> {
    let path = format!("/proc/self/task/{}/comm", thread.as_raw());
    let name = std::fs::read_to_string(path).ok()?;
    let name = name.trim_end();
    (!name.is_empty()).then(|| name.to_owned())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn thread_name(_thread: ThreadHandle) -> Option<String> {
    None
}
