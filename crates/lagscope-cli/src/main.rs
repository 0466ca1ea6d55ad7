use facet::Facet;
use figue as args;
use lagscope_capture::{
    MachineContext, Symbolicator, capture_backtrace, capture_crash_context,
    capture_current_backtrace, current_thread,
};
use lagscope_types::{CaptureBundle, DumpType, STACK_PER_MAX_COUNT, ThreadBacktrace};
use std::fs;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

mod debug_info;
mod report;
mod worker;

use debug_info::DebugInfo;
use worker::StuckWorker;

type AnyResult<T> = Result<T, String>;

const DEFAULT_DEPTH: usize = 24;
const MAX_FRAMES_LIMIT: usize = 4096;
const MAX_DEPTH: usize = 10_000;

#[derive(Facet, Debug)]
struct Cli {
    #[facet(flatten)]
    builtins: args::FigueBuiltins,
    /// Write the bundle here instead of printing it.
    #[facet(args::named, default)]
    out: Option<String>,
    /// Most frames kept per backtrace.
    #[facet(args::named, default)]
    max_frames: Option<String>,
    /// Recursion depth of the stuck worker thread.
    #[facet(args::named, default)]
    depth: Option<String>,
    /// Skip DWARF lookups; keep only what `dladdr` reports.
    #[facet(args::named, default)]
    no_debug_info: bool,
    #[facet(args::subcommand)]
    command: CommandKind,
}

#[derive(Facet, Debug)]
#[repr(u8)]
enum CommandKind {
    /// Capture a worker thread stuck in deep recursion.
    StuckWorker,
    /// Capture the calling thread.
    Current,
    /// Capture a crash context for a stuck worker plus every thread's stack.
    AllThreads,
}

struct Config {
    out: Option<PathBuf>,
    max_frames: usize,
    depth: usize,
    debug_info: bool,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> AnyResult<()> {
    let cli = parse_cli()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = config_from_cli(&cli)?;
    if let Err(err) = lagscope_capture::install_sampler() {
        tracing::warn!(%err, "register sampler unavailable; other threads will come back empty");
    }

    let symbolicator = default_symbolicator();
    let mut bundle = match cli.command {
        CommandKind::StuckWorker => capture_stuck_worker(&cfg, symbolicator)?,
        CommandKind::Current => capture_current(&cfg, symbolicator)?,
        CommandKind::AllThreads => capture_all_threads(&cfg, symbolicator)?,
    };

    if cfg.debug_info {
        let mut debug_info = DebugInfo::default();
        for backtrace in &mut bundle.backtraces {
            debug_info.annotate(&mut backtrace.frames);
        }
    }

    let encoded = facet_json::to_string_pretty(&bundle)
        .map_err(|e| format!("failed to encode capture bundle as JSON: {e}"))?;
    match &cfg.out {
        Some(path) => {
            fs::write(path, encoded).map_err(|e| {
                format!(
                    "failed to write capture bundle to {}: {e}",
                    path.display()
                )
            })?;
            println!(
                "captured {} backtraces into {}",
                bundle.backtraces.len(),
                path.display()
            );
        }
        None => println!("{encoded}"),
    }
    Ok(())
}

fn parse_cli() -> AnyResult<Cli> {
    let figue_config = args::builder::<Cli>()
        .map_err(|e| format!("failed to build CLI schema: {e}"))?
        .cli(|cli| cli.strict())
        .help(|h| {
            h.program_name("lagscope")
                .description("Capture thread backtraces of this process and emit them as JSON")
                .version(option_env!("CARGO_PKG_VERSION").unwrap_or("dev"))
        })
        .build();

    args::Driver::new(figue_config)
        .run()
        .into_result()
        .map(|v| v.value)
        .map_err(|e| e.to_string())
}

fn parse_count(
    name: &str,
    value: Option<String>,
    default: usize,
    range: RangeInclusive<usize>,
) -> AnyResult<usize> {
    let count = match value {
        None => default,
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map_err(|e| format!("invalid {name} {raw:?}: {e}"))?,
    };
    if !range.contains(&count) {
        return Err(format!(
            "{name} must be between {} and {}, got {count}",
            range.start(),
            range.end()
        ));
    }
    Ok(count)
}

fn config_from_cli(cli: &Cli) -> AnyResult<Config> {
    let out = cli
        .out
        .clone()
        .or_else(|| std::env::var("LAGSCOPE_OUT").ok())
        .map(PathBuf::from);

    let max_frames = parse_count(
        "max-frames",
        cli.max_frames
            .clone()
            .or_else(|| std::env::var("LAGSCOPE_MAX_FRAMES").ok()),
        STACK_PER_MAX_COUNT,
        1..=MAX_FRAMES_LIMIT,
    )?;

    let depth = parse_count(
        "depth",
        cli.depth
            .clone()
            .or_else(|| std::env::var("LAGSCOPE_DEPTH").ok()),
        DEFAULT_DEPTH,
        0..=MAX_DEPTH,
    )?;

    Ok(Config {
        out,
        max_frames,
        depth,
        debug_info: !cli.no_debug_info,
    })
}

#[cfg(unix)]
fn default_symbolicator() -> &'static dyn Symbolicator {
    &lagscope_capture::DladdrSymbolicator
}

#[cfg(not(unix))]
fn default_symbolicator() -> &'static dyn Symbolicator {
    &lagscope_capture::NoSymbolicator
}

fn new_bundle(dump_type: DumpType) -> AnyResult<CaptureBundle> {
    let captured_at_unix_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0);
    CaptureBundle::new(
        std::process::id(),
        std::env::consts::OS,
        std::env::consts::ARCH,
        captured_at_unix_ms,
        dump_type,
    )
    .map_err(|e| format!("invariant violated: {e}"))
}

fn addresses_to_backtrace(
    thread: lagscope_capture::ThreadHandle,
    addresses: &[usize],
    registers: lagscope_types::RegisterOrigin,
    symbolicator: &dyn Symbolicator,
) -> AnyResult<ThreadBacktrace> {
    let frames = report::frames_from_addresses(addresses, symbolicator);
    let thread_id =
        report::thread_id(thread).map_err(|e| format!("invariant violated: {e}"))?;
    let mut backtrace = ThreadBacktrace::new(thread_id, registers, frames)
        .map_err(|e| format!("captured no frames for thread {}: {e}", thread.as_raw()))?;
    backtrace.name = report::thread_name(thread);
    Ok(backtrace)
}

fn capture_stuck_worker(cfg: &Config, symbolicator: &dyn Symbolicator) -> AnyResult<CaptureBundle> {
    let worker = StuckWorker::spawn(cfg.depth)?;
    let mut addresses = vec![0usize; cfg.max_frames];
    let count = capture_backtrace(worker.thread(), &mut addresses);
    tracing::info!(thread = worker.thread().as_raw(), frames = count, "captured stuck worker");

    let backtrace = addresses_to_backtrace(
        worker.thread(),
        &addresses[..count],
        lagscope_types::RegisterOrigin::ThreadState,
        symbolicator,
    )?;
    drop(worker);

    let mut bundle = new_bundle(DumpType::Test)?;
    if !backtrace.is_meaningful() {
        tracing::warn!(frames = backtrace.frames.len(), "backtrace is too short to be meaningful");
    }
    bundle.backtraces.push(backtrace);
    Ok(bundle)
}

#[inline(never)]
fn capture_current(cfg: &Config, symbolicator: &dyn Symbolicator) -> AnyResult<CaptureBundle> {
    let mut addresses = vec![0usize; cfg.max_frames];
    let count = capture_current_backtrace(&mut addresses);
    tracing::info!(frames = count, "captured current thread");

    let backtrace = addresses_to_backtrace(
        current_thread(),
        &addresses[..count],
        lagscope_types::RegisterOrigin::Live,
        symbolicator,
    )?;
    let mut bundle = new_bundle(DumpType::Test)?;
    bundle.backtraces.push(backtrace);
    Ok(bundle)
}

fn capture_all_threads(cfg: &Config, symbolicator: &dyn Symbolicator) -> AnyResult<CaptureBundle> {
    let worker = StuckWorker::spawn(cfg.depth)?;
    let crash = capture_crash_context(worker.thread());
    let summary =
        report::crash_summary(&crash).map_err(|e| format!("invariant violated: {e}"))?;
    tracing::info!(
        threads = crash.thread_count(),
        seen = crash.threads().total_seen(),
        overflow = crash.is_stack_overflow(),
        "captured crash context"
    );

    let mut bundle = new_bundle(report::block_dump_type(crash.threads().total_seen()))?;
    for thread in crash.threads().iter() {
        let context = if thread == current_thread() {
            MachineContext::capture_here()
        } else {
            MachineContext::capture(thread, false)
        };
        match report::backtrace_for_context(&context, cfg.max_frames, symbolicator) {
            Ok(backtrace) => bundle.backtraces.push(backtrace),
            Err(err) => {
                tracing::warn!(
                    thread = thread.as_raw(),
                    %err,
                    "skipping thread without a backtrace"
                );
            }
        }
    }
    drop(crash);
    drop(worker);

    bundle.crash = Some(summary);
    Ok(bundle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lagscope_capture::NoSymbolicator;

    #[test]
    fn counts_parse_with_defaults() {
        assert_eq!(parse_count("depth", None, 24, 0..=100), Ok(24));
        assert_eq!(parse_count("depth", Some(" 7 ".to_owned()), 24, 0..=100), Ok(7));
        let err = parse_count("depth", Some("deep".to_owned()), 24, 0..=100)
            .expect_err("not a number");
        assert!(err.starts_with("invalid depth \"deep\""), "got {err}");
    }

    #[test]
    fn counts_outside_their_range_are_rejected() {
        let zero = parse_count("max-frames", Some("0".to_owned()), 100, 1..=MAX_FRAMES_LIMIT)
            .expect_err("zero frames");
        assert_eq!(zero, "max-frames must be between 1 and 4096, got 0");

        let huge = parse_count(
            "max-frames",
            Some(usize::MAX.to_string()),
            100,
            1..=MAX_FRAMES_LIMIT,
        )
        .expect_err("too many frames");
        assert!(huge.starts_with("max-frames must be between 1 and 4096"), "got {huge}");

        assert_eq!(
            parse_count("max-frames", Some("4096".to_owned()), 100, 1..=MAX_FRAMES_LIMIT),
            Ok(4096)
        );
    }

    #[test]
    fn bundles_describe_this_process() {
        let bundle = new_bundle(DumpType::Test).expect("bundle should build");
        assert_eq!(bundle.pid, std::process::id());
        assert_eq!(bundle.target_os, std::env::consts::OS);
        assert!(bundle.captured_at_unix_ms > 0);
        assert!(bundle.backtraces.is_empty());
    }

    #[cfg(all(
        any(target_os = "linux", target_os = "macos"),
        any(target_arch = "x86_64", target_arch = "aarch64")
    ))]
    #[test]
    fn stuck_worker_bundle_holds_its_recursion() {
        let cfg = Config {
            out: None,
            max_frames: 64,
            depth: 16,
            debug_info: false,
        };
        let bundle = capture_stuck_worker(&cfg, &NoSymbolicator).expect("capture should succeed");
        assert_eq!(bundle.backtraces.len(), 1);
        assert!(bundle.backtraces[0].frames.len() >= 16);
        assert_eq!(bundle.dump_type, DumpType::Test);
    }

    #[cfg(all(
        any(target_os = "linux", target_os = "macos"),
        any(target_arch = "x86_64", target_arch = "aarch64")
    ))]
    #[test]
    fn all_threads_bundle_has_a_crash_summary() {
        let cfg = Config {
            out: None,
            max_frames: 64,
            depth: 8,
            debug_info: false,
        };
        let bundle = capture_all_threads(&cfg, &NoSymbolicator).expect("capture should succeed");
        let crash = bundle.crash.as_ref().expect("crash summary should be present");
        assert!(!crash.is_stack_overflow);
        assert!(!crash.threads.is_empty());
        assert!(!bundle.backtraces.is_empty());
    }
}
