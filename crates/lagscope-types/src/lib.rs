use facet::Facet;
use std::error::Error;
use std::fmt;

/// Longest backtrace a single lag report keeps.
pub const STACK_PER_MAX_COUNT: usize = 100;

/// Backtraces shorter than this are too shallow to say anything about a lag.
pub const SHORTEST_MEANINGFUL_STACK: usize = 10;

/// Thread count above which a main-thread block is reported as
/// [`DumpType::BlockThreadTooMuch`].
pub const TOO_MANY_THREADS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantError {
    ZeroId(&'static str),
    EmptyField(&'static str),
    EmptyFrames,
    UnknownCode { kind: &'static str, code: u32 },
}

impl fmt::Display for InvariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroId(field) => write!(f, "{field} must be non-zero"),
            Self::EmptyField(field) => write!(f, "{field} must be non-empty"),
            Self::EmptyFrames => write!(f, "backtrace frames must be non-empty"),
            Self::UnknownCode { kind, code } => write!(f, "unknown {kind} code {code}"),
        }
    }
}

impl Error for InvariantError {}

#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[facet(transparent)]
pub struct ThreadId(u64);

impl ThreadId {
    pub fn new(value: u64) -> Result<Self, InvariantError> {
        if value == 0 {
            return Err(InvariantError::ZeroId("thread_id"));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// One entry of a captured backtrace, symbolicated as far as possible.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub address: u64,
    pub image: Option<String>,
    pub image_base: u64,
    pub symbol: Option<String>,
    pub symbol_address: u64,
    /// Demangled function name from debug info, when the image has any.
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl StackFrame {
    pub fn unresolved(address: u64) -> Self {
        Self {
            address,
            image: None,
            image_base: 0,
            symbol: None,
            symbol_address: 0,
            function: None,
            file: None,
            line: None,
        }
    }

    /// Offset of `address` into its image, if the image is known.
    pub fn image_offset(&self) -> Option<u64> {
        if self.image.is_none() || self.image_base == 0 {
            return None;
        }
        self.address.checked_sub(self.image_base)
    }
}

#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum RegisterOrigin {
    None,
    ThreadState,
    SignalContext,
    Live,
    Supplied,
}

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct ThreadBacktrace {
    pub thread_id: ThreadId,
    pub name: Option<String>,
    pub registers: RegisterOrigin,
    pub frames: Vec<StackFrame>,
    /// The walk stopped on a depth limit rather than at the end of the chain.
    pub gave_up: bool,
}

impl ThreadBacktrace {
    pub fn new(
        thread_id: ThreadId,
        registers: RegisterOrigin,
        frames: Vec<StackFrame>,
    ) -> Result<Self, InvariantError> {
        if frames.is_empty() {
            return Err(InvariantError::EmptyFrames);
        }
        Ok(Self {
            thread_id,
            name: None,
            registers,
            frames,
            gave_up: false,
        })
    }

    pub fn is_meaningful(&self) -> bool {
        self.frames.len() >= SHORTEST_MEANINGFUL_STACK
    }

    /// How this backtrace would be filtered on length alone.
    pub fn length_filter(&self) -> FilterType {
        if self.is_meaningful() {
            FilterType::None
        } else {
            FilterType::Meaningless
        }
    }
}

/// Process-wide details of a crashed capture.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct CrashSummary {
    pub crashed_thread: ThreadId,
    pub is_stack_overflow: bool,
    pub threads: Vec<ThreadId>,
    /// Threads the OS reported, including any past the list's capacity.
    pub threads_seen: u32,
}

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct CaptureBundle {
    pub pid: u32,
    pub target_os: String,
    pub arch: String,
    pub captured_at_unix_ms: u64,
    pub dump_type: DumpType,
    pub crash: Option<CrashSummary>,
    pub backtraces: Vec<ThreadBacktrace>,
}

impl CaptureBundle {
    pub fn new(
        pid: u32,
        target_os: impl Into<String>,
        arch: impl Into<String>,
        captured_at_unix_ms: u64,
        dump_type: DumpType,
    ) -> Result<Self, InvariantError> {
        let target_os = target_os.into();
        if target_os.is_empty() {
            return Err(InvariantError::EmptyField("target_os"));
        }
        let arch = arch.into();
        if arch.is_empty() {
            return Err(InvariantError::EmptyField("arch"));
        }
        Ok(Self {
            pid,
            target_os,
            arch,
            captured_at_unix_ms,
            dump_type,
            crash: None,
            backtraces: Vec::new(),
        })
    }
}

/// Kind of a lag report.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum DumpType {
    Unlag,
    /// Main thread blocked while in the foreground.
    MainThreadBlock,
    BackgroundMainThreadBlock,
    CpuBlock,
    /// Main thread blocked while more than [`TOO_MANY_THREADS`] threads exist.
    BlockThreadTooMuch,
    BlockAndBeKilled,
    PowerConsume,
    Test,
}

impl DumpType {
    pub const ALL: [Self; 8] = [
        Self::Unlag,
        Self::MainThreadBlock,
        Self::BackgroundMainThreadBlock,
        Self::CpuBlock,
        Self::BlockThreadTooMuch,
        Self::BlockAndBeKilled,
        Self::PowerConsume,
        Self::Test,
    ];

    /// Numeric code used in reports.
    pub fn code(self) -> u32 {
        match self {
            Self::Unlag => 2000,
            Self::MainThreadBlock => 2001,
            Self::BackgroundMainThreadBlock => 2002,
            Self::CpuBlock => 2003,
            Self::BlockThreadTooMuch => 2009,
            Self::BlockAndBeKilled => 2010,
            Self::PowerConsume => 2011,
            Self::Test => 10000,
        }
    }

    pub fn from_code(code: u32) -> Result<Self, InvariantError> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.code() == code)
            .ok_or(InvariantError::UnknownCode {
                kind: "dump_type",
                code,
            })
    }
}

/// Why a captured stack was dropped instead of reported.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum FilterType {
    None,
    /// Fewer than [`SHORTEST_MEANINGFUL_STACK`] frames.
    Meaningless,
    /// Same stack as the previous reports, backed off.
    Annealing,
    /// Same stack reported too many times in one day.
    TriggeredTooOften,
}

impl FilterType {
    pub const ALL: [Self; 4] = [
        Self::None,
        Self::Meaningless,
        Self::Annealing,
        Self::TriggeredTooOften,
    ];

    pub fn code(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Meaningless => 1,
            Self::Annealing => 2,
            Self::TriggeredTooOften => 3,
        }
    }

    pub fn from_code(code: u32) -> Result<Self, InvariantError> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.code() == code)
            .ok_or(InvariantError::UnknownCode {
                kind: "filter_type",
                code,
            })
    }
}
