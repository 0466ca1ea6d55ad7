use crate::thread::ThreadHandle;
use std::error::Error;
use std::fmt;

/// Failure of one platform operation underneath a capture.
///
/// Captures themselves never return this: a failed step leaves the context
/// with zeroed registers or an empty thread list and the walk ends short.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    UnsupportedPlatform {
        target_os: &'static str,
    },
    /// A Mach call returned something other than `KERN_SUCCESS`.
    Kernel {
        call: &'static str,
        code: i32,
    },
    /// A libc call failed; `errno` is the raw OS error.
    Os {
        call: &'static str,
        errno: i32,
    },
    SamplerUnavailable,
    SamplerBusy,
    SampleTimeout {
        thread: ThreadHandle,
    },
}

impl CaptureError {
    pub(crate) fn last_os_error(call: &'static str) -> Self {
        Self::Os {
            call,
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedPlatform { target_os } => write!(
                f,
                "unsupported platform for thread capture: {target_os}; only Linux and macOS are implemented"
            ),
            Self::Kernel { call, code } => write!(f, "{call} failed with kern_return_t {code}"),
            Self::Os { call, errno } => write!(
                f,
                "{call} failed: {}",
                std::io::Error::from_raw_os_error(*errno)
            ),
            Self::SamplerUnavailable => write!(
                f,
                "register sampler is not installed and could not be installed"
            ),
            Self::SamplerBusy => write!(f, "all register sampler slots are in use"),
            Self::SampleTimeout { thread } => write!(
                f,
                "thread {} did not answer the sampling signal in time",
                thread.as_raw()
            ),
        }
    }
}

impl Error for CaptureError {}
