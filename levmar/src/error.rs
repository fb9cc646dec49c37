use thiserror::Error;

use crate::binding::CallbackKind;
use crate::marshal::BufferKind;
use crate::options::Info;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LevmarError {
    #[error("Invalid problem dimensions: {0}")]
    InvalidDimensions(String),
    #[error("{buffer} buffer size mismatch: expected {expected}, got {actual}")]
    SizeMismatch {
        buffer: BufferKind,
        expected: usize,
        actual: i64,
    },
    #[error("Native {buffer} buffer is null")]
    NullBuffer { buffer: BufferKind },
    #[error("Solver instance is already running a solve")]
    ReentrancyNotSupported,
    /// Guards against a native routine calling back into a callback the
    /// solve never handed it; unreachable with a conforming routine.
    #[error("{callback} callback invoked but none is bound")]
    UnboundCallback { callback: CallbackKind },
    #[error("{callback} callback panicked: {message}")]
    CallbackPanicked {
        callback: CallbackKind,
        message: String,
    },
    #[error("Native solver failed with code {code} ({reason})", reason = .info.reason_label())]
    NativeSolverFailure { code: i32, info: Info },
    /// A callback failed mid-solve. `source` is the recorded failure, `code`
    /// and `info` are what the native routine returned and wrote after it.
    #[error("Solve aborted by callback failure: {source}")]
    CallbackFailed {
        source: Box<LevmarError>,
        code: i32,
        info: Info,
    },
}

impl LevmarError {
    /// Diagnostics written by the native routine, when the call got that far.
    pub fn info(&self) -> Option<&Info> {
        match self {
            Self::NativeSolverFailure { info, .. } | Self::CallbackFailed { info, .. } => Some(info),
            _ => None,
        }
    }
}

pub type LevmarResult<T> = Result<T, LevmarError>;
