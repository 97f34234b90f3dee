//! Kernel error kinds shared by every subsystem.
//!
//! The source this crate is modeled on returns `-errno` integers from nearly
//! every internal call. We collapse that convention into one `thiserror` enum
//! so callers can match on a kind instead of a magic number.

use thiserror::Error;

/// Result alias used throughout the crate in place of `int`/`-errno`.
pub type KResult<T> = Result<T, KernelError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("already exists")]
    AlreadyExists,
    #[error("not found")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("operation not supported")]
    NotSupported,
    #[error("resource busy")]
    Busy,
    #[error("no space left")]
    NoSpace,
    #[error("read-only filesystem")]
    ReadOnlyFs,
    #[error("too many links")]
    TooManyLinks,
    #[error("name too long")]
    NameTooLong,
    #[error("interrupted")]
    Interrupted,
    #[error("would block")]
    WouldBlock,
    #[error("faulted")]
    Faulted,
    #[error("i/o error: {0}")]
    Io(String),
    #[error("timed out")]
    TimedOut,
    #[error("cancelled")]
    Cancelled,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("sequence error")]
    SequenceError,
    #[error("overflow")]
    Overflow,
    #[error("invalid argument")]
    Invalid,
    #[error("permission denied")]
    Permission,
    #[error("out of range")]
    Range,
    #[error("pipe closed")]
    PipeClosed,
    /// Not part of the source's error list; split out of `Invalid` so `rename`
    /// across filesystems is distinguishable at the call site (see SPEC_FULL.md §7).
    #[error("cross-device link")]
    CrossDevice,
}

impl KernelError {
    /// True for errors an interruptible wait may legitimately swallow (e.g. `close`).
    pub fn is_interrupted(&self) -> bool {
        matches!(self, KernelError::Interrupted)
    }
}

/// Attaches a human-readable detail to an error at the point it is raised,
/// logging it at `warn` level the way the source's call sites `dbg`/`error`
/// traced the `-errno` value before returning it.
pub trait KErrorExt {
    fn context(self, detail: &str) -> KernelError;
}

impl KErrorExt for KernelError {
    fn context(self, detail: &str) -> KernelError {
        log::warn!("{self}: {detail}");
        self
    }
}
