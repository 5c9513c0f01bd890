//! Error types for the embrs runtime.
//!
//! Two kinds of failure cross the host boundary: compile errors (reported
//! with file and line, rendered by [`crate::diagnostic`]) and uncaught
//! runtime exceptions (rendered with the exception's message and stack
//! trace). Everything else — a raised exception with a matching handler,
//! a `finally` re-raise — stays inside the VM and never becomes an
//! [`Error`].

use thiserror::Error;

use crate::diagnostic::Diagnostic;

pub type Result<T> = std::result::Result<T, Error>;

/// A failure reported to the embedding host.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The source did not compile. Carries a rendered diagnostic with the
    /// offending file, line, and source snippet.
    #[error("{0}")]
    Compile(Diagnostic),

    /// An exception propagated out of the top-level frame without finding
    /// a handler.
    #[error("Unhandled {class}: {message}\n  StackTrace:\n{stacktrace}")]
    Runtime {
        /// Name of the exception's class (`Exception` unless user code
        /// raised a subclass).
        class: String,
        /// The exception's `message` property, already stringified.
        message: String,
        /// The exception's `stacktrace` property, one `file:line → name()`
        /// entry per frame.
        stacktrace: String,
    },

    /// The host allocator failed or some other unrecoverable condition was
    /// hit. Not catchable from script code.
    #[error("terminal failure: {0}")]
    Fatal(String),
}

impl Error {
    /// The process exit code conventionally associated with this error:
    /// 10 for compile errors, 11 for runtime errors, 12 for terminal
    /// failures. A clean run exits 0.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Compile(_) => 10,
            Error::Runtime { .. } => 11,
            Error::Fatal(_) => 12,
        }
    }
}
