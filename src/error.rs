//! Crate-wide error type.
//!
//! Internal modules propagate `std::io::Error` directly with `?`, the way
//! the teacher's library code does. `Error` exists only at the boundary
//! (`main`) where an exit code has to be chosen, carrying the taxonomy from
//! the error handling design: usage/config errors exit 2, OS errors exit 1,
//! internal invariant violations exit 3.

use std::fmt;
use std::io;

/// Top-level daemon error, tagged with the exit code it should produce.
#[derive(Debug)]
pub enum Error {
    /// Usage or configuration-file error: exit 2.
    Usage(String),
    /// OS-level error with no local recovery: exit 1.
    Os(io::Error),
    /// Internal invariant violated: exit 3. These represent bugs; no
    /// attempt is made to continue.
    Internal(String),
    /// A command written to the kernel channel came back short on a
    /// non-recoverable errno: exit 1.
    KernelCommand { cmd: String, errno: i32 },
}

impl Error {
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub fn usage(msg: impl Into<String>) -> Self {
        Error::Usage(msg.into())
    }

    /// The process exit code this error should produce (spec §7).
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Usage(_) => 2,
            Error::Os(_) => 1,
            Error::Internal(_) => 3,
            Error::KernelCommand { .. } => 1,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Usage(msg) => write!(f, "usage error: {msg}"),
            Error::Os(err) => write!(f, "OS error: {err}"),
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
            Error::KernelCommand { cmd, errno } => {
                write!(f, "kernel rejected command {cmd:?}: errno {errno}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Os(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Os(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Errno values that non-cull-queue callers are expected to recover from
/// locally rather than propagate as an [`Error`] (spec §7).
pub fn is_recoverable_errno(errno: i32) -> bool {
    matches!(errno, libc::ESTALE | libc::ENOENT | libc::EBUSY)
}
