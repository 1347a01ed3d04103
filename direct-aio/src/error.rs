use std::fmt::{self, Debug, Display};

use crate::domain::Backend;

/// Coarse outcome of an operation, as the storage engine consumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    IoError,
    OutOfMemory,
}

/// Failure of a submission or of an operation's completion.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),
    #[error("offset {offset}, length {len} or buffer address {addr:#x} is not aligned to {alignment} bytes")]
    Misaligned {
        offset: u64,
        len: usize,
        addr: usize,
        alignment: usize,
    },
    #[error("transfer length {0} does not fit in 32 bits")]
    LengthOverflow(usize),
    #[error("giving up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn status(&self) -> Status {
        match self {
            Error::OutOfMemory(_) => Status::OutOfMemory,
            Error::Io(_)
            | Error::Misaligned { .. }
            | Error::LengthOverflow(_)
            | Error::RetriesExhausted { .. } => Status::IoError,
        }
    }

    /// The OS error code behind this error, if there is one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io(e) | Error::RetriesExhausted { source: e, .. } => e.raw_os_error(),
            Error::Misaligned { .. } => Some(libc::EINVAL),
            Error::OutOfMemory(_) | Error::LengthOverflow(_) => None,
        }
    }

    /// Build from the negated errno that io_uring and Linux AIO report in completions.
    pub(crate) fn from_negative_result(res: i64) -> Self {
        let errno = i32::try_from(-res).unwrap_or(libc::EIO);
        Error::Io(std::io::Error::from_raw_os_error(errno))
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::Io(std::io::Error::from(errno))
    }
}

/// A rejected submission. The operation never reached the kernel; `resources`
/// holds the caller context and buffer that were passed in.
pub struct SubmitError<R> {
    pub error: Error,
    pub resources: R,
}

impl<R> SubmitError<R> {
    pub fn into_parts(self) -> (R, Error) {
        (self.resources, self.error)
    }

    pub fn status(&self) -> Status {
        self.error.status()
    }
}

impl<R> Debug for SubmitError<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmitError")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<R> Display for SubmitError<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            write!(f, "submission rejected: {:#}", self.error)
        } else {
            write!(f, "submission rejected: {}", self.error)
        }
    }
}

impl<R> std::error::Error for SubmitError<R> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("io_uring setup failed: {0}")]
    IoUringBuild(#[source] std::io::Error),
    #[error("io_setup failed: {0}")]
    AioSetup(#[source] std::io::Error),
    #[error("cannot spawn worker thread: {0}")]
    SpawnWorker(#[source] std::io::Error),
    #[error("cannot allocate the in-flight operation table")]
    OutOfMemory,
    #[error("queue depth must be at least 1")]
    ZeroQueueDepth,
    #[error("backend {0:?} is not available on this platform")]
    Unsupported(Backend),
}
