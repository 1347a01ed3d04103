use std::{fmt, str::FromStr};

/// Default number of operations a domain keeps in flight; also the io_uring ring size.
pub const DEFAULT_QUEUE_DEPTH: u32 = 128;

/// What the io_uring domain does when a completion reports a negative result.
///
/// The operation is resubmitted unchanged (same direction, offset and buffer)
/// while the policy allows another attempt. Once it does not, the failure is
/// delivered to the operation's callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Report the first failure.
    Never,
    /// Resubmit at most `max_retries` times, then report
    /// [`Error::RetriesExhausted`](crate::Error::RetriesExhausted).
    Bounded { max_retries: u32 },
    /// Resubmit until the operation succeeds. A device that keeps failing
    /// stalls the operation forever.
    Unbounded,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Bounded { max_retries: 3 }
    }
}

impl RetryPolicy {
    /// `attempts` is the number of times the operation has been submitted so far.
    pub(crate) fn allows_another_attempt(&self, attempts: u32) -> bool {
        match self {
            RetryPolicy::Never => false,
            RetryPolicy::Bounded { max_retries } => attempts <= *max_retries,
            RetryPolicy::Unbounded => true,
        }
    }
}

/// Parses `never`, `unbounded`, or a retry count.
impl FromStr for RetryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "never" => Ok(RetryPolicy::Never),
            "unbounded" => Ok(RetryPolicy::Unbounded),
            x => match x.parse::<u32>() {
                Ok(0) => Ok(RetryPolicy::Never),
                Ok(max_retries) => Ok(RetryPolicy::Bounded { max_retries }),
                Err(e) => Err(format!("invalid retry policy: {e}: {s:?}")),
            },
        }
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryPolicy::Never => write!(f, "never"),
            RetryPolicy::Bounded { max_retries } => write!(f, "{max_retries}"),
            RetryPolicy::Unbounded => write!(f, "unbounded"),
        }
    }
}

/// Settings for launching a [`CompletionDomain`](crate::CompletionDomain).
///
/// [`Default`] reads the `DIRECT_AIO_*` environment variables, see [`crate::env_tunables`].
#[derive(Debug, Clone)]
pub struct DomainConfig {
    /// Maximum number of operations in flight at once. Submissions beyond it fail
    /// with [`Error::OutOfMemory`](crate::Error::OutOfMemory).
    pub queue_depth: u32,
    /// Only consulted by the io_uring domain.
    pub retry: RetryPolicy,
    /// Only consulted by the worker-pool domain.
    pub worker_threads: usize,
}

impl Default for DomainConfig {
    fn default() -> Self {
        DomainConfig {
            queue_depth: *crate::env_tunables::QUEUE_DEPTH,
            retry: *crate::env_tunables::URING_MAX_RETRIES,
            worker_threads: *crate::env_tunables::WORKER_THREADS,
        }
    }
}
