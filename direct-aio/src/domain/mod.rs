//! Completion domains: the per-backend owners of a kernel completion queue.
//!
//! Every domain keeps the [`Operation`]s it accepted in a [`slots::Slots`]
//! table; the slot index is the tag the kernel (or a worker thread) reports back
//! on completion. An operation is retrievable only through the domain it was
//! submitted to.

#[cfg(target_os = "linux")]
mod aio;
pub(crate) mod slots;
mod thread_pool;
#[cfg(target_os = "linux")]
mod uring;

#[cfg(test)]
mod tests;

use std::sync::{atomic::AtomicUsize, Arc};

#[cfg(target_os = "linux")]
pub use aio::AioDomain;
pub use thread_pool::ThreadPoolDomain;
#[cfg(target_os = "linux")]
pub use uring::UringDomain;

use tracing::trace;

use crate::{
    metrics::MetricsStorage,
    ops::{Operation, Rejected},
    DomainConfig, Error, LaunchError,
};

pub(crate) static DOMAIN_ID: AtomicUsize = AtomicUsize::new(0);

/// A source of completions for asynchronous file operations.
///
/// Submission happens through [`AsyncFile`](crate::AsyncFile). Completions are
/// only delivered when somebody calls [`CompletionDomain::try_complete`]; the
/// domain never runs callbacks on its own.
///
/// Domains are `Send + Sync` and are shared through `Arc`. Callbacks run
/// without any domain lock held, so they may submit further operations.
///
/// Dropping a domain blocks until every accepted operation has completed and
/// its callback has run.
pub trait CompletionDomain: crate::sealed::Sealed + Send + Sync {
    /// Probe for one completion without blocking.
    ///
    /// Returns `true` if a callback was invoked. `false` means nothing was ready,
    /// or that a failed io_uring operation was resubmitted under the domain's
    /// [`RetryPolicy`](crate::RetryPolicy).
    fn try_complete(&self) -> bool;

    /// Number of operations accepted but not yet delivered.
    fn pending(&self) -> usize;

    fn backend(&self) -> Backend;

    #[doc(hidden)]
    fn submit(&self, op: Box<Operation>) -> Result<(), Rejected>;
}

/// The kernel mechanism behind a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Linux native AIO (`io_submit` / `io_getevents`).
    LinuxAio,
    IoUring,
    /// Positional reads and writes on a pool of worker threads. Works everywhere.
    ThreadPool,
}

impl Backend {
    pub fn platform_default() -> Backend {
        if cfg!(target_os = "linux") {
            Backend::IoUring
        } else {
            Backend::ThreadPool
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linux-aio" | "aio" => Ok(Backend::LinuxAio),
            "io-uring" | "uring" => Ok(Backend::IoUring),
            "thread-pool" | "threads" => Ok(Backend::ThreadPool),
            x => Err(format!("unknown backend: {x:?}")),
        }
    }
}

/// Launch a domain of the given backend.
pub fn launch(
    backend: Backend,
    config: DomainConfig,
) -> Result<Arc<dyn CompletionDomain>, LaunchError> {
    match backend {
        #[cfg(target_os = "linux")]
        Backend::LinuxAio => Ok(Arc::new(AioDomain::launch(config)?)),
        #[cfg(target_os = "linux")]
        Backend::IoUring => Ok(Arc::new(UringDomain::launch(config)?)),
        #[cfg(not(target_os = "linux"))]
        Backend::LinuxAio | Backend::IoUring => Err(LaunchError::Unsupported(backend)),
        Backend::ThreadPool => Ok(Arc::new(ThreadPoolDomain::launch(config)?)),
    }
}

/// Run the callback of a finished operation and account for it.
/// Callers must not hold any domain lock.
pub(crate) fn deliver(metrics: &MetricsStorage, op: Box<Operation>, res: Result<usize, Error>) {
    match &res {
        Ok(n) => {
            trace!(bytes = n, "operation completed");
            MetricsStorage::inc(&metrics.ops_completed);
        }
        Err(e) => {
            trace!(error = %e, "operation failed");
            MetricsStorage::inc(&metrics.ops_failed);
        }
    }
    op.complete(res);
}
