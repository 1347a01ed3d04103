//! Asynchronous, unbuffered file I/O for a log-structured storage engine.
//!
//! # Usage
//!
//! 1. Launch a completion domain with [`launch`] (or one of the concrete
//!    domains, e.g. [`UringDomain::launch`]). A domain wraps one kernel
//!    completion queue and is typically created once per worker thread.
//! 2. Open an [`AsyncFile`] against the domain.
//! 3. Call [`AsyncFile::read`] or [`AsyncFile::write`]. The call hands the
//!    buffer and a caller context to the domain and returns immediately.
//! 4. Repeatedly call [`CompletionDomain::try_complete`]. When an operation
//!    finishes, its callback runs inline with the context, the buffer and the
//!    result.
//!
//! Ownership of the buffer is transferred to the domain for as long as the
//! kernel may access it. It comes back either through the callback or, if the
//! submission was rejected, inside the returned [`SubmitError`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use direct_aio::{AlignedBuf, AsyncFile, Backend, CreateDisposition, DomainConfig, FileOptions};
//! use std::sync::{atomic::{AtomicBool, Ordering}, Arc};
//!
//! let domain = direct_aio::launch(Backend::platform_default(), DomainConfig::default()).unwrap();
//! let file = AsyncFile::open(
//!     "/var/lib/engine/log.0",
//!     CreateDisposition::OpenOrCreate,
//!     FileOptions { unbuffered: true },
//!     Arc::clone(&domain),
//! )
//! .unwrap()
//! .into_file()
//! .unwrap();
//!
//! let done = Arc::new(AtomicBool::new(false));
//! let buf = AlignedBuf::zeroed(4096, file.device_alignment());
//! file.write(0, buf, Arc::clone(&done), |(done, _buf), res| {
//!     assert_eq!(res.unwrap(), 4096);
//!     done.store(true, Ordering::Release);
//! })
//! .unwrap();
//! while !done.load(Ordering::Acquire) {
//!     domain.try_complete();
//! }
//! ```
//!
//! With tokio, [`driver::spawn_driver`] polls a domain from a task and
//! [`AsyncFile::read_owned`] / [`AsyncFile::write_owned`] return futures.

pub(crate) mod sealed {
    pub trait Sealed {}
}

mod config;
pub mod domain;
pub mod driver;
mod error;
pub mod file;
pub mod metrics;
pub mod ops;

pub use aio_common::buf::{AlignedBuf, IoBuf, IoBufMut};
pub use config::{DomainConfig, RetryPolicy, DEFAULT_QUEUE_DEPTH};
pub use domain::{launch, Backend, CompletionDomain, ThreadPoolDomain};
#[cfg(target_os = "linux")]
pub use domain::{AioDomain, UringDomain};
pub use error::{Error, LaunchError, Status, SubmitError};
pub use file::{AsyncFile, CreateDisposition, FileOptions, Handle, OpenOutcome, DEVICE_ALIGNMENT};

#[doc(hidden)]
pub mod env_tunables {
    use crate::RetryPolicy;

    fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T
    where
        T::Err: std::fmt::Display,
    {
        match std::env::var(name) {
            Ok(v) => v
                .parse()
                .unwrap_or_else(|e| panic!("{name} has invalid value {v:?}: {e}")),
            Err(std::env::VarError::NotPresent) => default,
            Err(std::env::VarError::NotUnicode(_)) => {
                panic!("{name} must be a unicode string")
            }
        }
    }

    pub(crate) static QUEUE_DEPTH: once_cell::sync::Lazy<u32> = once_cell::sync::Lazy::new(|| {
        parse_env("DIRECT_AIO_QUEUE_DEPTH", crate::DEFAULT_QUEUE_DEPTH)
    });
    pub(crate) static URING_MAX_RETRIES: once_cell::sync::Lazy<RetryPolicy> =
        once_cell::sync::Lazy::new(|| {
            parse_env("DIRECT_AIO_URING_MAX_RETRIES", RetryPolicy::default())
        });
    pub(crate) static WORKER_THREADS: once_cell::sync::Lazy<usize> =
        once_cell::sync::Lazy::new(|| parse_env("DIRECT_AIO_WORKER_THREADS", 4));

    pub fn assert_no_unknown_env_vars() {
        std::env::vars()
            .filter_map(|(v, _)| {
                if v.starts_with("DIRECT_AIO_") {
                    Some(v)
                } else {
                    None
                }
            })
            .for_each(|v| match v.as_str() {
                "DIRECT_AIO_QUEUE_DEPTH"
                | "DIRECT_AIO_URING_MAX_RETRIES"
                | "DIRECT_AIO_WORKER_THREADS" => {}
                x => panic!("env var starts with DIRECT_AIO but is not an env_tunable: {x:?}"),
            });
    }
}
