use std::sync::atomic::{AtomicU64, Ordering};

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metrics {
    pub domains_created: u64,
    pub domains_destroyed: u64,
    pub ops_submitted: u64,
    pub ops_completed: u64,
    pub ops_failed: u64,
    pub ops_retried: u64,
    pub poll_errors: u64,
}

pub(crate) struct MetricsStorage {
    pub(crate) domains_created: AtomicU64,
    pub(crate) domains_destroyed: AtomicU64,
    pub(crate) ops_submitted: AtomicU64,
    /// Callbacks invoked with a success result.
    pub(crate) ops_completed: AtomicU64,
    /// Callbacks invoked with an error result.
    pub(crate) ops_failed: AtomicU64,
    pub(crate) ops_retried: AtomicU64,
    /// Failed attempts to reap completions from the kernel.
    pub(crate) poll_errors: AtomicU64,
}

impl MetricsStorage {
    pub(crate) const fn new_const() -> Self {
        MetricsStorage {
            domains_created: AtomicU64::new(0),
            domains_destroyed: AtomicU64::new(0),
            ops_submitted: AtomicU64::new(0),
            ops_completed: AtomicU64::new(0),
            ops_failed: AtomicU64::new(0),
            ops_retried: AtomicU64::new(0),
            poll_errors: AtomicU64::new(0),
        }
    }

    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn make_pub(&self) -> Metrics {
        Metrics {
            domains_created: self.domains_created.load(Ordering::Relaxed),
            domains_destroyed: self.domains_destroyed.load(Ordering::Relaxed),
            ops_submitted: self.ops_submitted.load(Ordering::Relaxed),
            ops_completed: self.ops_completed.load(Ordering::Relaxed),
            ops_failed: self.ops_failed.load(Ordering::Relaxed),
            ops_retried: self.ops_retried.load(Ordering::Relaxed),
            poll_errors: self.poll_errors.load(Ordering::Relaxed),
        }
    }
}

pub(crate) static GLOBAL_STORAGE: MetricsStorage = MetricsStorage::new_const();

pub fn global() -> Metrics {
    GLOBAL_STORAGE.make_pub()
}
