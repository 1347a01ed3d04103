//! Completion domain backed by an io_uring instance.

#[cfg(test)]
mod tests;

#[cfg(test)]
use std::sync::atomic::AtomicU32;
use std::{
    io,
    mem::ManuallyDrop,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use aio_common::io_uring::{
    self, opcode, squeue, types, CompletionQueue, SubmissionQueue, Submitter,
};
use tracing::{debug, error, info, info_span, trace, warn};

use crate::{
    domain::{deliver, slots::Slots, Backend, CompletionDomain, DOMAIN_ID},
    metrics::{MetricsStorage, GLOBAL_STORAGE},
    ops::{OpKind, Operation, Rejected},
    DomainConfig, Error, LaunchError, RetryPolicy,
};

/// An io_uring submission/completion queue pair.
///
/// The ring is split into its submission side and its completion side, each
/// behind its own lock, so submitting threads and polling threads only contend
/// on the in-flight table. An SQE's `user_data` is the operation's slot index.
///
/// Operations that complete with an error are resubmitted according to the
/// configured [`RetryPolicy`].
pub struct UringDomain {
    id: usize,
    retry: RetryPolicy,
    // both borrow from `split_uring` and are dropped before it, in `drop`
    submit_side: ManuallyDrop<Mutex<SubmitSide>>,
    completion_side: ManuallyDrop<Mutex<CompletionSide>>,
    slots: Mutex<Slots>,
    /// Set when `io_uring_enter` failed after an SQE was already published.
    stranded: AtomicBool,
    metrics: &'static MetricsStorage,
    #[cfg(test)]
    testing: Option<FaultInjection>,
    split_uring: *mut io_uring::IoUring,
}

// SAFETY: we never use the raw IoUring pointer except to free it on drop,
// and all accesses to the split parts go through the mutexes.
unsafe impl Send for UringDomain {}
// SAFETY: see above.
unsafe impl Sync for UringDomain {}

impl crate::sealed::Sealed for UringDomain {}

struct SubmitSide {
    submitter: Submitter<'static>,
    sq: SubmissionQueue<'static>,
}

struct CompletionSide {
    cq: CompletionQueue<'static>,
}

/// Makes the next `fail_next` completions report `-errno`, the next
/// `fail_enter` calls to `io_uring_enter` fail with `errno`, and the next
/// `fail_push` SQE pushes find the submission queue full.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct FaultInjection {
    pub(crate) fail_next: AtomicU32,
    pub(crate) fail_enter: AtomicU32,
    pub(crate) fail_push: AtomicU32,
    pub(crate) errno: i32,
}

#[cfg(test)]
impl FaultInjection {
    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }

    fn apply(&self, res: i32) -> i32 {
        if Self::take_one(&self.fail_next) {
            -self.errno
        } else {
            res
        }
    }
}

impl UringDomain {
    pub fn launch(config: DomainConfig) -> Result<UringDomain, LaunchError> {
        Self::launch_with_metrics(config, &GLOBAL_STORAGE)
    }

    pub(crate) fn launch_with_metrics(
        config: DomainConfig,
        metrics: &'static MetricsStorage,
    ) -> Result<UringDomain, LaunchError> {
        Self::launch_inner(
            config,
            metrics,
            #[cfg(test)]
            None,
        )
    }

    #[cfg(test)]
    pub(crate) fn launch_with_testing(
        config: DomainConfig,
        metrics: &'static MetricsStorage,
        testing: FaultInjection,
    ) -> Result<UringDomain, LaunchError> {
        Self::launch_inner(config, metrics, Some(testing))
    }

    fn launch_inner(
        config: DomainConfig,
        metrics: &'static MetricsStorage,
        #[cfg(test)] testing: Option<FaultInjection>,
    ) -> Result<UringDomain, LaunchError> {
        let id = DOMAIN_ID.fetch_add(1, Ordering::Relaxed);
        let span = info_span!("uring_domain", domain_id = id);
        let _entered = span.enter();

        let slots = Slots::new(id, config.queue_depth as usize)?;
        let uring = io_uring::IoUring::new(config.queue_depth).map_err(LaunchError::IoUringBuild)?;
        let uring = Box::into_raw(Box::new(uring));
        // SAFETY: the parts borrow from the leaked IoUring, which lives until `drop`.
        let (submitter, sq, cq) = unsafe { (*uring).split() };

        MetricsStorage::inc(&metrics.domains_created);
        info!(queue_depth = config.queue_depth, retry = %config.retry, "launched");
        Ok(UringDomain {
            id,
            retry: config.retry,
            submit_side: ManuallyDrop::new(Mutex::new(SubmitSide { submitter, sq })),
            completion_side: ManuallyDrop::new(Mutex::new(CompletionSide { cq })),
            slots: Mutex::new(slots),
            stranded: AtomicBool::new(false),
            metrics,
            #[cfg(test)]
            testing,
            split_uring: uring,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Publish `sqe` and enter the kernel.
    ///
    /// Fails only if the SQE could not be published. A failing enter leaves the
    /// SQE in the ring for the next enter, see [`Self::flush_stranded`].
    fn push_and_submit(&self, sqe: &squeue::Entry) -> io::Result<()> {
        let mut side = self.submit_side.lock().unwrap();
        let SubmitSide { submitter, sq } = &mut *side;
        sq.sync();
        #[cfg(test)]
        {
            if let Some(testing) = &self.testing {
                if FaultInjection::take_one(&testing.fail_push) {
                    return Err(io::Error::new(
                        io::ErrorKind::WouldBlock,
                        "io_uring submission queue is full",
                    ));
                }
            }
        }
        // SAFETY: the SQE points at the iovec and buffer of an operation held in
        // `slots`, which stay in place until its completion is reaped.
        if unsafe { sq.push(sqe) }.is_err() {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "io_uring submission queue is full",
            ));
        }
        sq.sync();
        if let Err(e) = self.enter(submitter) {
            warn!(domain_id = self.id, error = %e, "io_uring_enter failed, next poll flushes the submission");
            self.stranded.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn flush_stranded(&self) {
        if !self.stranded.swap(false, Ordering::AcqRel) {
            return;
        }
        let side = self.submit_side.lock().unwrap();
        match self.enter(&side.submitter) {
            Ok(n) => debug!(domain_id = self.id, submitted = n, "flushed stranded submissions"),
            Err(e) => {
                warn!(domain_id = self.id, error = %e, "io_uring_enter still failing");
                self.stranded.store(true, Ordering::Release);
            }
        }
    }

    /// `io_uring_enter` without waiting.
    fn enter(&self, submitter: &Submitter<'static>) -> io::Result<usize> {
        #[cfg(test)]
        {
            if let Some(testing) = &self.testing {
                if FaultInjection::take_one(&testing.fail_enter) {
                    return Err(io::Error::from_raw_os_error(testing.errno));
                }
            }
        }
        submitter.submit()
    }

    fn next_cqe(&self) -> Option<io_uring::cqueue::Entry> {
        let mut side = self.completion_side.lock().unwrap();
        side.cq.sync();
        let cqe = side.cq.next();
        side.cq.sync();
        cqe
    }

    /// Resubmit a failed operation, or deliver its final error.
    /// Returns whether a callback ran.
    fn handle_failure(&self, idx: usize, errno: i32) -> bool {
        let source = io::Error::from_raw_os_error(errno);
        let mut slots = self.slots.lock().unwrap();
        let Some(op) = slots.get_mut(idx) else {
            panic!("implementation error: completion for empty slot {idx}");
        };
        let attempts = op.attempts;
        if !self.retry.allows_another_attempt(attempts) {
            let op = slots.take(idx);
            drop(slots);
            let error = if attempts > 1 {
                Error::RetriesExhausted { attempts, source }
            } else {
                Error::Io(source)
            };
            deliver(self.metrics, op, Err(error));
            return true;
        }

        op.attempts += 1;
        let sqe = prepare_sqe(op, idx);
        drop(slots);
        MetricsStorage::inc(&self.metrics.ops_retried);
        warn!(domain_id = self.id, idx, attempts, error = %source, "operation failed, resubmitting");
        match self.push_and_submit(&sqe) {
            Ok(()) => false,
            Err(e) => {
                let op = self.slots.lock().unwrap().take(idx);
                deliver(self.metrics, op, Err(Error::Io(e)));
                true
            }
        }
    }
}

fn prepare_sqe(op: &Operation, idx: usize) -> squeue::Entry {
    let fd = types::Fd(op.raw_fd());
    let entry = match op.kind {
        OpKind::Read => opcode::Readv::new(fd, &op.iov, 1).offset(op.offset).build(),
        OpKind::Write => opcode::Writev::new(fd, &op.iov, 1).offset(op.offset).build(),
    };
    entry.user_data(idx as u64)
}

impl CompletionDomain for UringDomain {
    fn try_complete(&self) -> bool {
        self.flush_stranded();
        let Some(cqe) = self.next_cqe() else {
            return false;
        };
        let idx = usize::try_from(cqe.user_data()).unwrap_or(usize::MAX);
        let res = cqe.result();
        #[cfg(test)]
        let res = match &self.testing {
            Some(testing) => testing.apply(res),
            None => res,
        };
        trace!(domain_id = self.id, idx, res, "reaped cqe");
        if res < 0 {
            return self.handle_failure(idx, -res);
        }
        let op = self.slots.lock().unwrap().take(idx);
        deliver(self.metrics, op, Ok(res as usize));
        true
    }

    fn pending(&self) -> usize {
        self.slots.lock().unwrap().pending_count()
    }

    fn backend(&self) -> Backend {
        Backend::IoUring
    }

    fn submit(&self, op: Box<Operation>) -> Result<(), Rejected> {
        let (idx, sqe) = {
            let mut slots = self.slots.lock().unwrap();
            let idx = match slots.try_insert(op) {
                Ok(idx) => idx,
                Err(op) => {
                    return Err(Rejected::new(
                        Error::OutOfMemory("all operation slots are in use"),
                        op,
                    ))
                }
            };
            let Some(op) = slots.get_mut(idx) else {
                unreachable!("implementation error: slot {idx} emptied while locked");
            };
            op.attempts += 1;
            (idx, prepare_sqe(op, idx))
        };
        match self.push_and_submit(&sqe) {
            Ok(()) => {
                MetricsStorage::inc(&self.metrics.ops_submitted);
                trace!(domain_id = self.id, idx, "submitted");
                Ok(())
            }
            Err(e) => {
                let op = self.slots.lock().unwrap().take(idx);
                Err(Rejected::new(Error::Io(e), op))
            }
        }
    }
}

impl Drop for UringDomain {
    fn drop(&mut self) {
        let span = info_span!("uring_domain_shutdown", domain_id = self.id);
        let _entered = span.enter();
        info!("shutdown start");
        scopeguard::defer_on_success! {info!("shutdown end")};
        scopeguard::defer_on_unwind! {error!("shutdown panic")};

        loop {
            let pending = self.slots.get_mut().unwrap().pending_count();
            if pending == 0 {
                break;
            }
            if self.try_complete() {
                continue;
            }
            let side = self.submit_side.get_mut().unwrap();
            match side.submitter.submit_and_wait(1) {
                Ok(_) => {}
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => {}
                Err(e) => {
                    // the kernel may still write into the remaining buffers
                    error!(error = %e, pending, "cannot wait for in-flight operations, leaking them and the ring");
                    let leaked = self.slots.get_mut().unwrap().drain_all();
                    leaked.into_iter().for_each(std::mem::forget);
                    MetricsStorage::inc(&self.metrics.domains_destroyed);
                    return;
                }
            }
        }

        {
            let cq = &mut self.completion_side.get_mut().unwrap().cq;
            cq.sync();
            assert_eq!(cq.len(), 0, "cqe: {:?}", cq.next());
        }
        {
            let sq = &mut self.submit_side.get_mut().unwrap().sq;
            sq.sync();
            assert_eq!(sq.len(), 0);
        }
        // SAFETY: neither field is touched again after being taken here.
        let SubmitSide { submitter, sq } =
            unsafe { ManuallyDrop::take(&mut self.submit_side) }.into_inner().unwrap();
        // SAFETY: as above.
        let CompletionSide { cq } =
            unsafe { ManuallyDrop::take(&mut self.completion_side) }.into_inner().unwrap();
        // the queues write their head and tail back into the ring on drop
        #[allow(clippy::drop_non_drop)]
        {
            drop(cq);
            drop(sq);
            drop(submitter);
        }
        // SAFETY: nothing is in flight and no part of the split ring is left.
        let uring: Box<io_uring::IoUring> = unsafe { Box::from_raw(self.split_uring) };
        drop(uring);
        MetricsStorage::inc(&self.metrics.domains_destroyed);
    }
}
