//! Completion domain backed by Linux native AIO.

mod sys;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    time::Duration,
};

use tracing::{debug, error, info, info_span, trace, warn};

use crate::{
    domain::{deliver, slots::Slots, Backend, CompletionDomain, DOMAIN_ID},
    metrics::{MetricsStorage, GLOBAL_STORAGE},
    ops::{Operation, Rejected},
    DomainConfig, Error, LaunchError,
};

/// One kernel AIO context (`io_setup`) and the operations submitted to it.
///
/// Submissions go to the kernel one `iocb` at a time; `aio_data` carries the
/// operation's slot index. Failed operations are reported as is, without retries.
pub struct AioDomain {
    id: usize,
    ctx: sys::AioContext,
    slots: Mutex<Slots>,
    /// Set once `io_getevents` failed; later failures are only counted.
    poll_failed: AtomicBool,
    metrics: &'static MetricsStorage,
}

impl crate::sealed::Sealed for AioDomain {}

impl AioDomain {
    pub fn launch(config: DomainConfig) -> Result<AioDomain, LaunchError> {
        Self::launch_with_metrics(config, &GLOBAL_STORAGE)
    }

    pub(crate) fn launch_with_metrics(
        config: DomainConfig,
        metrics: &'static MetricsStorage,
    ) -> Result<AioDomain, LaunchError> {
        let id = DOMAIN_ID.fetch_add(1, Ordering::Relaxed);
        let span = info_span!("aio_domain", domain_id = id);
        let _entered = span.enter();

        let slots = Slots::new(id, config.queue_depth as usize)?;
        let ctx = sys::io_setup(config.queue_depth).map_err(LaunchError::AioSetup)?;
        MetricsStorage::inc(&metrics.domains_created);
        info!(queue_depth = config.queue_depth, "launched");
        Ok(AioDomain {
            id,
            ctx,
            slots: Mutex::new(slots),
            poll_failed: AtomicBool::new(false),
            metrics,
        })
    }
}

impl CompletionDomain for AioDomain {
    fn try_complete(&self) -> bool {
        let event = match sys::io_getevent(self.ctx, Duration::ZERO) {
            Ok(Some(event)) => event,
            Ok(None) => return false,
            Err(e) => {
                MetricsStorage::inc(&self.metrics.poll_errors);
                if !self.poll_failed.swap(true, Ordering::Relaxed) {
                    error!(domain_id = self.id, error = %e, pending = self.pending(), "io_getevents failed, completions cannot be reaped");
                } else {
                    trace!(domain_id = self.id, error = %e, "io_getevents failed again");
                }
                return false;
            }
        };
        let idx = usize::try_from(event.data).unwrap_or(usize::MAX);
        let op = self.slots.lock().unwrap().take(idx);
        trace!(domain_id = self.id, idx, res = event.res, "reaped event");
        let res = if event.res < 0 {
            Err(Error::from_negative_result(event.res))
        } else {
            Ok(event.res as usize)
        };
        deliver(self.metrics, op, res);
        true
    }

    fn pending(&self) -> usize {
        self.slots.lock().unwrap().pending_count()
    }

    fn backend(&self) -> Backend {
        Backend::LinuxAio
    }

    fn submit(&self, op: Box<Operation>) -> Result<(), Rejected> {
        let (idx, mut iocb) = {
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
            let iocb = sys::Iocb::new(
                op.kind,
                op.raw_fd(),
                op.buf_ptr(),
                op.len(),
                op.offset,
                idx as u64,
            );
            (idx, iocb)
        };
        match sys::io_submit_one(self.ctx, &mut iocb) {
            Ok(()) => {
                MetricsStorage::inc(&self.metrics.ops_submitted);
                trace!(domain_id = self.id, idx, "submitted");
                Ok(())
            }
            Err(e) => {
                debug!(domain_id = self.id, idx, error = %e, "io_submit rejected operation");
                let op = self.slots.lock().unwrap().take(idx);
                Err(Rejected::new(Error::Io(e), op))
            }
        }
    }
}

impl Drop for AioDomain {
    fn drop(&mut self) {
        let span = info_span!("aio_domain_shutdown", domain_id = self.id);
        let _entered = span.enter();
        info!("shutdown start");
        scopeguard::defer_on_success! {info!("shutdown end")};
        scopeguard::defer_on_unwind! {error!("shutdown panic")};

        let metrics = self.metrics;
        let slots = self.slots.get_mut().unwrap();
        let mut reap_error = None;
        while slots.pending_count() > 0 {
            match sys::io_getevent(self.ctx, Duration::from_millis(100)) {
                Ok(Some(event)) => {
                    let op = slots.take(usize::try_from(event.data).unwrap_or(usize::MAX));
                    let res = if event.res < 0 {
                        Err(Error::from_negative_result(event.res))
                    } else {
                        Ok(event.res as usize)
                    };
                    deliver(metrics, op, res);
                }
                Ok(None) => debug!(pending = slots.pending_count(), "waiting for in-flight operations"),
                Err(e) => {
                    error!(error = %e, pending = slots.pending_count(), "io_getevents failed during shutdown");
                    reap_error = Some(e);
                    break;
                }
            }
        }

        // io_destroy waits for the remaining in-flight operations
        let destroyed = match sys::io_destroy(self.ctx) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "io_destroy failed");
                false
            }
        };
        if let Some(reap_error) = reap_error {
            let ops = slots.drain_all();
            if destroyed {
                for op in ops {
                    let err = std::io::Error::new(reap_error.kind(), reap_error.to_string());
                    deliver(metrics, op, Err(Error::Io(err)));
                }
            } else {
                error!(count = ops.len(), "leaking operations the kernel may still access");
                ops.into_iter().for_each(std::mem::forget);
            }
        }
        MetricsStorage::inc(&metrics.domains_destroyed);
    }
}
