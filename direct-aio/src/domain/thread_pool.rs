//! Portable completion domain: worker threads perform positional reads and writes.

use std::{
    io,
    os::fd::{AsRawFd, OwnedFd},
    sync::{Arc, Mutex},
    thread::JoinHandle,
};

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use tracing::{debug, error, info, info_span, trace, warn};

use crate::{
    domain::{deliver, slots::Slots, Backend, CompletionDomain, DOMAIN_ID},
    metrics::{MetricsStorage, GLOBAL_STORAGE},
    ops::{OpKind, Operation, Rejected},
    DomainConfig, Error, LaunchError,
};

type Completion = (usize, io::Result<usize>);

/// A pool of worker threads standing in for a kernel completion queue.
///
/// Workers share one job channel, run `pread`/`pwrite`, and send the result
/// back on a completion channel that [`CompletionDomain::try_complete`] drains
/// one entry at a time. Callbacks still run on the polling thread, never on a worker.
pub struct ThreadPoolDomain {
    id: usize,
    /// `None` once shutdown has started.
    jobs_tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    completions_rx: Receiver<Completion>,
    slots: Mutex<Slots>,
    metrics: &'static MetricsStorage,
}

impl crate::sealed::Sealed for ThreadPoolDomain {}

struct Job {
    idx: usize,
    kind: OpKind,
    fd: Arc<OwnedFd>,
    offset: u64,
    buf: *mut u8,
    len: usize,
}

// SAFETY: `buf` points into a buffer owned by the operation in slot `idx`,
// which is not touched by anyone else until the job's result is reaped.
unsafe impl Send for Job {}

impl Job {
    fn run(&self) -> io::Result<usize> {
        let fd = self.fd.as_raw_fd();
        let offset = libc::off_t::try_from(self.offset)
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let res = match self.kind {
            OpKind::Read => {
                // SAFETY: see `unsafe impl Send for Job`.
                let buf = unsafe { std::slice::from_raw_parts_mut(self.buf, self.len) };
                nix::sys::uio::pread(fd, buf, offset)
            }
            OpKind::Write => {
                // SAFETY: see `unsafe impl Send for Job`.
                let buf = unsafe { std::slice::from_raw_parts(self.buf.cast_const(), self.len) };
                nix::sys::uio::pwrite(fd, buf, offset)
            }
        };
        res.map_err(io::Error::from)
    }
}

impl ThreadPoolDomain {
    pub fn launch(config: DomainConfig) -> Result<ThreadPoolDomain, LaunchError> {
        Self::launch_with_metrics(config, &GLOBAL_STORAGE)
    }

    pub(crate) fn launch_with_metrics(
        config: DomainConfig,
        metrics: &'static MetricsStorage,
    ) -> Result<ThreadPoolDomain, LaunchError> {
        let id = DOMAIN_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let span = info_span!("thread_pool_domain", domain_id = id);
        let _entered = span.enter();

        let slots = Slots::new(id, config.queue_depth as usize)?;
        let (jobs_tx, jobs_rx) = unbounded::<Job>();
        let (completions_tx, completions_rx) = unbounded::<Completion>();
        MetricsStorage::inc(&metrics.domains_created);
        let mut domain = ThreadPoolDomain {
            id,
            jobs_tx: Some(jobs_tx),
            workers: Vec::new(),
            completions_rx,
            slots: Mutex::new(slots),
            metrics,
        };
        let worker_threads = config.worker_threads.max(1);
        for worker in 0..worker_threads {
            let jobs_rx = jobs_rx.clone();
            let completions = completions_tx.clone();
            // on error, dropping `domain` stops the workers spawned so far
            let handle = std::thread::Builder::new()
                .name(format!("direct-aio-{id}-worker-{worker}"))
                .spawn(move || worker_loop(id, worker, jobs_rx, completions))
                .map_err(LaunchError::SpawnWorker)?;
            domain.workers.push(handle);
        }
        info!(queue_depth = config.queue_depth, worker_threads, "launched");
        Ok(domain)
    }
}

fn worker_loop(
    domain_id: usize,
    worker: usize,
    jobs_rx: Receiver<Job>,
    completions: Sender<Completion>,
) {
    let span = info_span!("worker", domain_id, worker);
    let _entered = span.enter();
    debug!("started");
    for job in jobs_rx.iter() {
        let res = job.run();
        trace!(idx = job.idx, ?res, "job done");
        // the domain holds the receiver until every worker has been joined
        if completions.send((job.idx, res)).is_err() {
            error!(idx = job.idx, "completion channel closed");
            return;
        }
    }
    debug!("submission channel closed, exiting");
}

impl CompletionDomain for ThreadPoolDomain {
    fn try_complete(&self) -> bool {
        let (idx, res) = match self.completions_rx.try_recv() {
            Ok(completion) => completion,
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => return false,
        };
        let op = self.slots.lock().unwrap().take(idx);
        deliver(self.metrics, op, res.map_err(Error::Io));
        true
    }

    fn pending(&self) -> usize {
        self.slots.lock().unwrap().pending_count()
    }

    fn backend(&self) -> Backend {
        Backend::ThreadPool
    }

    fn submit(&self, op: Box<Operation>) -> Result<(), Rejected> {
        let job = {
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
            Job {
                idx,
                kind: op.kind,
                fd: Arc::clone(op.fd()),
                offset: op.offset,
                buf: op.buf_ptr(),
                len: op.len(),
            }
        };
        let idx = job.idx;
        let sent = match &self.jobs_tx {
            Some(tx) => tx.send(job).is_ok(),
            None => false,
        };
        if !sent {
            let op = self.slots.lock().unwrap().take(idx);
            return Err(Rejected::new(
                Error::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "worker pool is shut down",
                )),
                op,
            ));
        }
        MetricsStorage::inc(&self.metrics.ops_submitted);
        trace!(domain_id = self.id, idx, "submitted");
        Ok(())
    }
}

impl Drop for ThreadPoolDomain {
    fn drop(&mut self) {
        let span = info_span!("thread_pool_domain_shutdown", domain_id = self.id);
        let _entered = span.enter();
        info!("shutdown start");
        scopeguard::defer_on_success! {info!("shutdown end")};
        scopeguard::defer_on_unwind! {error!("shutdown panic")};

        // workers finish the queued jobs, then see the closed channel
        drop(self.jobs_tx.take());
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
        while self.try_complete() {}

        let lost = self.slots.get_mut().unwrap().drain_all();
        if !lost.is_empty() {
            warn!(count = lost.len(), "operations lost to a panicked worker");
        }
        for op in lost {
            let err = io::Error::new(io::ErrorKind::Other, "worker thread panicked");
            deliver(self.metrics, op, Err(Error::Io(err)));
        }
        MetricsStorage::inc(&self.metrics.domains_destroyed);
    }
}
