//! Behaviour shared by every backend.
//!
//! Backends the kernel refuses to create (e.g. io_uring or AIO in a sandbox)
//! are skipped with a note on stderr.

use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use crate::{
    domain::{Backend, CompletionDomain, ThreadPoolDomain},
    file::{CreateDisposition, FileOptions, Handle, OpenOutcome},
    metrics::MetricsStorage,
    AlignedBuf, AsyncFile, DomainConfig, Error, LaunchError, RetryPolicy, DEVICE_ALIGNMENT,
};

pub(super) fn test_config() -> DomainConfig {
    DomainConfig {
        queue_depth: 32,
        retry: RetryPolicy::default(),
        worker_threads: 2,
    }
}

pub(super) fn all_backends() -> Vec<Backend> {
    if cfg!(target_os = "linux") {
        vec![Backend::LinuxAio, Backend::IoUring, Backend::ThreadPool]
    } else {
        vec![Backend::ThreadPool]
    }
}

pub(super) fn launch_or_skip(
    backend: Backend,
    config: DomainConfig,
    metrics: &'static MetricsStorage,
) -> Option<Arc<dyn CompletionDomain>> {
    let res: Result<Arc<dyn CompletionDomain>, LaunchError> = match backend {
        #[cfg(target_os = "linux")]
        Backend::LinuxAio => {
            crate::domain::AioDomain::launch_with_metrics(config, metrics).map(|d| Arc::new(d) as _)
        }
        #[cfg(target_os = "linux")]
        Backend::IoUring => crate::domain::UringDomain::launch_with_metrics(config, metrics)
            .map(|d| Arc::new(d) as _),
        #[cfg(not(target_os = "linux"))]
        Backend::LinuxAio | Backend::IoUring => return None,
        Backend::ThreadPool => {
            ThreadPoolDomain::launch_with_metrics(config, metrics).map(|d| Arc::new(d) as _)
        }
    };
    match res {
        Ok(domain) => Some(domain),
        Err(e @ (LaunchError::IoUringBuild(_) | LaunchError::AioSetup(_))) => {
            eprintln!("skipping {backend:?}: {e}");
            None
        }
        Err(e) => panic!("cannot launch {backend:?}: {e}"),
    }
}

pub(super) fn leaked_metrics() -> &'static MetricsStorage {
    Box::leak(Box::new(MetricsStorage::new_const()))
}

/// Open `name` in `dir` unbuffered, or buffered if the filesystem rejects `O_DIRECT` (e.g. tmpfs).
pub(super) fn open_scratch<D: CompletionDomain + ?Sized>(
    dir: &Path,
    name: &str,
    domain: &Arc<D>,
) -> AsyncFile<D> {
    let path = dir.join(name);
    let open = |unbuffered| {
        AsyncFile::open(
            &path,
            CreateDisposition::CreateOrTruncate,
            FileOptions { unbuffered },
            Arc::clone(domain),
        )
    };
    let outcome = match open(true) {
        Ok(outcome) => outcome,
        Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
            eprintln!("O_DIRECT not supported in {dir:?}, using buffered I/O");
            open(false).unwrap()
        }
        Err(e) => panic!("cannot open {path:?}: {e}"),
    };
    outcome.into_file().unwrap()
}

/// Call `try_complete` until `done` holds. Panics after 10 seconds.
pub(super) fn poll_until<D: CompletionDomain + ?Sized>(domain: &D, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        if !domain.try_complete() {
            assert!(Instant::now() < deadline, "timed out waiting for completions");
            std::thread::yield_now();
        }
    }
}

type Outcomes<B> = Arc<Mutex<Vec<(B, Result<usize, Error>)>>>;

fn record<B: Send + 'static>(
) -> impl FnOnce((Outcomes<B>, B), Result<usize, Error>) + Send + 'static {
    |(outcomes, buf), res| outcomes.lock().unwrap().push((buf, res))
}

fn pipe_reader() -> std::os::fd::OwnedFd {
    use std::os::fd::{FromRawFd, IntoRawFd};
    let (reader, _writer) = os_pipe::pipe().unwrap();
    // SAFETY: `into_raw_fd` hands over ownership.
    unsafe { std::os::fd::OwnedFd::from_raw_fd(reader.into_raw_fd()) }
}

#[test]
fn nothing_outstanding_completes_nothing() {
    for backend in all_backends() {
        let Some(domain) = launch_or_skip(backend, test_config(), leaked_metrics()) else {
            continue;
        };
        assert!(!domain.try_complete(), "{backend:?}");
        assert_eq!(domain.pending(), 0);
        assert_eq!(domain.backend(), backend);
    }
}

#[test]
fn write_zeros_read_back_close_delete() {
    for backend in all_backends() {
        let Some(domain) = launch_or_skip(backend, test_config(), leaked_metrics()) else {
            continue;
        };
        let dir = tempfile::tempdir().unwrap();
        let mut file = open_scratch(dir.path(), "scenario", &domain);
        assert_eq!(file.device_alignment(), 512);

        let outcomes: Outcomes<AlignedBuf> = Arc::new(Mutex::new(Vec::new()));
        let buf = AlignedBuf::zeroed(4096, DEVICE_ALIGNMENT);
        file.write(0, buf, Arc::clone(&outcomes), record())
            .unwrap();
        poll_until(&*domain, || outcomes.lock().unwrap().len() == 1);
        let (_, res) = outcomes.lock().unwrap().pop().unwrap();
        assert_eq!(res.unwrap(), 4096, "{backend:?}");
        assert_eq!(file.size(), 4096);

        let buf = AlignedBuf::with_capacity(4096, DEVICE_ALIGNMENT);
        file.read(0, buf, Arc::clone(&outcomes), record())
            .unwrap();
        poll_until(&*domain, || outcomes.lock().unwrap().len() == 1);
        let (buf, res) = outcomes.lock().unwrap().pop().unwrap();
        assert_eq!(res.unwrap(), 4096, "{backend:?}");
        assert_eq!(buf.len(), 4096);
        assert!(buf.iter().all(|b| *b == 0));

        let stats = file.stats();
        assert_eq!(stats.bytes_written, 4096);
        assert_eq!(stats.read_count, 1);
        assert_eq!(stats.bytes_read, 4096);

        file.close().unwrap();
        file.delete().unwrap();
        assert!(!dir.path().join("scenario").exists());
        assert!(!domain.try_complete());
    }
}

#[test]
fn every_submission_completes_exactly_once() {
    const OPS: usize = 16;
    for backend in all_backends() {
        let Some(domain) = launch_or_skip(backend, test_config(), leaked_metrics()) else {
            continue;
        };
        let dir = tempfile::tempdir().unwrap();
        let file = open_scratch(dir.path(), "many", &domain);

        let calls: Arc<Vec<AtomicUsize>> = Arc::new((0..OPS).map(|_| AtomicUsize::new(0)).collect());
        for i in 0..OPS {
            let buf = AlignedBuf::from_slice(&[i as u8; 512], DEVICE_ALIGNMENT);
            file.write(
                (i * 512) as u64,
                buf,
                (i, Arc::clone(&calls)),
                |((i, calls), _buf), res| {
                    assert_eq!(res.unwrap(), 512);
                    calls[i].fetch_add(1, Ordering::Relaxed);
                },
            )
            .unwrap();
        }
        poll_until(&*domain, || domain.pending() == 0);
        assert!(!domain.try_complete());
        for (i, count) in calls.iter().enumerate() {
            assert_eq!(count.load(Ordering::Relaxed), 1, "{backend:?} op {i}");
        }
        assert_eq!(file.size(), (OPS * 512) as u64);
    }
}

#[test]
fn misaligned_submissions_are_rejected_with_resources() {
    for backend in all_backends() {
        let Some(domain) = launch_or_skip(backend, test_config(), leaked_metrics()) else {
            continue;
        };
        let scratch = tempfile::tempfile().unwrap();
        let file = AsyncFile::from_handle(
            Handle::from_owned_fd(scratch.into(), "scratch", true),
            Arc::clone(&domain),
        );

        let buf = AlignedBuf::zeroed(512, DEVICE_ALIGNMENT);
        let err = file
            .write(100, buf, "context", |_, _| panic!("must not run"))
            .unwrap_err();
        assert!(matches!(err.error, Error::Misaligned { offset: 100, .. }));
        let ((context, buf), _) = err.into_parts();
        assert_eq!(context, "context");
        assert_eq!(buf.len(), 512);

        let err = file
            .read(0, AlignedBuf::with_capacity(100, DEVICE_ALIGNMENT), (), |_, _| {
                panic!("must not run")
            })
            .unwrap_err();
        assert!(matches!(err.error, Error::Misaligned { len: 100, .. }));

        assert_eq!(domain.pending(), 0);
        assert!(!domain.try_complete());
        assert_eq!(file.stats().bytes_written, 0);
    }
}

#[test]
fn submissions_on_a_closed_file_fail() {
    let domain = launch_or_skip(Backend::ThreadPool, test_config(), leaked_metrics()).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let mut file = open_scratch(dir.path(), "closed", &domain);
    file.close().unwrap();
    let err = file
        .write(0, AlignedBuf::zeroed(512, DEVICE_ALIGNMENT), (), |_, _| {
            panic!("must not run")
        })
        .unwrap_err();
    assert_eq!(err.error.raw_os_error(), Some(libc::EBADF));
}

#[test]
fn queue_depth_exhaustion_is_out_of_memory() {
    let config = DomainConfig {
        queue_depth: 1,
        worker_threads: 1,
        ..test_config()
    };
    let domain = launch_or_skip(Backend::ThreadPool, config, leaked_metrics()).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let file = open_scratch(dir.path(), "full", &domain);

    let done = Arc::new(AtomicUsize::new(0));
    let on_done = |(done, _): (Arc<AtomicUsize>, AlignedBuf), res: Result<usize, Error>| {
        res.unwrap();
        done.fetch_add(1, Ordering::Relaxed);
    };
    file.write(0, AlignedBuf::zeroed(512, DEVICE_ALIGNMENT), Arc::clone(&done), on_done)
        .unwrap();
    // the slot is only freed by try_complete, so the second one cannot fit
    let err = file
        .write(512, AlignedBuf::zeroed(512, DEVICE_ALIGNMENT), Arc::clone(&done), on_done)
        .unwrap_err();
    assert_eq!(err.status(), crate::Status::OutOfMemory);
    poll_until(&*domain, || done.load(Ordering::Relaxed) == 1);
}

#[test]
fn completion_errors_reach_the_callback() {
    // pread on a pipe fails with ESPIPE in the worker
    let domain = launch_or_skip(Backend::ThreadPool, test_config(), leaked_metrics()).unwrap();
    let file = AsyncFile::from_handle(
        Handle::from_owned_fd(pipe_reader(), "pipe", false),
        Arc::clone(&domain),
    );
    let outcomes: Outcomes<Vec<u8>> = Arc::new(Mutex::new(Vec::new()));
    file.read(0, vec![0u8; 64], Arc::clone(&outcomes), record())
        .unwrap();
    poll_until(&*domain, || outcomes.lock().unwrap().len() == 1);
    let (buf, res) = outcomes.lock().unwrap().pop().unwrap();
    let err = res.unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ESPIPE));
    assert_eq!(err.status(), crate::Status::IoError);
    assert_eq!(buf.capacity(), 64);
}

#[test]
fn callbacks_can_submit_more_operations() {
    for backend in all_backends() {
        let Some(domain) = launch_or_skip(backend, test_config(), leaked_metrics()) else {
            continue;
        };
        let dir = tempfile::tempdir().unwrap();
        let file = Arc::new(open_scratch(dir.path(), "chain", &domain));
        let done = Arc::new(AtomicUsize::new(0));

        let first = AlignedBuf::from_slice(&[1; 512], DEVICE_ALIGNMENT);
        file.write(
            0,
            first,
            (Arc::clone(&file), Arc::clone(&done)),
            |((file, done), _), res| {
                res.unwrap();
                let second = AlignedBuf::from_slice(&[2; 512], DEVICE_ALIGNMENT);
                file.write(512, second, done, |(done, _), res| {
                    res.unwrap();
                    done.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap();
            },
        )
        .unwrap();
        poll_until(&*domain, || done.load(Ordering::Relaxed) == 1);
        assert_eq!(file.size(), 1024, "{backend:?}");
    }
}

#[test]
fn open_existing_missing_through_async_file() {
    let domain = launch_or_skip(Backend::ThreadPool, test_config(), leaked_metrics()).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let outcome = AsyncFile::open(
        dir.path().join("missing"),
        CreateDisposition::OpenExisting,
        FileOptions::default(),
        domain,
    )
    .unwrap();
    assert!(matches!(outcome, OpenOutcome::Missing));
}

#[test]
fn dropping_the_domain_delivers_pending_callbacks() {
    for backend in all_backends() {
        let Some(domain) = launch_or_skip(backend, test_config(), leaked_metrics()) else {
            continue;
        };
        let dir = tempfile::tempdir().unwrap();
        let mut file = open_scratch(dir.path(), "drop", &domain);
        let done = Arc::new(AtomicUsize::new(0));
        for i in 0..8u64 {
            file.write(
                i * 512,
                AlignedBuf::zeroed(512, DEVICE_ALIGNMENT),
                Arc::clone(&done),
                |(done, _), res| {
                    res.unwrap();
                    done.fetch_add(1, Ordering::Relaxed);
                },
            )
            .unwrap();
        }
        // close is deferred while the writes hold the descriptor
        file.close().unwrap();
        drop(file);
        drop(domain);
        assert_eq!(done.load(Ordering::Relaxed), 8, "{backend:?}");
    }
}

#[test]
fn metrics_follow_the_domain() {
    for backend in all_backends() {
        let metrics = leaked_metrics();
        let Some(domain) = launch_or_skip(backend, test_config(), metrics) else {
            continue;
        };
        let dir = tempfile::tempdir().unwrap();
        let file = open_scratch(dir.path(), "metrics", &domain);
        let outcomes: Outcomes<AlignedBuf> = Arc::new(Mutex::new(Vec::new()));
        file.write(
            0,
            AlignedBuf::zeroed(1024, DEVICE_ALIGNMENT),
            Arc::clone(&outcomes),
            record(),
        )
        .unwrap();
        poll_until(&*domain, || outcomes.lock().unwrap().len() == 1);
        file.read(
            0,
            AlignedBuf::with_capacity(1024, DEVICE_ALIGNMENT),
            Arc::clone(&outcomes),
            record(),
        )
        .unwrap();
        poll_until(&*domain, || outcomes.lock().unwrap().len() == 2);

        let snapshot = metrics.make_pub();
        assert_eq!(snapshot.domains_created, 1, "{backend:?}");
        assert_eq!(snapshot.ops_submitted, 2);
        assert_eq!(snapshot.ops_completed, 2);
        assert_eq!(snapshot.ops_failed, 0);
        assert_eq!(snapshot.domains_destroyed, 0);
        drop(file);
        drop(domain);
        assert_eq!(metrics.make_pub().domains_destroyed, 1);
    }
}

fn block_pattern(block: usize) -> Vec<u8> {
    (0..512).map(|i| (block * 31 + i % 251 + 1) as u8).collect()
}

#[test]
fn patterned_data_survives_a_round_trip() {
    for backend in all_backends() {
        let Some(domain) = launch_or_skip(backend, test_config(), leaked_metrics()) else {
            continue;
        };
        let dir = tempfile::tempdir().unwrap();
        let file = open_scratch(dir.path(), "pattern", &domain);
        let data: Vec<u8> = (0..8).flat_map(block_pattern).collect();

        let outcomes: Outcomes<AlignedBuf> = Arc::new(Mutex::new(Vec::new()));
        file.write(
            0,
            AlignedBuf::from_slice(&data, DEVICE_ALIGNMENT),
            Arc::clone(&outcomes),
            record(),
        )
        .unwrap();
        poll_until(&*domain, || outcomes.lock().unwrap().len() == 1);
        assert_eq!(outcomes.lock().unwrap().pop().unwrap().1.unwrap(), 4096);

        // read the second half only, at a non-zero offset
        file.read(
            2048,
            AlignedBuf::with_capacity(2048, DEVICE_ALIGNMENT),
            Arc::clone(&outcomes),
            record(),
        )
        .unwrap();
        poll_until(&*domain, || outcomes.lock().unwrap().len() == 1);
        let (buf, res) = outcomes.lock().unwrap().pop().unwrap();
        assert_eq!(res.unwrap(), 2048, "{backend:?}");
        assert_eq!(&buf[..], &data[2048..], "{backend:?}");
    }
}

#[test]
fn concurrent_submitters_with_a_concurrent_poller() {
    const THREADS: usize = 4;
    const BLOCKS_PER_THREAD: usize = 4;
    const BLOCKS: usize = THREADS * BLOCKS_PER_THREAD;
    for backend in all_backends() {
        let Some(domain) = launch_or_skip(backend, test_config(), leaked_metrics()) else {
            continue;
        };
        let dir = tempfile::tempdir().unwrap();
        let file = open_scratch(dir.path(), "concurrent", &domain);
        let done = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|scope| {
            scope.spawn(|| poll_until(&*domain, || done.load(Ordering::Relaxed) == BLOCKS));
            for thread in 0..THREADS {
                let (file, done) = (&file, &done);
                scope.spawn(move || {
                    for i in 0..BLOCKS_PER_THREAD {
                        let block = thread * BLOCKS_PER_THREAD + i;
                        let buf = AlignedBuf::from_slice(&block_pattern(block), DEVICE_ALIGNMENT);
                        file.write((block * 512) as u64, buf, Arc::clone(done), |(done, _), res| {
                            assert_eq!(res.unwrap(), 512);
                            done.fetch_add(1, Ordering::Relaxed);
                        })
                        .unwrap();
                    }
                });
            }
        });
        assert_eq!(done.load(Ordering::Relaxed), BLOCKS, "{backend:?}");
        assert_eq!(domain.pending(), 0);

        let outcomes: Outcomes<AlignedBuf> = Arc::new(Mutex::new(Vec::new()));
        file.read(
            0,
            AlignedBuf::with_capacity(BLOCKS * 512, DEVICE_ALIGNMENT),
            Arc::clone(&outcomes),
            record(),
        )
        .unwrap();
        poll_until(&*domain, || outcomes.lock().unwrap().len() == 1);
        let (buf, res) = outcomes.lock().unwrap().pop().unwrap();
        assert_eq!(res.unwrap(), BLOCKS * 512, "{backend:?}");
        for (block, chunk) in buf.chunks(512).enumerate() {
            assert_eq!(chunk, &block_pattern(block)[..], "{backend:?} block {block}");
        }
        assert_eq!(file.stats().bytes_written, (BLOCKS * 512) as u64);
    }
}
