use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex,
};

use super::{FaultInjection, UringDomain};
use crate::{
    domain::{
        tests::{leaked_metrics, open_scratch, poll_until, test_config},
        CompletionDomain,
    },
    metrics::MetricsStorage,
    AlignedBuf, AsyncFile, DomainConfig, Error, LaunchError, RetryPolicy, DEVICE_ALIGNMENT,
};

fn launch_failing(
    retry: RetryPolicy,
    fail_next: u32,
    metrics: &'static MetricsStorage,
) -> Option<Arc<UringDomain>> {
    let config = DomainConfig {
        retry,
        ..test_config()
    };
    let testing = FaultInjection {
        fail_next: AtomicU32::new(fail_next),
        errno: libc::EIO,
        ..Default::default()
    };
    match UringDomain::launch_with_testing(config, metrics, testing) {
        Ok(domain) => Some(Arc::new(domain)),
        Err(LaunchError::IoUringBuild(e)) => {
            eprintln!("skipping io_uring test: {e}");
            None
        }
        Err(e) => panic!("cannot launch io_uring domain: {e}"),
    }
}

type Outcome = Arc<Mutex<Vec<Result<usize, Error>>>>;

fn submit_write(file: &AsyncFile<UringDomain>, outcome: &Outcome) {
    file.write(
        0,
        AlignedBuf::zeroed(512, DEVICE_ALIGNMENT),
        Arc::clone(outcome),
        |(outcome, _), res| outcome.lock().unwrap().push(res),
    )
    .unwrap();
}

fn write_once(domain: &Arc<UringDomain>) -> Result<usize, Error> {
    let dir = tempfile::tempdir().unwrap();
    let file = open_scratch(dir.path(), "retry", domain);
    let outcome: Outcome = Arc::new(Mutex::new(Vec::new()));
    submit_write(&file, &outcome);
    poll_until(&**domain, || !outcome.lock().unwrap().is_empty());
    let mut results = std::mem::take(&mut *outcome.lock().unwrap());
    assert_eq!(results.len(), 1);
    results.pop().unwrap()
}

#[test]
fn transient_failures_are_retried() {
    let metrics = leaked_metrics();
    let Some(domain) = launch_failing(RetryPolicy::Bounded { max_retries: 3 }, 2, metrics) else {
        return;
    };
    assert_eq!(write_once(&domain).unwrap(), 512);
    let snapshot = metrics.make_pub();
    assert_eq!(snapshot.ops_retried, 2);
    assert_eq!(snapshot.ops_submitted, 1);
    assert_eq!(snapshot.ops_completed, 1);
    assert_eq!(snapshot.ops_failed, 0);
}

#[test]
fn retry_budget_is_enforced() {
    let metrics = leaked_metrics();
    let Some(domain) = launch_failing(RetryPolicy::Bounded { max_retries: 2 }, 5, metrics) else {
        return;
    };
    match write_once(&domain) {
        Err(Error::RetriesExhausted { attempts, source }) => {
            assert_eq!(attempts, 3);
            assert_eq!(source.raw_os_error(), Some(libc::EIO));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    let snapshot = metrics.make_pub();
    assert_eq!(snapshot.ops_retried, 2);
    assert_eq!(snapshot.ops_failed, 1);
    assert_eq!(domain.testing.as_ref().unwrap().fail_next.load(Ordering::Relaxed), 2);
}

#[test]
fn never_policy_reports_the_first_failure() {
    let metrics = leaked_metrics();
    let Some(domain) = launch_failing(RetryPolicy::Never, 1, metrics) else {
        return;
    };
    let err = write_once(&domain).unwrap_err();
    assert!(matches!(err, Error::Io(_)), "{err:?}");
    assert_eq!(err.raw_os_error(), Some(libc::EIO));
    assert_eq!(metrics.make_pub().ops_retried, 0);
}

#[test]
fn unbounded_policy_retries_until_success() {
    let metrics = leaked_metrics();
    let Some(domain) = launch_failing(RetryPolicy::Unbounded, 10, metrics) else {
        return;
    };
    assert_eq!(write_once(&domain).unwrap(), 512);
    assert_eq!(metrics.make_pub().ops_retried, 10);
}

#[test]
fn launch_use_and_drop_releases_the_ring() {
    let metrics = leaked_metrics();
    for _ in 0..3 {
        let Some(domain) = launch_failing(RetryPolicy::default(), 0, metrics) else {
            return;
        };
        assert_eq!(write_once(&domain).unwrap(), 512);
        let domain = Arc::try_unwrap(domain).ok().unwrap();
        drop(domain);
    }
    let snapshot = metrics.make_pub();
    assert_eq!(snapshot.domains_created, 3);
    assert_eq!(snapshot.domains_destroyed, 3);
    assert_eq!(snapshot.ops_completed, 3);
}

#[test]
fn failed_enter_is_flushed_by_the_next_poll() {
    let metrics = leaked_metrics();
    let Some(domain) = launch_failing(RetryPolicy::Never, 0, metrics) else {
        return;
    };
    // the first flush fails as well, the second one gets through
    let testing = domain.testing.as_ref().unwrap();
    testing.fail_enter.store(2, Ordering::Relaxed);

    let dir = tempfile::tempdir().unwrap();
    let file = open_scratch(dir.path(), "stranded", &domain);
    let outcome: Outcome = Arc::new(Mutex::new(Vec::new()));
    submit_write(&file, &outcome);
    assert!(domain.stranded.load(Ordering::Acquire));
    assert_eq!(domain.pending(), 1);

    poll_until(&*domain, || !outcome.lock().unwrap().is_empty());
    assert_eq!(testing.fail_enter.load(Ordering::Relaxed), 0);
    assert!(!domain.stranded.load(Ordering::Acquire));
    assert!(!domain.try_complete());
    let outcome = outcome.lock().unwrap();
    assert_eq!(outcome.len(), 1);
    assert_eq!(*outcome[0].as_ref().unwrap(), 512);
    assert_eq!(domain.pending(), 0);
    assert_eq!(metrics.make_pub().ops_submitted, 1);
}

#[test]
fn failed_resubmission_is_delivered_as_io_error() {
    let metrics = leaked_metrics();
    let Some(domain) = launch_failing(RetryPolicy::Bounded { max_retries: 3 }, 1, metrics) else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let file = open_scratch(dir.path(), "resubmit", &domain);
    let outcome: Outcome = Arc::new(Mutex::new(Vec::new()));
    submit_write(&file, &outcome);
    // the initial push already happened, so this hits the retry
    domain.testing.as_ref().unwrap().fail_push.store(1, Ordering::Relaxed);

    poll_until(&*domain, || !outcome.lock().unwrap().is_empty());
    let mut outcome = outcome.lock().unwrap();
    assert_eq!(outcome.len(), 1);
    match outcome.pop().unwrap() {
        Err(Error::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::WouldBlock),
        other => panic!("unexpected result: {other:?}"),
    }
    let snapshot = metrics.make_pub();
    assert_eq!(snapshot.ops_retried, 1);
    assert_eq!(snapshot.ops_failed, 1);
    assert_eq!(domain.pending(), 0);
}
