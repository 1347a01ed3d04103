use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Barrier, Mutex,
    },
    time::{Duration, Instant},
};

use direct_aio::{
    AlignedBuf, AsyncFile, CompletionDomain, CreateDisposition, DomainConfig, FileOptions,
    DEVICE_ALIGNMENT,
};
use rand::Rng;
use tracing::{info, info_span};

use crate::{setup, stats::StatsState, Args, RunDuration};

/// Travels with every read and comes back in its callback.
struct ReadContext {
    client: usize,
    offset: u64,
    start: Instant,
    validate: bool,
    stats: Arc<StatsState>,
    free_bufs: Arc<Mutex<Vec<AlignedBuf>>>,
}

fn on_read_done((ctx, buf): (ReadContext, AlignedBuf), res: Result<usize, direct_aio::Error>) {
    let n = res.unwrap_or_else(|e| panic!("read at offset {} failed: {e}", ctx.offset));
    assert_eq!(n, buf.capacity(), "short read at offset {}", ctx.offset);
    if ctx.validate {
        assert_eq!(setup::block_stamp(&buf), ctx.offset, "wrong data at offset {}", ctx.offset);
    }
    ctx.stats.record_iop(ctx.client, ctx.start.elapsed());
    ctx.free_bufs.lock().unwrap().push(buf);
}

/// Run one client until the stop flag is set or its io budget is used up.
/// Returns how long the client ran.
pub(crate) fn run(
    client: usize,
    args: &Args,
    ready: &Barrier,
    stop: &AtomicBool,
    stats: &Arc<StatsState>,
) -> Duration {
    let span = info_span!("client", client);
    let _entered = span.enter();

    let config = DomainConfig {
        queue_depth: args.queue_depth.get(),
        ..Default::default()
    };
    let domain = direct_aio::launch(args.backend.into(), config).expect("launch completion domain");
    let file = AsyncFile::open(
        setup::data_file_path(client),
        CreateDisposition::OpenExisting,
        FileOptions {
            unbuffered: !args.buffered,
        },
        Arc::clone(&domain),
    )
    .expect("open data file")
    .into_file()
    .expect("data file was created during setup");

    let block_size = args.block_size();
    let blocks_in_file = args.file_size() / block_size as u64;
    let free_bufs = Arc::new(Mutex::new(
        (0..args.queue_depth.get())
            .map(|_| AlignedBuf::with_capacity(block_size, block_size.max(DEVICE_ALIGNMENT)))
            .collect::<Vec<_>>(),
    ));
    let mut ios_left = match args.run_duration {
        RunDuration::FixedPerClientIoCount(n) => Some(n),
        RunDuration::UntilCtrlC | RunDuration::FixedDuration(_) => None,
    };

    ready.wait();
    info!("starting");
    let start = Instant::now();
    let mut rng = rand::thread_rng();
    while !stop.load(Ordering::Relaxed) && ios_left != Some(0) {
        loop {
            if ios_left == Some(0) {
                break;
            }
            let next = free_bufs.lock().unwrap().pop();
            let Some(mut buf) = next else {
                break;
            };
            buf.clear();
            let offset = rng.gen_range(0..blocks_in_file) * block_size as u64;
            let ctx = ReadContext {
                client,
                offset,
                start: Instant::now(),
                validate: args.validate,
                stats: Arc::clone(stats),
                free_bufs: Arc::clone(&free_bufs),
            };
            if let Err(e) = file.read(offset, buf, ctx, on_read_done) {
                panic!("submission failed: {e}");
            }
            if let Some(n) = ios_left.as_mut() {
                *n -= 1;
            }
        }
        while domain.try_complete() {}
    }
    info!(pending = domain.pending(), "stopping, draining in-flight reads");
    while domain.pending() > 0 {
        domain.try_complete();
    }
    start.elapsed()
}
