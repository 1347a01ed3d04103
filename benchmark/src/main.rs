use std::{
    num::{NonZeroU32, NonZeroU64},
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Barrier,
    },
    time::Duration,
};

use clap::Parser;
use tracing::{error, info};

mod client;
mod setup;
mod stats;

use stats::StatsState;

/// Random aligned reads against one data file per client. Every client thread
/// owns a completion domain and keeps `queue_depth` reads in flight.
#[derive(serde::Serialize, clap::Parser, Clone)]
struct Args {
    num_clients: NonZeroU64,
    file_size_mib: NonZeroU64,
    /// log2 of the read size; at least 9 (512 bytes) and at most 20 (1 MiB).
    block_size_shift: NonZeroU64,
    #[clap(long, value_enum, default_value = "io-uring")]
    backend: BackendKind,
    #[clap(long, default_value = "32")]
    queue_depth: NonZeroU32,
    /// Go through the page cache instead of O_DIRECT.
    #[clap(long)]
    buffered: bool,
    /// Check the offset stamp at the start of every block read.
    #[clap(long)]
    validate: bool,
    #[clap(long, default_value = "until-ctrl-c")]
    run_duration: RunDuration,
}

#[derive(Clone, Copy, clap::ValueEnum, serde::Serialize)]
enum BackendKind {
    LinuxAio,
    IoUring,
    ThreadPool,
}

impl From<BackendKind> for direct_aio::Backend {
    fn from(kind: BackendKind) -> Self {
        match kind {
            BackendKind::LinuxAio => direct_aio::Backend::LinuxAio,
            BackendKind::IoUring => direct_aio::Backend::IoUring,
            BackendKind::ThreadPool => direct_aio::Backend::ThreadPool,
        }
    }
}

#[derive(Clone, serde::Serialize)]
enum RunDuration {
    UntilCtrlC,
    FixedDuration(Duration),
    FixedPerClientIoCount(u64),
}

impl FromStr for RunDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "until-ctrl-c" {
            return Ok(RunDuration::UntilCtrlC);
        }
        if let Some(count) = s.strip_suffix("ios-per-client") {
            let (count, multiplier) = if let Some(c) = count.strip_suffix("k-") {
                (c, 1000)
            } else if let Some(c) = count.strip_suffix("m-") {
                (c, 1000 * 1000)
            } else {
                (count.trim_end_matches('-'), 1)
            };
            return match count.parse::<NonZeroU64>() {
                Ok(n) => Ok(RunDuration::FixedPerClientIoCount(n.get() * multiplier)),
                Err(e) => Err(format!("invalid io count: {e}: {s:?}")),
            };
        }
        match humantime::parse_duration(s) {
            Ok(d) => Ok(RunDuration::FixedDuration(d)),
            Err(e) => Err(format!("invalid duration: {e}: {s:?}")),
        }
    }
}

impl Args {
    fn block_size(&self) -> usize {
        1 << self.block_size_shift.get()
    }

    fn file_size(&self) -> u64 {
        self.file_size_mib.get() * 1024 * 1024
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_file(true)
        .with_line_number(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    direct_aio::env_tunables::assert_no_unknown_env_vars();

    let args: Arc<Args> = Arc::new(Args::parse());
    assert!(
        (9..=20).contains(&args.block_size_shift.get()),
        "block size must be between 512 bytes and 1 MiB"
    );

    setup::ensure_data_files(&args);

    let stop = Arc::new(AtomicBool::new(false));
    if let RunDuration::FixedDuration(duration) = args.run_duration {
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            std::thread::sleep(duration);
            info!("configured runtime expired, setting stop flag");
            stop.store(true, Ordering::Relaxed);
        });
    }

    ctrlc::set_handler({
        let stop = Arc::clone(&stop);
        move || {
            if stop.fetch_or(true, Ordering::Relaxed) {
                error!("stop flag was already set, aborting");
                std::process::abort();
            }
            info!("ctrl-c, stop flag set");
        }
    })
    .unwrap();

    let num_clients = usize::try_from(args.num_clients.get()).unwrap();
    let stats_state = Arc::new(StatsState::new(num_clients));
    let ready = Arc::new(Barrier::new(num_clients + 1));
    let (done_tx, done_rx) = std::sync::mpsc::channel();

    let monitor = std::thread::Builder::new()
        .name("monitor".to_owned())
        .spawn({
            let args = Arc::clone(&args);
            let stats_state = Arc::clone(&stats_state);
            let ready = Arc::clone(&ready);
            move || stats::monitor(&args, &stats_state, &ready, done_rx)
        })
        .unwrap();

    let client_run_times = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..num_clients)
            .map(|client| {
                let args = Arc::clone(&args);
                let stats_state = Arc::clone(&stats_state);
                let ready = Arc::clone(&ready);
                let stop = Arc::clone(&stop);
                std::thread::Builder::new()
                    .name(format!("client-{client}"))
                    .spawn_scoped(scope, move || {
                        client::run(client, &args, &ready, &stop, &stats_state)
                    })
                    .unwrap()
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    });

    done_tx
        .send(client_run_times)
        .expect("monitor must not exit by itself");
    monitor.join().unwrap();
}
