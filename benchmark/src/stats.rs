use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc, Barrier, Mutex,
    },
    time::{Duration, Instant},
};

use crossbeam_utils::CachePadded;
use hdrhistogram::{Counter, Histogram};
use itertools::Itertools;
use serde_with::serde_as;
use tracing::info;

use crate::Args;

const MONITOR_PERIOD: Duration = Duration::from_secs(1);
const LATENCY_PERCENTILES: [f64; 5] = [50.0, 90.0, 99.0, 99.9, 99.99];

/// Per-client counters, written by the clients' callbacks and drained by the monitor.
pub(crate) struct StatsState {
    ios_since_last_tick: Vec<CachePadded<AtomicU64>>,
    latencies: Vec<CachePadded<Mutex<Histogram<u64>>>>,
}

fn latency_histogram() -> Histogram<u64> {
    Histogram::new_with_bounds(1, 1_000_000_000, 3).unwrap()
}

impl StatsState {
    pub(crate) fn new(num_clients: usize) -> Self {
        StatsState {
            ios_since_last_tick: (0..num_clients)
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
            latencies: (0..num_clients)
                .map(|_| CachePadded::new(Mutex::new(latency_histogram())))
                .collect(),
        }
    }

    pub(crate) fn record_iop(&self, client: usize, latency: Duration) {
        self.ios_since_last_tick[client].fetch_add(1, Ordering::Relaxed);
        let nanos = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.latencies[client]
            .lock()
            .unwrap()
            .saturating_record(nanos);
    }
}

struct Window {
    start: Instant,
    ios: u64,
    io_size: u64,
    latencies: Histogram<u64>,
}

#[serde_as]
#[derive(serde::Serialize)]
struct Summary {
    #[serde_as(as = "serde_with::DurationMicroSeconds")]
    elapsed_us: Duration,
    iops: f64,
    bandwidth_mibps: f64,
    latency_mean_us: f64,
    latency_max_us: f64,
    latency_percentiles_us: HashMap<String, f64>,
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "t{:.2} iops={:.0} bw={:.2}MiB/s lat(us): mean={:.0} max={:.0} {}",
            self.elapsed_us.as_secs_f64(),
            self.iops,
            self.bandwidth_mibps,
            self.latency_mean_us,
            self.latency_max_us,
            self.latency_percentiles_us
                .iter()
                .sorted_by(|a, b| a.0.cmp(b.0))
                .map(|(p, v)| format!("{p}={v:.0}"))
                .join(" "),
        )
    }
}

impl Window {
    fn new(io_size: u64) -> Self {
        Window {
            start: Instant::now(),
            ios: 0,
            io_size,
            latencies: latency_histogram(),
        }
    }

    fn reset(&mut self) {
        self.start = Instant::now();
        self.ios = 0;
        self.latencies.clear();
    }

    fn summary(&self) -> Summary {
        let elapsed = self.start.elapsed();
        let secs = elapsed.as_secs_f64();
        Summary {
            elapsed_us: elapsed,
            iops: self.ios as f64 / secs,
            bandwidth_mibps: (self.ios * self.io_size) as f64 / (1 << 20) as f64 / secs,
            latency_mean_us: self.latencies.mean() / 1000.0,
            latency_max_us: self.latencies.max().as_f64() / 1000.0,
            latency_percentiles_us: LATENCY_PERCENTILES
                .iter()
                .map(|p| {
                    let v = self.latencies.value_at_percentile(*p).as_f64() / 1000.0;
                    (format!("p{p}"), v)
                })
                .collect(),
        }
    }
}

#[derive(serde::Serialize)]
struct BenchmarkOutput<'a> {
    args: &'a Args,
    sorted_per_client_ios: Vec<u64>,
    sorted_per_client_runtimes_secs: Vec<f64>,
    direct_aio_metrics: String,
    totals: Vec<Summary>,
}

/// Print a summary every second until the clients report their run times on
/// `done`, then write `benchmark.output.json`.
pub(crate) fn monitor(
    args: &Args,
    stats: &StatsState,
    ready: &Barrier,
    done: mpsc::Receiver<Vec<Duration>>,
) {
    let io_size = args.block_size() as u64;
    let mut total = Window::new(io_size);
    let mut tick = Window::new(io_size);
    let mut per_client_ios = vec![0u64; stats.ios_since_last_tick.len()];
    let mut totals = Vec::new();

    ready.wait();
    total.reset();
    let client_run_times = loop {
        tick.reset();
        let exit = match done.recv_timeout(MONITOR_PERIOD) {
            Ok(run_times) => Some(run_times),
            Err(mpsc::RecvTimeoutError::Timeout) => None,
            Err(mpsc::RecvTimeoutError::Disconnected) => panic!("clients exited without reporting"),
        };
        for (client, counter) in stats.ios_since_last_tick.iter().enumerate() {
            let ios = counter.swap(0, Ordering::Relaxed);
            per_client_ios[client] += ios;
            tick.ios += ios;
            total.ios += ios;
        }
        for h in &stats.latencies {
            let mut h = h.lock().unwrap();
            total.latencies += &*h;
            tick.latencies += &*h;
            h.clear();
        }
        info!("{}", tick.summary());
        let total_summary = total.summary();
        info!("{total_summary}");
        totals.push(total_summary);
        if let Some(run_times) = exit {
            break run_times;
        }
    };

    let output = BenchmarkOutput {
        args,
        sorted_per_client_ios: per_client_ios.into_iter().sorted().collect(),
        sorted_per_client_runtimes_secs: client_run_times
            .into_iter()
            .sorted()
            .map(|d| d.as_secs_f64())
            .collect(),
        direct_aio_metrics: format!("{:?}", direct_aio::metrics::global()),
        totals,
    };
    let outpath = std::path::PathBuf::from("benchmark.output.json");
    info!("writing results to {:?}", outpath);
    std::fs::write(&outpath, serde_json::to_string(&output).unwrap()).unwrap();
    info!("total: {}", total.summary());
}
