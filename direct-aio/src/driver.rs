//! Drive a [`CompletionDomain`] from a tokio task.
//!
//! Domains only deliver completions when polled. In a tokio application, spawn
//! one driver per domain and use [`AsyncFile::read_owned`](crate::AsyncFile::read_owned)
//! and [`AsyncFile::write_owned`](crate::AsyncFile::write_owned).

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

use crate::CompletionDomain;

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Completions delivered before yielding to other tasks.
    pub batch: usize,
    /// How long to sleep when the domain has nothing in flight.
    pub idle_sleep: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            batch: 32,
            idle_sleep: Duration::from_millis(1),
        }
    }
}

/// Spawn a task on the current runtime that polls `domain` until `cancel` fires.
///
/// Callbacks run on the driver task. While operations are in flight the task
/// busy-polls, yielding between batches; otherwise it sleeps for
/// [`DriverConfig::idle_sleep`].
///
/// # Panics
///
/// Panics if called outside of a tokio runtime.
pub fn spawn_driver<D>(
    domain: Arc<D>,
    cancel: CancellationToken,
    config: DriverConfig,
) -> tokio::task::JoinHandle<()>
where
    D: CompletionDomain + ?Sized + 'static,
{
    let span = info_span!("driver", backend = ?domain.backend());
    tokio::spawn(
        async move {
            debug!("started");
            loop {
                let mut delivered = 0;
                while delivered < config.batch && domain.try_complete() {
                    delivered += 1;
                }
                if cancel.is_cancelled() {
                    break;
                }
                if delivered > 0 || domain.pending() > 0 {
                    tokio::task::yield_now().await;
                    continue;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.idle_sleep) => {}
                }
            }
            debug!(pending = domain.pending(), "cancelled");
        }
        .instrument(span),
    )
}
