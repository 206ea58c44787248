use crate::orchestrator::IngestionOrchestrator;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(30);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Cumulative cycle counters shared by the orchestrator and the reporter.
#[derive(Default, Debug)]
pub struct Telemetry {
    windows_succeeded: AtomicU64,
    windows_failed: AtomicU64,
    windows_skipped: AtomicU64,
    retries: AtomicU64,
    events_ingested: AtomicU64,
    blocks_ingested: AtomicU64,
    storage_errors: AtomicU64,
}

impl Telemetry {
    pub fn record_window_success(&self, blocks: u64, events: u64) {
        self.windows_succeeded.fetch_add(1, Ordering::Relaxed);
        self.blocks_ingested.fetch_add(blocks, Ordering::Relaxed);
        self.events_ingested.fetch_add(events, Ordering::Relaxed);
    }

    pub fn record_window_failure(&self) {
        self.windows_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_window_skipped(&self) {
        self.windows_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_storage_error(&self) {
        self.storage_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            windows_succeeded: self.windows_succeeded.load(Ordering::Relaxed),
            windows_failed: self.windows_failed.load(Ordering::Relaxed),
            windows_skipped: self.windows_skipped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            events_ingested: self.events_ingested.load(Ordering::Relaxed),
            blocks_ingested: self.blocks_ingested.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub windows_succeeded: u64,
    pub windows_failed: u64,
    pub windows_skipped: u64,
    pub retries: u64,
    pub events_ingested: u64,
    pub blocks_ingested: u64,
    pub storage_errors: u64,
}

/// Spawns a background task that periodically logs ingestion throughput,
/// window outcomes, total lag, and paused chains.
pub fn spawn_metrics_reporter(
    orchestrator: Arc<IngestionOrchestrator>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let telemetry = orchestrator.telemetry();
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "chainsync::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current = telemetry.snapshot();
                    let blocks_delta = current
                        .blocks_ingested
                        .saturating_sub(last_snapshot.blocks_ingested);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        blocks_delta as f64 / elapsed
                    };

                    let (total_lag, paused_chains) = match orchestrator.get_ingestion_status().await {
                        Ok(status) => (status.summary.total_lag, status.summary.paused_chains),
                        Err(err) => {
                            tracing::warn!(
                                target: "chainsync::metrics",
                                error = %format!("{err:#}"),
                                "could not read ingestion status"
                            );
                            (0, 0)
                        }
                    };

                    tracing::info!(
                        target: "chainsync::metrics",
                        blocks_per_sec = format!("{throughput:.2}"),
                        succeeded = current.windows_succeeded,
                        failed = current.windows_failed,
                        skipped = current.windows_skipped,
                        retries = current.retries,
                        events = current.events_ingested,
                        storage_errors = current.storage_errors,
                        total_lag,
                        paused_chains,
                        "ingestion metrics snapshot"
                    );

                    last_snapshot = current;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
