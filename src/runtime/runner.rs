use crate::orchestrator::{CycleResult, EventIngester, HeadBlockFetcher, IngestionOrchestrator};
use crate::runtime::telemetry::spawn_metrics_reporter;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// Drives ingestion cycles on a timer and handles OS signals for graceful shutdowns.
///
/// Every `poll_interval` the runner processes all configured chains. Every
/// `retry_interval` it also expires stale leases and sweeps failed ranges.
pub struct IngestionRunner {
    orchestrator: Arc<IngestionOrchestrator>,
    ingester: Arc<dyn EventIngester>,
    head_fetcher: Arc<dyn HeadBlockFetcher>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    started: bool,
}

impl IngestionRunner {
    pub fn new(
        orchestrator: Arc<IngestionOrchestrator>,
        ingester: Arc<dyn EventIngester>,
        head_fetcher: Arc<dyn HeadBlockFetcher>,
    ) -> Self {
        Self {
            orchestrator,
            ingester,
            head_fetcher,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
            started: false,
        }
    }

    pub fn orchestrator(&self) -> Arc<IngestionOrchestrator> {
        self.orchestrator.clone()
    }

    /// Returns a clone of the root shutdown token so external callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_running(&self) -> bool {
        self.started
    }

    /// Initializes every configured chain, then spawns the cycle loop and the
    /// metrics reporter.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }

        self.orchestrator
            .initialize_ingestion(None)
            .await
            .context("failed to initialize chain sync state")?;

        let metrics_interval = self.orchestrator.config().metrics_interval();
        self.tasks.push(tokio::spawn(drive_cycles(
            self.orchestrator.clone(),
            self.ingester.clone(),
            self.head_fetcher.clone(),
            self.shutdown.clone(),
        )));
        self.tasks.push(spawn_metrics_reporter(
            self.orchestrator.clone(),
            self.shutdown.clone(),
            metrics_interval,
        ));

        self.started = true;
        tracing::info!(
            chains = self.orchestrator.config().chains().len(),
            "ingestion runner started"
        );
        Ok(())
    }

    /// Cancels the root token and waits for the in-flight cycle to finish.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }

        self.shutdown.cancel();
        self.join_tasks().await?;
        self.started = false;
        self.reinitialize_shutdown_token();
        Ok(())
    }

    /// Runs until a Ctrl-C (SIGINT) is received or the shutdown token is cancelled elsewhere.
    pub async fn run_until_ctrl_c(&mut self) -> Result<()> {
        self.start().await?;
        tracing::info!("runner started; waiting for Ctrl-C (SIGINT) to initiate shutdown");

        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Ctrl-C received; shutting down runner");
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!("runner shutdown token cancelled");
            }
        }

        self.stop().await
    }

    async fn join_tasks(&mut self) -> Result<()> {
        for handle in self.tasks.drain(..) {
            handle.await.context("ingestion runner task panicked")?;
        }
        Ok(())
    }

    fn reinitialize_shutdown_token(&mut self) {
        self.shutdown = CancellationToken::new();
    }
}

async fn drive_cycles(
    orchestrator: Arc<IngestionOrchestrator>,
    ingester: Arc<dyn EventIngester>,
    head_fetcher: Arc<dyn HeadBlockFetcher>,
    shutdown: CancellationToken,
) {
    let config = orchestrator.config().clone();
    let mut next_sweep = Instant::now() + config.retry_interval();

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let results = orchestrator
            .process_all_chains(ingester.as_ref(), head_fetcher.as_ref(), None)
            .await;

        if Instant::now() >= next_sweep {
            match orchestrator.recover_stale_leases().await {
                Ok(expired) if !expired.is_empty() => {
                    tracing::warn!(expired = expired.len(), "expired stale replay leases");
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(error = %format!("{err:#}"), "stale lease recovery failed");
                }
            }
            orchestrator
                .retry_failed_ranges(ingester.as_ref(), config.retry_batch_limit())
                .await;
            next_sweep = Instant::now() + config.retry_interval();
        }

        let delay = next_poll_delay(&results, config.poll_interval());
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = time::sleep(delay) => {}
        }
    }

    tracing::info!("ingestion loop stopped");
}

/// Loops straight away after any successful window so a lagging chain keeps
/// catching up, otherwise sleeps for the shortest budget wait hint, capped by
/// `poll_interval`.
pub(crate) fn next_poll_delay(results: &[CycleResult], poll_interval: Duration) -> Duration {
    if results.iter().any(CycleResult::is_success) {
        return Duration::ZERO;
    }

    results
        .iter()
        .filter_map(CycleResult::wait_hint_ms)
        .map(Duration::from_millis)
        .min()
        .map_or(poll_interval, |hint| hint.min(poll_interval))
}
