use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chainsync_control::{
    ChainId, Clock, EventIngester, HeadBlockFetcher, IngestionConfig, IngestionConfigBuilder,
    IngestionRunner, SystemClock,
};

use crate::support::helpers::{
    assert_is_contiguous, init_tracing, memory_orchestrator, synced_block, wait_until,
};
use crate::support::scripted::ScriptedChains;

const WAIT: Duration = Duration::from_secs(10);

fn fast_config() -> IngestionConfigBuilder {
    IngestionConfig::builder()
        .chain("eth")
        .confirmation_lag(5)
        .max_window_size(100)
        .base_backoff(Duration::from_millis(20))
        .max_backoff(Duration::from_millis(200))
        .poll_interval(Duration::from_millis(50))
        .retry_interval(Duration::from_millis(100))
        .metrics_interval(Duration::from_millis(50))
}

async fn runner_for(
    config: IngestionConfigBuilder,
    chains: &ScriptedChains,
) -> Result<IngestionRunner> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let orchestrator = memory_orchestrator(config, clock).await?;
    let ingester: Arc<dyn EventIngester> = Arc::new(chains.clone());
    let head_fetcher: Arc<dyn HeadBlockFetcher> = Arc::new(chains.clone());
    Ok(IngestionRunner::new(orchestrator, ingester, head_fetcher))
}

async fn wait_for_synced(runner: &IngestionRunner, chain: &ChainId, target: u64) -> Result<()> {
    let orchestrator = runner.orchestrator();
    wait_until(WAIT, || {
        let orchestrator = orchestrator.clone();
        let chain = chain.clone();
        async move { synced_block(&orchestrator, &chain).await >= target }
    })
    .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn runner_catches_up_to_the_confirmed_head() -> Result<()> {
    init_tracing();
    let eth = ChainId::new("eth");
    let chains = ScriptedChains::new();
    chains.set_head("eth", 1_000);

    let mut runner = runner_for(fast_config(), &chains).await?;
    runner.start().await?;
    assert!(runner.is_running());

    wait_for_synced(&runner, &eth, 995).await?;
    runner.stop().await?;
    assert!(!runner.is_running());

    let windows = chains.windows_for("eth");
    assert_eq!(windows.len(), 10);
    assert_is_contiguous(&windows, 1, 995);

    let telemetry = runner.orchestrator().telemetry().snapshot();
    assert_eq!(telemetry.windows_succeeded, 10);
    assert_eq!(telemetry.blocks_ingested, 995);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn runner_recovers_from_a_failed_window() -> Result<()> {
    init_tracing();
    let eth = ChainId::new("eth");
    let chains = ScriptedChains::new();
    chains.set_head("eth", 300);
    chains.fail_next("eth", anyhow!("upstream returned 502 bad gateway"));

    let mut runner = runner_for(fast_config(), &chains).await?;
    runner.start().await?;
    wait_for_synced(&runner, &eth, 295).await?;
    runner.stop().await?;

    let windows = chains.windows_for("eth");
    assert_eq!(windows[0], (1, 100));
    assert_eq!(windows[1], (1, 100), "failed window is attempted again");
    assert_is_contiguous(&windows[1..], 1, 295);

    let orchestrator = runner.orchestrator();
    let stats = orchestrator.replay_guard().get_replay_stats().await?;
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.failed_ranges_unresolved, 0);
    assert_eq!(stats.in_progress, 0);
    assert_eq!(orchestrator.telemetry().snapshot().windows_failed, 1);
    assert_eq!(orchestrator.budget_status(&eth).consecutive_errors, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn runner_restarts_after_stop() -> Result<()> {
    init_tracing();
    let eth = ChainId::new("eth");
    let chains = ScriptedChains::new();
    chains.set_head("eth", 105);

    let mut runner = runner_for(fast_config(), &chains).await?;
    runner.start().await?;
    wait_for_synced(&runner, &eth, 100).await?;
    runner.stop().await?;

    chains.set_head("eth", 205);
    runner.start().await?;
    wait_for_synced(&runner, &eth, 200).await?;
    runner.stop().await?;

    assert_is_contiguous(&chains.windows_for("eth"), 1, 200);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn external_cancellation_ends_run_until_ctrl_c() -> Result<()> {
    init_tracing();
    let chains = ScriptedChains::new();
    chains.set_head("eth", 50);

    let mut runner = runner_for(fast_config(), &chains).await?;
    let token = runner.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        token.cancel();
    });

    tokio::time::timeout(WAIT, runner.run_until_ctrl_c()).await??;
    assert!(!runner.is_running());
    assert_eq!(synced_block(&runner.orchestrator(), &ChainId::new("eth")).await, 45);
    Ok(())
}
