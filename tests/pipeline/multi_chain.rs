use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chainsync_control::{
    ChainId, ChainStatus, Clock, CycleOutcome, IngestionConfig, IngestionErrorKind,
    IngestionOrchestrator, LeaseDecision, ManualClock, MemoryStore, ReplayDenial, ReplayStatus,
    SkipReason,
};

use crate::support::helpers::{init_tracing, memory_orchestrator, synced_block, temp_snapshot_path};
use crate::support::scripted::ScriptedChains;

const GENESIS_MS: u64 = 1_700_000_000_000;
const CHAINS: [&str; 5] = ["eth", "arb", "base", "op", "polygon"];

#[tokio::test(start_paused = true)]
async fn concurrent_cycles_never_exceed_the_chain_limit() -> Result<()> {
    init_tracing();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(GENESIS_MS));
    let orchestrator = memory_orchestrator(
        IngestionConfig::builder()
            .chains(CHAINS)
            .confirmation_lag(0)
            .max_window_size(10)
            .max_concurrent_chains(2),
        clock,
    )
    .await?;
    let chains = ScriptedChains::new();
    for chain in CHAINS {
        chains.set_head(chain, 100);
    }
    chains.set_latency(Duration::from_secs(5));

    let results = orchestrator.process_all_chains(&chains, &chains, None).await;

    assert_eq!(results.len(), CHAINS.len());
    assert!(results.iter().all(|result| result.is_success()));
    assert_eq!(chains.max_in_flight(), 2);
    Ok(())
}

#[tokio::test]
async fn one_failing_chain_does_not_stop_the_others() -> Result<()> {
    init_tracing();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(GENESIS_MS));
    let orchestrator = memory_orchestrator(
        IngestionConfig::builder()
            .chains(["eth", "arb", "base"])
            .confirmation_lag(0)
            .max_window_size(10),
        clock,
    )
    .await?;
    let chains = ScriptedChains::new();
    chains.set_head("eth", 100);
    chains.set_head("arb", 100);
    chains.break_chain("arb");
    // No head scripted for base: its head fetch fails.

    let results = orchestrator.process_all_chains(&chains, &chains, None).await;
    assert_eq!(results.len(), 3);

    let kind_for = |chain: &str| {
        results
            .iter()
            .find(|result| result.chain == ChainId::new(chain))
            .and_then(|result| result.error_kind())
    };
    assert_eq!(kind_for("eth"), None);
    assert_eq!(kind_for("arb"), Some(IngestionErrorKind::IngestionFailure));
    assert_eq!(kind_for("base"), Some(IngestionErrorKind::HeadFetchFailure));

    let status = orchestrator.get_ingestion_status().await?;
    assert_eq!(status.summary.total_chains, 3);
    let row = |chain: &str| {
        status
            .chains
            .iter()
            .find(|row| row.chain == ChainId::new(chain))
            .expect("status row")
    };
    assert_eq!(row("eth").status, ChainStatus::Active);
    assert_eq!(row("eth").last_synced_block, 10);
    assert_eq!(row("arb").status, ChainStatus::Error);
    assert_eq!(row("base").status, ChainStatus::Error);
    assert_eq!(status.replay.failed, 1);

    let telemetry = orchestrator.telemetry().snapshot();
    assert_eq!(telemetry.windows_succeeded, 1);
    assert_eq!(telemetry.windows_failed, 2);
    Ok(())
}

#[tokio::test]
async fn duplicate_chain_ids_are_processed_once() -> Result<()> {
    init_tracing();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(GENESIS_MS));
    let orchestrator = memory_orchestrator(
        IngestionConfig::builder()
            .chains(["eth", "arb"])
            .confirmation_lag(0),
        clock,
    )
    .await?;
    let chains = ScriptedChains::new();
    chains.set_head("eth", 20);
    chains.set_head("arb", 20);

    let requested = [ChainId::new("eth"), ChainId::new(" ETH "), ChainId::new("arb")];
    let results = orchestrator
        .process_all_chains(&chains, &chains, Some(&requested))
        .await;

    assert_eq!(results.len(), 2);
    assert_eq!(chains.windows_for("eth"), vec![(1, 20)]);
    assert_eq!(chains.windows_for("arb"), vec![(1, 20)]);
    Ok(())
}

#[tokio::test]
async fn progress_and_abandoned_leases_survive_a_restart() -> Result<()> {
    init_tracing();
    let path = temp_snapshot_path("restart");
    let manual = Arc::new(ManualClock::new(GENESIS_MS));
    let clock: Arc<dyn Clock> = manual.clone();
    let config = || {
        IngestionConfig::builder()
            .chain("eth")
            .start_block("eth", 100)
            .confirmation_lag(5)
            .max_window_size(5)
            .lease_timeout(Duration::from_secs(30))
            .build()
    };
    let eth = ChainId::new("eth");
    let chains = ScriptedChains::new();
    chains.set_head("eth", 120);

    {
        let store = Arc::new(MemoryStore::persistent(&path).await?);
        let orchestrator = IngestionOrchestrator::with_store(config()?, store, clock.clone());
        orchestrator.initialize_ingestion(None).await?;
        assert!(orchestrator
            .process_chain(&eth, &chains, &chains)
            .await
            .is_success());

        // Crash after leasing the next window but before finalizing it.
        let lease = orchestrator
            .replay_guard()
            .begin_window(&eth, 106, 110)
            .await?;
        assert!(lease.can_process());
    }

    let store = Arc::new(MemoryStore::persistent(&path).await?);
    let orchestrator = IngestionOrchestrator::with_store(config()?, store, clock);
    orchestrator.initialize_ingestion(None).await?;
    assert_eq!(synced_block(&orchestrator, &eth).await, 105);

    let blocked = orchestrator.process_chain(&eth, &chains, &chains).await;
    assert_eq!(
        blocked.outcome,
        CycleOutcome::Skipped {
            reason: SkipReason::ReplayDenied(ReplayDenial::InProgress {
                from_block: 106,
                to_block: 110,
            }),
        }
    );

    manual.advance(Duration::from_secs(31));
    let expired = orchestrator.recover_stale_leases().await?;
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].status, ReplayStatus::Failed);

    let retried = orchestrator.retry_failed_ranges(&chains, 10).await;
    assert_eq!(retried.len(), 1);
    assert!(retried[0].is_success(), "unexpected outcome {:?}", retried[0]);
    assert_eq!(synced_block(&orchestrator, &eth).await, 110);

    let next = orchestrator.process_chain(&eth, &chains, &chains).await;
    let window = next.window().expect("next window");
    assert_eq!((window.from_block, window.to_block), (111, 115));
    assert!(matches!(
        orchestrator.replay_guard().begin_window(&eth, 106, 110).await?,
        LeaseDecision::Denied(ReplayDenial::AlreadyDone { .. })
    ));

    let _ = tokio::fs::remove_file(&path).await;
    Ok(())
}
