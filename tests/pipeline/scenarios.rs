use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chainsync_control::{
    ChainId, Clock, CycleOutcome, DenyReason, IngestionConfig, IngestionErrorKind, LeaseDecision,
    ManualClock, ReplayDenial, SkipReason,
};

use crate::support::helpers::{init_tracing, memory_orchestrator, synced_block, wait_until};
use crate::support::scripted::ScriptedChains;

const GENESIS_MS: u64 = 1_700_000_000_000;

fn eth() -> ChainId {
    ChainId::new("eth")
}

#[tokio::test]
async fn lagged_window_is_leased_once_until_finalized() -> Result<()> {
    init_tracing();
    let clock = Arc::new(ManualClock::new(GENESIS_MS));
    let orchestrator = memory_orchestrator(
        IngestionConfig::builder()
            .chain("eth")
            .start_block("eth", 100)
            .confirmation_lag(5)
            .max_window_size(1_000),
        clock,
    )
    .await?;

    let chains = ScriptedChains::new();
    chains.set_head("eth", 110);
    chains.close_gate();

    let first = {
        let orchestrator = orchestrator.clone();
        let chains = chains.clone();
        tokio::spawn(async move { orchestrator.process_chain(&eth(), &chains, &chains).await })
    };
    wait_until(Duration::from_secs(5), || {
        let chains = chains.clone();
        async move { chains.calls().len() == 1 }
    })
    .await?;

    let second = orchestrator.process_chain(&eth(), &chains, &chains).await;
    match &second.outcome {
        CycleOutcome::Skipped {
            reason: SkipReason::ReplayDenied(denial),
        } => assert_eq!(
            *denial,
            ReplayDenial::InProgress {
                from_block: 101,
                to_block: 105
            }
        ),
        other => panic!("expected an in-progress replay denial, got {other:?}"),
    }
    assert_eq!(second.error_kind(), Some(IngestionErrorKind::ReplayDenied));

    chains.open_gate();
    let first = first.await?;
    let window = first.window().expect("first cycle ingests a window");
    assert_eq!((window.from_block, window.to_block), (101, 105));
    assert!(first.is_success());
    assert_eq!(chains.windows_for("eth"), vec![(101, 105)]);

    assert_eq!(synced_block(&orchestrator, &eth()).await, 105);
    // The denied cycle handed its budget slot back.
    assert_eq!(orchestrator.budget_status(&eth()).current_concurrent, 0);
    Ok(())
}

#[tokio::test]
async fn rate_limit_resets_after_the_minute_rolls_over() -> Result<()> {
    init_tracing();
    let clock = Arc::new(ManualClock::new(GENESIS_MS));
    let orchestrator = memory_orchestrator(
        IngestionConfig::builder()
            .chain("eth")
            .start_block("eth", 0)
            .confirmation_lag(0)
            .max_window_size(10)
            .max_requests_per_minute(3),
        clock.clone(),
    )
    .await?;
    let chains = ScriptedChains::new();
    chains.set_head("eth", 1_000);

    for _ in 0..3 {
        let result = orchestrator.process_chain(&eth(), &chains, &chains).await;
        assert!(result.is_success(), "unexpected outcome {result:?}");
    }

    let limited = orchestrator.process_chain(&eth(), &chains, &chains).await;
    match limited.outcome {
        CycleOutcome::Skipped {
            reason: SkipReason::BudgetDenied { reason, wait_ms },
        } => {
            assert_eq!(reason, DenyReason::RateLimited);
            assert!(wait_ms > 0 && wait_ms <= 60_000, "wait hint {wait_ms}");
        }
        other => panic!("expected a rate-limit denial, got {other:?}"),
    }
    assert_eq!(chains.calls().len(), 3);

    clock.advance(Duration::from_secs(61));
    let resumed = orchestrator.process_chain(&eth(), &chains, &chains).await;
    let window = resumed.window().expect("budget admits a new window");
    assert_eq!((window.from_block, window.to_block), (31, 40));
    assert_eq!(orchestrator.budget_status(&eth()).requests_this_minute, 1);
    Ok(())
}

#[tokio::test]
async fn breaker_pauses_a_failing_chain_and_recovers_after_cooldown() -> Result<()> {
    init_tracing();
    let clock = Arc::new(ManualClock::new(GENESIS_MS));
    let orchestrator = memory_orchestrator(
        IngestionConfig::builder()
            .chains(["eth", "arb"])
            .start_block("eth", 100)
            .start_block("arb", 0)
            .confirmation_lag(5)
            .max_window_size(5)
            .error_threshold(3)
            .base_backoff(Duration::from_secs(1))
            .max_backoff(Duration::from_secs(60)),
        clock.clone(),
    )
    .await?;
    let arb = ChainId::new("arb");
    let chains = ScriptedChains::new();
    chains.set_head("eth", 110);
    chains.set_head("arb", 50);
    chains.break_chain("eth");

    for attempt in 1..=3 {
        let result = orchestrator.process_chain(&eth(), &chains, &chains).await;
        assert_eq!(
            result.error_kind(),
            Some(IngestionErrorKind::IngestionFailure),
            "attempt {attempt}"
        );
        clock.advance(Duration::from_secs(10));
    }

    let status = orchestrator.get_ingestion_status().await?;
    let budget = &status.rpc_budget[&eth()];
    assert!(budget.is_paused);
    assert!(budget.paused_until_ms.is_some_and(|until| until > clock.now_ms()));
    let row = status
        .chains
        .iter()
        .find(|row| row.chain == eth())
        .expect("eth row");
    assert!(row.breaker_paused);
    assert!(row.last_error.as_deref().is_some_and(|e| e.contains("connection reset")));
    assert_eq!(status.summary.paused_chains, 1);

    let denied = orchestrator.process_chain(&eth(), &chains, &chains).await;
    match denied.outcome {
        CycleOutcome::Skipped {
            reason: SkipReason::BudgetDenied { reason, .. },
        } => assert_eq!(reason, DenyReason::Paused),
        other => panic!("expected a breaker denial, got {other:?}"),
    }

    // Other chains keep their own budget.
    assert!(orchestrator.process_chain(&arb, &chains, &chains).await.is_success());

    chains.heal("eth");
    clock.advance(Duration::from_secs(61));
    let recovered = orchestrator.process_chain(&eth(), &chains, &chains).await;
    assert!(recovered.is_success(), "unexpected outcome {recovered:?}");
    assert_eq!(orchestrator.budget_status(&eth()).consecutive_errors, 0);
    assert!(!orchestrator.budget_status(&eth()).is_paused);

    let ranges = orchestrator
        .replay_guard()
        .get_failed_ranges_for_retry(Some(&eth()), 10)
        .await?;
    assert!(ranges.is_empty(), "re-leased range was finalized: {ranges:?}");
    let stats = orchestrator.replay_guard().get_replay_stats().await?;
    assert_eq!(stats.failed, 3);
    assert_eq!(stats.failed_ranges_unresolved, 0);
    assert_eq!(synced_block(&orchestrator, &eth()).await, 105);
    Ok(())
}

#[tokio::test]
async fn operator_pause_skips_until_resumed() -> Result<()> {
    init_tracing();
    let clock = Arc::new(ManualClock::new(GENESIS_MS));
    let orchestrator = memory_orchestrator(
        IngestionConfig::builder()
            .chain("eth")
            .start_block("eth", 100)
            .confirmation_lag(5),
        clock,
    )
    .await?;
    let chains = ScriptedChains::new();
    chains.set_head("eth", 200);

    let paused = orchestrator.pause_chain(&eth(), "provider maintenance").await?;
    assert_eq!(paused.pause_reason.as_deref(), Some("provider maintenance"));

    let skipped = orchestrator.process_chain(&eth(), &chains, &chains).await;
    assert!(matches!(
        skipped.outcome,
        CycleOutcome::Skipped {
            reason: SkipReason::Paused
        }
    ));
    assert!(chains.calls().is_empty());

    orchestrator.resume_chain(&eth()).await?;
    let resumed = orchestrator.process_chain(&eth(), &chains, &chains).await;
    assert!(resumed.is_success());
    let ranges = orchestrator.replay_guard().get_replay_stats().await?;
    assert_eq!(ranges.done, 1);
    assert_eq!(ranges.in_progress, 0);
    assert!(matches!(
        orchestrator
            .replay_guard()
            .begin_window(&eth(), 101, 101)
            .await?,
        LeaseDecision::Denied(ReplayDenial::AlreadyDone { .. })
    ));
    Ok(())
}
