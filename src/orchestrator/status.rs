use super::cycle::IngestionOrchestrator;
use crate::budget::BudgetSnapshot;
use crate::replay::ReplayStats;
use crate::sync::{ChainId, ChainStatus, ChainSyncState, SyncStateChange};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainStatusRow {
    pub chain: ChainId,
    pub status: ChainStatus,
    pub last_synced_block: u64,
    pub last_head_block: u64,
    pub lag: u64,
    pub total_events: u64,
    pub last_error: Option<String>,
    pub pause_reason: Option<String>,
    /// Set while the chain's circuit breaker holds it.
    pub breaker_paused: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestionSummary {
    pub total_chains: usize,
    pub active_chains: usize,
    /// Chains paused by an operator or by their circuit breaker.
    pub paused_chains: usize,
    pub total_lag: u64,
    pub total_events: u64,
}

/// Operational snapshot consumed by dashboards and health checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestionStatus {
    pub chains: Vec<ChainStatusRow>,
    pub summary: IngestionSummary,
    pub replay: ReplayStats,
    pub rpc_budget: BTreeMap<ChainId, BudgetSnapshot>,
    pub generated_at_ms: u64,
}

impl IngestionOrchestrator {
    pub async fn get_ingestion_status(&self) -> Result<IngestionStatus> {
        let (states, replay) = tokio::join!(self.states.load_all(), self.replay.get_replay_stats());
        let mut states = states.context("failed to load chain sync states")?;
        let replay = replay?;
        states.sort_by(|a, b| a.chain.cmp(&b.chain));

        let mut rpc_budget = self.budget.all_budget_status();
        let mut summary = IngestionSummary::default();
        let mut chains = Vec::with_capacity(states.len());

        for state in states {
            let budget = rpc_budget
                .entry(state.chain.clone())
                .or_insert_with(|| self.budget.budget_status(&state.chain));
            let breaker_paused = budget.is_paused;

            summary.total_chains += 1;
            if state.is_paused() || breaker_paused {
                summary.paused_chains += 1;
            } else if state.status == ChainStatus::Active {
                summary.active_chains += 1;
            }
            summary.total_lag = summary.total_lag.saturating_add(state.lag());
            summary.total_events = summary
                .total_events
                .saturating_add(state.total_events_ingested);

            chains.push(ChainStatusRow {
                lag: state.lag(),
                chain: state.chain,
                status: state.status,
                last_synced_block: state.last_synced_block,
                last_head_block: state.last_head_block,
                total_events: state.total_events_ingested,
                last_error: state.last_error,
                pause_reason: state.pause_reason,
                breaker_paused,
            });
        }

        Ok(IngestionStatus {
            chains,
            summary,
            replay,
            rpc_budget,
            generated_at_ms: self.clock.now_ms(),
        })
    }

    pub fn budget_status(&self, chain: &ChainId) -> BudgetSnapshot {
        self.budget.budget_status(chain)
    }

    pub fn all_budget_status(&self) -> BTreeMap<ChainId, BudgetSnapshot> {
        self.budget.all_budget_status()
    }

    /// Operator pause: marks the chain PAUSED and holds its RPC budget until
    /// [`Self::resume_chain`].
    pub async fn pause_chain(&self, chain: &ChainId, reason: &str) -> Result<ChainSyncState> {
        self.load_or_init(chain).await?;
        let state = self
            .states
            .apply(
                chain,
                SyncStateChange::Pause {
                    reason: reason.to_owned(),
                },
                self.clock.now_ms(),
            )
            .await
            .with_context(|| format!("failed to pause {chain}"))?;
        self.budget.force_pause(chain, None, reason);
        Ok(state)
    }

    pub async fn resume_chain(&self, chain: &ChainId) -> Result<ChainSyncState> {
        let state = self
            .states
            .apply(chain, SyncStateChange::Resume, self.clock.now_ms())
            .await
            .with_context(|| format!("failed to resume {chain}"))?;
        self.budget.force_unpause(chain);
        tracing::warn!(chain = %chain, status = ?state.status, "chain resumed by operator");
        Ok(state)
    }
}
