use super::collaborators::{EventIngester, HeadBlockFetcher};
use super::outcome::{CycleOutcome, CycleResult, IngestionErrorKind, SkipReason};
use crate::budget::{DenyReason, RpcBudgetManager};
use crate::replay::{LeaseDecision, ReplayGuard};
use crate::runtime::clock::Clock;
use crate::runtime::config::IngestionConfig;
use crate::runtime::telemetry::Telemetry;
use crate::store::{ChainStateStore, ReplayStore};
use crate::sync::{
    calculate_next_window, validate_window, BlockWindow, ChainId, ChainSyncState, SuccessMetrics,
    SyncStateChange,
};
use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

/// Drives ingestion cycles for every configured chain.
///
/// Owns the process-wide [`RpcBudgetManager`] and the [`ReplayGuard`]; sync
/// state and replay ranges are written only through this type.
pub struct IngestionOrchestrator {
    pub(super) config: IngestionConfig,
    pub(super) states: Arc<dyn ChainStateStore>,
    pub(super) replay: ReplayGuard,
    pub(super) budget: RpcBudgetManager,
    pub(super) telemetry: Arc<Telemetry>,
    pub(super) clock: Arc<dyn Clock>,
}

impl IngestionOrchestrator {
    pub fn new(
        config: IngestionConfig,
        states: Arc<dyn ChainStateStore>,
        replay_store: Arc<dyn ReplayStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let budget = RpcBudgetManager::new(config.budget_config(), clock.clone());
        Self {
            replay: ReplayGuard::new(replay_store, clock.clone()),
            config,
            states,
            budget,
            telemetry: Arc::new(Telemetry::default()),
            clock,
        }
    }

    /// Uses one store for both sync state and replay ranges.
    pub fn with_store<S>(config: IngestionConfig, store: Arc<S>, clock: Arc<dyn Clock>) -> Self
    where
        S: ChainStateStore + ReplayStore + 'static,
    {
        Self::new(config, store.clone(), store, clock)
    }

    pub fn config(&self) -> &IngestionConfig {
        &self.config
    }

    pub fn budget(&self) -> &RpcBudgetManager {
        &self.budget
    }

    pub fn replay_guard(&self) -> &ReplayGuard {
        &self.replay
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    pub async fn get_chain_state(&self, chain: &ChainId) -> Result<Option<ChainSyncState>> {
        self.states
            .load(chain)
            .await
            .with_context(|| format!("failed to load sync state for {chain}"))
    }

    /// Creates the chain's sync state at `start_block` (or its configured start
    /// block) unless it already exists. Never rewinds existing progress.
    pub async fn init_chain(
        &self,
        chain: &ChainId,
        start_block: Option<u64>,
    ) -> Result<ChainSyncState> {
        let start_block = start_block.unwrap_or_else(|| self.config.start_block(chain));
        let state = self
            .states
            .insert_if_absent(ChainSyncState::new(
                chain.clone(),
                start_block,
                self.clock.now_ms(),
            ))
            .await
            .with_context(|| format!("failed to initialize sync state for {chain}"))?;
        Ok(state)
    }

    /// Bootstraps every configured chain plus any extra chain named in
    /// `start_blocks`. Safe to call on every startup.
    pub async fn initialize_ingestion(
        &self,
        start_blocks: Option<&HashMap<ChainId, u64>>,
    ) -> Result<Vec<ChainSyncState>> {
        let mut chains: Vec<ChainId> = self.config.chains().to_vec();
        if let Some(start_blocks) = start_blocks {
            let mut extra: Vec<&ChainId> = start_blocks
                .keys()
                .filter(|chain| !chains.contains(*chain))
                .collect();
            extra.sort();
            chains.extend(extra.into_iter().cloned());
        }

        let mut states = Vec::with_capacity(chains.len());
        for chain in &chains {
            let start_block = start_blocks.and_then(|blocks| blocks.get(chain).copied());
            let state = self.init_chain(chain, start_block).await?;
            tracing::info!(
                chain = %chain,
                last_synced_block = state.last_synced_block,
                status = ?state.status,
                "chain ready for ingestion"
            );
            states.push(state);
        }
        Ok(states)
    }

    /// Runs one cycle per chain with at most `max_concurrent_chains` in flight.
    /// Results arrive in completion order; failures never escape this call.
    pub async fn process_all_chains(
        &self,
        ingester: &dyn EventIngester,
        head_fetcher: &dyn HeadBlockFetcher,
        chains: Option<&[ChainId]>,
    ) -> Vec<CycleResult> {
        let chains = chains.unwrap_or_else(|| self.config.chains());
        let mut seen = HashSet::new();
        let unique: Vec<ChainId> = chains
            .iter()
            .filter(|chain| seen.insert(*chain))
            .cloned()
            .collect();

        stream::iter(unique)
            .map(|chain| async move { self.process_chain(&chain, ingester, head_fetcher).await })
            .buffer_unordered(self.config.max_concurrent_chains())
            .collect()
            .await
    }

    /// Runs a single cycle for `chain`.
    pub async fn process_chain(
        &self,
        chain: &ChainId,
        ingester: &dyn EventIngester,
        head_fetcher: &dyn HeadBlockFetcher,
    ) -> CycleResult {
        let result = self.run_cycle(chain, ingester, head_fetcher).await;
        self.record(&result);
        result
    }

    async fn run_cycle(
        &self,
        chain: &ChainId,
        ingester: &dyn EventIngester,
        head_fetcher: &dyn HeadBlockFetcher,
    ) -> CycleResult {
        let state = match self.load_or_init(chain).await {
            Ok(state) => state,
            Err(err) => return self.storage_failure(chain, None, err),
        };
        if state.is_paused() {
            return CycleResult::skipped(chain.clone(), SkipReason::Paused);
        }

        let head = match head_fetcher.fetch_head(chain.clone()).await {
            Ok(head) => head,
            Err(err) => {
                let message = format!("{err:#}");
                tracing::warn!(chain = %chain, error = %message, "head block fetch failed");
                let change = SyncStateChange::Error {
                    message: message.clone(),
                };
                let recorded = self.states.apply(chain, change, self.clock.now_ms()).await;
                if let Err(store_err) = recorded {
                    self.report_partial_write(chain, None, "sync state error", &store_err);
                }
                return CycleResult::failed(
                    chain.clone(),
                    IngestionErrorKind::HeadFetchFailure,
                    message,
                    None,
                );
            }
        };

        let state = match self
            .states
            .apply(chain, SyncStateChange::Head { head }, self.clock.now_ms())
            .await
        {
            Ok(state) => state,
            Err(err) => return self.storage_failure(chain, None, err),
        };

        let policy = self.config.window_policy(chain);
        let Some(window) = calculate_next_window(&state, head, &policy) else {
            return CycleResult::skipped(chain.clone(), SkipReason::CaughtUp);
        };

        if let Err(invalid) = validate_window(&window, &state, &policy) {
            tracing::error!(
                chain = %chain,
                from_block = window.from_block,
                to_block = window.to_block,
                error = %invalid,
                "calculated window failed validation"
            );
            return CycleResult::failed(
                chain.clone(),
                IngestionErrorKind::WindowValidationFailure,
                invalid.to_string(),
                Some(window),
            );
        }

        if let Err(skipped) = self.admit(&window).await {
            return skipped;
        }
        self.execute_window(window, head, ingester).await
    }

    /// Budget admission followed by the replay lease. On `Ok` the caller holds
    /// both a budget slot and the lease and must finish with
    /// [`Self::execute_window`].
    pub(super) async fn admit(&self, window: &BlockWindow) -> Result<(), CycleResult> {
        let chain = &window.chain;
        let slot = self.budget.acquire_slot(chain);
        if !slot.can_proceed {
            let reason = slot.reason.unwrap_or(DenyReason::ConcurrencyLimit);
            tracing::debug!(
                chain = %chain,
                from_block = window.from_block,
                to_block = window.to_block,
                wait_ms = slot.wait_ms,
                reason = %reason,
                "rpc budget denied window"
            );
            return Err(CycleResult::skipped(
                chain.clone(),
                SkipReason::BudgetDenied {
                    reason,
                    wait_ms: slot.wait_ms,
                },
            ));
        }

        match self
            .replay
            .begin_window(chain, window.from_block, window.to_block)
            .await
        {
            Ok(LeaseDecision::Leased { .. }) => Ok(()),
            Ok(LeaseDecision::Denied(denial)) => {
                self.budget.release_slot(chain);
                Err(CycleResult::skipped(
                    chain.clone(),
                    SkipReason::ReplayDenied(denial),
                ))
            }
            Err(err) => {
                self.budget.release_slot(chain);
                Err(self.storage_failure(chain, Some(window.clone()), err))
            }
        }
    }

    /// Invokes the ingester for a leased window and finalizes the outcome.
    pub(super) async fn execute_window(
        &self,
        window: BlockWindow,
        head: u64,
        ingester: &dyn EventIngester,
    ) -> CycleResult {
        let chain = window.chain.clone();
        let (from_block, to_block) = (window.from_block, window.to_block);
        let started = Instant::now();

        match ingester.ingest(chain.clone(), from_block, to_block).await {
            Ok(result) => {
                let latency_ms =
                    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                let change = SyncStateChange::Success {
                    from_block,
                    to_block,
                    head,
                    metrics: SuccessMetrics {
                        events_ingested: result.events_ingested,
                        latency_ms,
                    },
                };
                let (state_update, replay_update) = tokio::join!(
                    self.states.apply(&chain, change, self.clock.now_ms()),
                    self.replay.mark_done(&chain, from_block, to_block, result),
                );
                if let Err(err) = state_update {
                    self.report_partial_write(&chain, Some(&window), "sync state success", &err);
                }
                if let Err(err) = replay_update {
                    self.report_partial_write(&chain, Some(&window), "replay done", &err);
                }

                self.budget.release_slot(&chain);
                self.budget.on_rpc_success(&chain);

                tracing::info!(
                    chain = %chain,
                    from_block,
                    to_block,
                    reason = %window.reason,
                    events_found = result.events_found,
                    events_ingested = result.events_ingested,
                    latency_ms,
                    "window ingested"
                );
                CycleResult::new(
                    chain,
                    CycleOutcome::Success {
                        window,
                        result,
                        latency_ms,
                    },
                )
            }
            Err(err) => {
                let message = format!("{err:#}");
                let change = SyncStateChange::Error {
                    message: message.clone(),
                };
                let (state_update, replay_update) = tokio::join!(
                    self.states.apply(&chain, change, self.clock.now_ms()),
                    self.replay.mark_failed(&chain, from_block, to_block, &message),
                );
                if let Err(err) = state_update {
                    self.report_partial_write(&chain, Some(&window), "sync state error", &err);
                }
                if let Err(err) = replay_update {
                    self.report_partial_write(&chain, Some(&window), "replay failed", &err);
                }

                let kind = self.budget.on_rpc_error(&chain, &err);
                tracing::warn!(
                    chain = %chain,
                    from_block,
                    to_block,
                    kind = %kind,
                    error = %message,
                    "window ingestion failed"
                );
                CycleResult::failed(
                    chain,
                    IngestionErrorKind::IngestionFailure,
                    message,
                    Some(window),
                )
            }
        }
    }

    pub(super) async fn load_or_init(&self, chain: &ChainId) -> Result<ChainSyncState> {
        match self.get_chain_state(chain).await? {
            Some(state) => Ok(state),
            None => self.init_chain(chain, None).await,
        }
    }

    pub(super) fn record(&self, result: &CycleResult) {
        match &result.outcome {
            CycleOutcome::Success { window, result, .. } => self
                .telemetry
                .record_window_success(window.len(), result.events_ingested),
            CycleOutcome::Skipped { .. } => self.telemetry.record_window_skipped(),
            CycleOutcome::Failed { .. } => self.telemetry.record_window_failure(),
        }
    }

    pub(super) fn storage_failure(
        &self,
        chain: &ChainId,
        window: Option<BlockWindow>,
        err: anyhow::Error,
    ) -> CycleResult {
        let message = format!("{err:#}");
        tracing::error!(chain = %chain, error = %message, "control plane storage failed");
        self.telemetry.record_storage_error();
        CycleResult::failed(
            chain.clone(),
            IngestionErrorKind::StorageFailure,
            message,
            window,
        )
    }

    fn report_partial_write(
        &self,
        chain: &ChainId,
        window: Option<&BlockWindow>,
        write: &str,
        err: &anyhow::Error,
    ) {
        tracing::error!(
            chain = %chain,
            from_block = window.map(|w| w.from_block),
            to_block = window.map(|w| w.to_block),
            write,
            error = %format!("{err:#}"),
            "failed to persist cycle outcome; state is partially applied"
        );
        self.telemetry.record_storage_error();
    }
}

impl std::fmt::Debug for IngestionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionOrchestrator")
            .field("chains", &self.config.chains())
            .field("budget", &self.budget)
            .finish_non_exhaustive()
    }
}
