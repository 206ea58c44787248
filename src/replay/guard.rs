use super::range::{IngestionResult, LeaseDecision, ReplayRange, ReplayStats};
use crate::runtime::clock::{duration_to_millis, Clock};
use crate::store::ReplayStore;
use crate::sync::ChainId;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

/// Idempotency gate in front of the event ingester.
///
/// A window is leased with [`ReplayGuard::begin_window`] after the RPC budget
/// admitted it and before any ingestion call, then finalized exactly once with
/// [`ReplayGuard::mark_done`] or [`ReplayGuard::mark_failed`].
#[derive(Clone)]
pub struct ReplayGuard {
    store: Arc<dyn ReplayStore>,
    clock: Arc<dyn Clock>,
}

impl ReplayGuard {
    pub fn new(store: Arc<dyn ReplayStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn begin_window(
        &self,
        chain: &ChainId,
        from_block: u64,
        to_block: u64,
    ) -> Result<LeaseDecision> {
        let decision = self
            .store
            .begin(chain, from_block, to_block, self.clock.now_ms())
            .await
            .with_context(|| format!("failed to lease {chain} {from_block}-{to_block}"))?;

        match &decision {
            LeaseDecision::Leased {
                retry_count,
                resumed,
            } => tracing::debug!(
                chain = %chain,
                from_block,
                to_block,
                retry_count,
                resumed,
                "replay range leased"
            ),
            LeaseDecision::Denied(denial) => tracing::debug!(
                chain = %chain,
                from_block,
                to_block,
                reason = %denial,
                "replay range denied"
            ),
        }

        Ok(decision)
    }

    pub async fn mark_done(
        &self,
        chain: &ChainId,
        from_block: u64,
        to_block: u64,
        result: IngestionResult,
    ) -> Result<()> {
        let resolved = self
            .store
            .complete(chain, from_block, to_block, result, self.clock.now_ms())
            .await
            .with_context(|| format!("failed to mark {chain} {from_block}-{to_block} done"))?;

        if resolved > 0 {
            tracing::info!(
                chain = %chain,
                from_block,
                to_block,
                resolved,
                "completed window resolved earlier failed ranges"
            );
        }
        Ok(())
    }

    pub async fn mark_failed(
        &self,
        chain: &ChainId,
        from_block: u64,
        to_block: u64,
        error_message: &str,
    ) -> Result<()> {
        let transitioned = self
            .store
            .fail(chain, from_block, to_block, error_message, self.clock.now_ms())
            .await
            .with_context(|| format!("failed to mark {chain} {from_block}-{to_block} failed"))?;

        if !transitioned {
            tracing::warn!(
                chain = %chain,
                from_block,
                to_block,
                error = error_message,
                "replay range was already finalized; failure not recorded"
            );
        }
        Ok(())
    }

    /// FAILED ranges, oldest failure first.
    pub async fn get_failed_ranges_for_retry(
        &self,
        chain: Option<&ChainId>,
        limit: usize,
    ) -> Result<Vec<ReplayRange>> {
        self.store
            .failed_ranges(chain, limit)
            .await
            .context("failed to list failed replay ranges")
    }

    pub async fn get_replay_stats(&self) -> Result<ReplayStats> {
        self.store
            .stats()
            .await
            .context("failed to read replay stats")
    }

    /// Fails IN_PROGRESS leases older than `max_age` so a window abandoned by a
    /// crashed or hung cycle becomes retriable.
    pub async fn recover_stale_leases(&self, max_age: Duration) -> Result<Vec<ReplayRange>> {
        let now = self.clock.now_ms();
        let cutoff = now.saturating_sub(duration_to_millis(max_age));
        let expired = self
            .store
            .expire_leases(cutoff, now)
            .await
            .context("failed to expire stale replay leases")?;

        for range in &expired {
            tracing::warn!(
                chain = %range.chain,
                from_block = range.from_block,
                to_block = range.to_block,
                started_at_ms = range.started_at_ms,
                "stale replay lease expired"
            );
        }
        Ok(expired)
    }
}

impl std::fmt::Debug for ReplayGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayGuard").finish_non_exhaustive()
    }
}
