use super::collaborators::EventIngester;
use super::cycle::IngestionOrchestrator;
use super::outcome::{CycleResult, IngestionErrorKind, SkipReason};
use crate::replay::ReplayRange;
use crate::sync::{validate_window, BlockWindow, WindowReason, WindowValidationError};
use anyhow::Result;

impl IngestionOrchestrator {
    /// Re-runs admission, lease, ingestion, and finalization for up to `limit`
    /// FAILED ranges, oldest failure first.
    ///
    /// Ranges whose chain is over budget are skipped rather than waited on, so
    /// retries slow down together with the chain's backoff.
    pub async fn retry_failed_ranges(
        &self,
        ingester: &dyn EventIngester,
        limit: usize,
    ) -> Vec<CycleResult> {
        let ranges = match self.replay.get_failed_ranges_for_retry(None, limit).await {
            Ok(ranges) => ranges,
            Err(err) => {
                tracing::error!(error = %format!("{err:#}"), "could not list failed ranges");
                self.telemetry.record_storage_error();
                return Vec::new();
            }
        };

        let mut results = Vec::with_capacity(ranges.len());
        for range in &ranges {
            let result = self.retry_range(range, ingester).await;
            self.record(&result);
            results.push(result);
        }

        if !results.is_empty() {
            tracing::info!(
                attempted = results.len(),
                succeeded = results.iter().filter(|r| r.is_success()).count(),
                skipped = results.iter().filter(|r| r.is_skipped()).count(),
                "retry sweep finished"
            );
        }
        results
    }

    /// Expires IN_PROGRESS leases older than the configured lease timeout.
    pub async fn recover_stale_leases(&self) -> Result<Vec<ReplayRange>> {
        self.replay
            .recover_stale_leases(self.config.lease_timeout())
            .await
    }

    async fn retry_range(&self, range: &ReplayRange, ingester: &dyn EventIngester) -> CycleResult {
        let chain = &range.chain;
        let state = match self.load_or_init(chain).await {
            Ok(state) => state,
            Err(err) => return self.storage_failure(chain, None, err),
        };
        if state.is_paused() {
            return CycleResult::skipped(chain.clone(), SkipReason::Paused);
        }

        let window = BlockWindow {
            chain: chain.clone(),
            from_block: range.from_block,
            to_block: range.to_block,
            reason: WindowReason::Retry,
        };

        // Progress is max-guarded, so a range behind the synced block may still
        // be missing; the replay lease decides whether its blocks were ingested.
        match validate_window(&window, &state, &self.config.window_policy(chain)) {
            Ok(()) | Err(WindowValidationError::AlreadySynced { .. }) => {}
            Err(invalid) => {
                tracing::error!(
                    chain = %chain,
                    from_block = window.from_block,
                    to_block = window.to_block,
                    error = %invalid,
                    "failed range cannot be retried"
                );
                return CycleResult::failed(
                    chain.clone(),
                    IngestionErrorKind::WindowValidationFailure,
                    invalid.to_string(),
                    Some(window),
                );
            }
        }

        if let Err(skipped) = self.admit(&window).await {
            return skipped;
        }

        tracing::debug!(
            chain = %chain,
            from_block = window.from_block,
            to_block = window.to_block,
            retry_count = range.retry_count,
            "retrying failed range"
        );
        self.telemetry.record_retry();
        self.execute_window(window, state.last_head_block, ingester)
            .await
    }
}
