//! In-memory replay table and the state transitions that every
//! [`crate::store::ReplayStore`] applies atomically.

use super::range::{
    IngestionResult, LeaseDecision, ReplayDenial, ReplayRange, ReplayStats, ReplayStatus,
};
use crate::sync::ChainId;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const LEASE_EXPIRED_MESSAGE: &str = "lease expired before the window was finalized";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayLedger {
    ranges: BTreeMap<ChainId, Vec<ReplayRange>>,
}

impl ReplayLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn range(&self, chain: &ChainId, from_block: u64, to_block: u64) -> Option<&ReplayRange> {
        self.ranges
            .get(chain)?
            .iter()
            .find(|range| range.is_range(from_block, to_block))
    }

    pub fn ranges(&self, chain: &ChainId) -> &[ReplayRange] {
        self.ranges.get(chain).map(Vec::as_slice).unwrap_or_default()
    }

    /// Rejects any overlap with an IN_PROGRESS or DONE range, otherwise leases
    /// the window (re-using an identical FAILED record when one exists).
    pub fn begin(
        &mut self,
        chain: &ChainId,
        from_block: u64,
        to_block: u64,
        now_ms: u64,
    ) -> LeaseDecision {
        if to_block < from_block {
            return LeaseDecision::Denied(ReplayDenial::InvalidRange {
                from_block,
                to_block,
            });
        }

        let ranges = self.ranges.entry(chain.clone()).or_default();

        if let Some(blocking) = ranges.iter().find(|range| {
            range.status != ReplayStatus::Failed && range.overlaps(from_block, to_block)
        }) {
            let denial = match blocking.status {
                ReplayStatus::InProgress => ReplayDenial::InProgress {
                    from_block: blocking.from_block,
                    to_block: blocking.to_block,
                },
                _ => ReplayDenial::AlreadyDone {
                    from_block: blocking.from_block,
                    to_block: blocking.to_block,
                },
            };
            return LeaseDecision::Denied(denial);
        }

        if let Some(existing) = ranges
            .iter_mut()
            .find(|range| range.is_range(from_block, to_block))
        {
            existing.status = ReplayStatus::InProgress;
            existing.started_at_ms = now_ms;
            existing.finished_at_ms = None;
            return LeaseDecision::Leased {
                retry_count: existing.retry_count,
                resumed: true,
            };
        }

        let position = ranges.partition_point(|range| {
            (range.from_block, range.to_block) < (from_block, to_block)
        });
        ranges.insert(
            position,
            ReplayRange::leased(chain.clone(), from_block, to_block, now_ms),
        );
        LeaseDecision::Leased {
            retry_count: 0,
            resumed: false,
        }
    }

    /// Finalizes a window as DONE, then compacts the chain's table. Returns how
    /// many FAILED ranges the new coverage resolved.
    pub fn mark_done(
        &mut self,
        chain: &ChainId,
        from_block: u64,
        to_block: u64,
        result: IngestionResult,
        now_ms: u64,
    ) -> Result<usize> {
        let Some(ranges) = self.ranges.get_mut(chain) else {
            bail!("no replay ranges recorded for chain {chain}");
        };

        match ranges
            .iter()
            .position(|range| range.is_range(from_block, to_block))
        {
            Some(index) => {
                let target = &mut ranges[index];
                if target.status == ReplayStatus::Done {
                    return Ok(0);
                }
                target.status = ReplayStatus::Done;
                target.finished_at_ms = Some(now_ms);
                target.error_message = None;
                target.result = Some(result);
            }
            None if ranges.iter().any(|range| {
                range.status == ReplayStatus::Done && range.covers(from_block, to_block)
            }) =>
            {
                return Ok(0);
            }
            None if ranges.iter().any(|range| range.overlaps(from_block, to_block)) => {
                // The lease expired and compaction reshaped its FAILED record;
                // the blocks still landed.
                let mut done = ReplayRange::leased(chain.clone(), from_block, to_block, now_ms);
                done.status = ReplayStatus::Done;
                done.finished_at_ms = Some(now_ms);
                done.result = Some(result);
                ranges.push(done);
            }
            None => bail!("no replay range recorded for {chain} {from_block}-{to_block}"),
        }

        Ok(compact(ranges))
    }

    /// Moves an IN_PROGRESS window to FAILED and counts the failed attempt.
    /// Returns `false` when the range was already terminal and left untouched.
    pub fn mark_failed(
        &mut self,
        chain: &ChainId,
        from_block: u64,
        to_block: u64,
        error_message: &str,
        now_ms: u64,
    ) -> Result<bool> {
        let Some(ranges) = self.ranges.get_mut(chain) else {
            bail!("no replay ranges recorded for chain {chain}");
        };
        let Some(index) = ranges
            .iter()
            .position(|range| range.is_range(from_block, to_block))
        else {
            if ranges.iter().any(|range| range.overlaps(from_block, to_block)) {
                // Folded into a DONE range or trimmed while this attempt ran.
                return Ok(false);
            }
            bail!("no replay range recorded for {chain} {from_block}-{to_block}");
        };

        let target = &mut ranges[index];
        match target.status {
            ReplayStatus::Done => Ok(false),
            ReplayStatus::Failed => {
                // Already expired by the lease sweep; keep the freshest cause.
                target.error_message = Some(error_message.to_owned());
                Ok(false)
            }
            ReplayStatus::InProgress => {
                target.status = ReplayStatus::Failed;
                target.retry_count = target.retry_count.saturating_add(1);
                target.finished_at_ms = Some(now_ms);
                target.error_message = Some(error_message.to_owned());
                Ok(true)
            }
        }
    }

    /// FAILED ranges ordered by when they last failed, oldest first.
    pub fn failed_ranges(&self, chain: Option<&ChainId>, limit: usize) -> Vec<ReplayRange> {
        let mut failed: Vec<&ReplayRange> = self
            .ranges
            .iter()
            .filter(|(key, _)| chain.map_or(true, |wanted| *key == wanted))
            .flat_map(|(_, ranges)| ranges.iter())
            .filter(|range| range.status == ReplayStatus::Failed)
            .collect();

        failed.sort_by_key(|range| {
            (
                range.finished_at_ms.unwrap_or(range.started_at_ms),
                range.chain.clone(),
                range.from_block,
            )
        });
        failed.into_iter().take(limit).cloned().collect()
    }

    pub fn stats(&self) -> ReplayStats {
        let mut stats = ReplayStats::default();
        for range in self.ranges.values().flatten() {
            stats.failed += u64::from(range.retry_count);
            match range.status {
                ReplayStatus::Done => stats.done += 1,
                ReplayStatus::InProgress => stats.in_progress += 1,
                ReplayStatus::Failed => stats.failed_ranges_unresolved += 1,
            }
        }
        stats
    }

    /// Fails every IN_PROGRESS lease started before `cutoff_ms`.
    pub fn expire_leases(&mut self, cutoff_ms: u64, now_ms: u64) -> Vec<ReplayRange> {
        let mut expired = Vec::new();
        for range in self.ranges.values_mut().flatten() {
            if range.status == ReplayStatus::InProgress && range.started_at_ms < cutoff_ms {
                range.status = ReplayStatus::Failed;
                range.retry_count = range.retry_count.saturating_add(1);
                range.finished_at_ms = Some(now_ms);
                range.error_message = Some(LEASE_EXPIRED_MESSAGE.to_owned());
                expired.push(range.clone());
            }
        }
        expired
    }
}

/// Keeps a chain's table proportional to its gaps rather than its history.
///
/// DONE ranges that touch or overlap are folded into one record, summing their
/// results and failed attempts. FAILED ranges lose the blocks that are now
/// covered: fully covered ones are dropped (their attempts move to the DONE
/// record) and partially covered ones shrink to their uncovered pieces, so a
/// FAILED range never overlaps DONE coverage and its retry can always lease.
/// Returns how many FAILED ranges were fully resolved.
fn compact(ranges: &mut Vec<ReplayRange>) -> usize {
    let (mut done, rest): (Vec<_>, Vec<_>) = ranges
        .drain(..)
        .partition(|range| range.status == ReplayStatus::Done);
    done.sort_by_key(|range| (range.from_block, range.to_block));

    let mut coverage: Vec<ReplayRange> = Vec::with_capacity(done.len());
    for range in done {
        match coverage.last_mut() {
            Some(last) if range.from_block <= last.to_block.saturating_add(1) => {
                fold_done(last, range);
            }
            _ => coverage.push(range),
        }
    }

    let mut resolved = 0;
    let mut open = Vec::with_capacity(rest.len());
    for range in rest {
        if range.status != ReplayStatus::Failed {
            open.push(range);
            continue;
        }
        let pieces = uncovered(range.from_block, range.to_block, &coverage);
        if pieces.is_empty() {
            if let Some(cover) = coverage
                .iter_mut()
                .find(|cover| cover.covers(range.from_block, range.to_block))
            {
                cover.retry_count = cover.retry_count.saturating_add(range.retry_count);
            }
            resolved += 1;
            continue;
        }
        for (from_block, to_block) in pieces {
            open.push(ReplayRange {
                from_block,
                to_block,
                ..range.clone()
            });
        }
    }

    // A trimmed piece can land on the bounds of another open record; the key
    // stays unique by keeping the IN_PROGRESS (or first FAILED) record.
    open.sort_by_key(|range| {
        (
            range.from_block,
            range.to_block,
            range.status != ReplayStatus::InProgress,
        )
    });
    open.dedup_by(|later, kept| {
        if !later.is_range(kept.from_block, kept.to_block) {
            return false;
        }
        kept.retry_count = kept.retry_count.saturating_add(later.retry_count);
        if kept.status == ReplayStatus::Failed && later.finished_at_ms > kept.finished_at_ms {
            kept.finished_at_ms = later.finished_at_ms;
            kept.error_message = later.error_message.take();
        }
        true
    });

    ranges.extend(coverage);
    ranges.extend(open);
    ranges.sort_by_key(|range| (range.from_block, range.to_block));
    resolved
}

fn fold_done(into: &mut ReplayRange, range: ReplayRange) {
    into.to_block = into.to_block.max(range.to_block);
    into.started_at_ms = into.started_at_ms.min(range.started_at_ms);
    into.finished_at_ms = into.finished_at_ms.max(range.finished_at_ms);
    into.retry_count = into.retry_count.saturating_add(range.retry_count);
    into.result = match (into.result, range.result) {
        (Some(ours), Some(theirs)) => Some(ours.combined(theirs)),
        (ours, theirs) => ours.or(theirs),
    };
}

/// Pieces of `[from_block, to_block]` outside `coverage`, which must be sorted
/// and disjoint.
fn uncovered(from_block: u64, to_block: u64, coverage: &[ReplayRange]) -> Vec<(u64, u64)> {
    let mut pieces = Vec::new();
    let mut cursor = from_block;
    for covered in coverage
        .iter()
        .filter(|covered| covered.overlaps(from_block, to_block))
    {
        if covered.from_block > cursor {
            pieces.push((cursor, covered.from_block - 1));
        }
        if covered.to_block >= to_block {
            return pieces;
        }
        cursor = covered.to_block + 1;
    }
    pieces.push((cursor, to_block));
    pieces
}
