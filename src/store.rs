//! Storage seam for the two durable tables the control plane owns:
//! `chain_sync_state` (one row per chain) and `replay_ranges` (one row per
//! attempted window).
//!
//! Every mutating method must be atomic with respect to concurrent callers.
//! In particular [`ReplayStore::begin`] performs the overlap check and the
//! insert as one step, so two orchestrator cycles can never both lease
//! overlapping windows.

pub mod memory;
pub mod snapshot;

pub use memory::MemoryStore;

use crate::replay::{IngestionResult, LeaseDecision, ReplayRange, ReplayStats};
use crate::sync::{ChainId, ChainSyncState, SyncStateChange};
use anyhow::Result;
use futures::future::BoxFuture;

pub trait ChainStateStore: Send + Sync {
    fn load<'a>(&'a self, chain: &'a ChainId) -> BoxFuture<'a, Result<Option<ChainSyncState>>>;

    fn load_all(&self) -> BoxFuture<'_, Result<Vec<ChainSyncState>>>;

    /// Inserts `state` unless the chain already exists; returns the stored row.
    fn insert_if_absent(&self, state: ChainSyncState) -> BoxFuture<'_, Result<ChainSyncState>>;

    /// Applies `change` to an existing row via [`ChainSyncState::apply`].
    fn apply<'a>(
        &'a self,
        chain: &'a ChainId,
        change: SyncStateChange,
        now_ms: u64,
    ) -> BoxFuture<'a, Result<ChainSyncState>>;
}

pub trait ReplayStore: Send + Sync {
    fn begin<'a>(
        &'a self,
        chain: &'a ChainId,
        from_block: u64,
        to_block: u64,
        now_ms: u64,
    ) -> BoxFuture<'a, Result<LeaseDecision>>;

    /// Returns the number of FAILED ranges fully covered after this completion.
    fn complete<'a>(
        &'a self,
        chain: &'a ChainId,
        from_block: u64,
        to_block: u64,
        result: IngestionResult,
        now_ms: u64,
    ) -> BoxFuture<'a, Result<usize>>;

    /// Returns `false` when the range was already terminal.
    fn fail<'a>(
        &'a self,
        chain: &'a ChainId,
        from_block: u64,
        to_block: u64,
        error_message: &'a str,
        now_ms: u64,
    ) -> BoxFuture<'a, Result<bool>>;

    fn failed_ranges<'a>(
        &'a self,
        chain: Option<&'a ChainId>,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<ReplayRange>>>;

    fn stats(&self) -> BoxFuture<'_, Result<ReplayStats>>;

    fn expire_leases(&self, cutoff_ms: u64, now_ms: u64)
        -> BoxFuture<'_, Result<Vec<ReplayRange>>>;
}
