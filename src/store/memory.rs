use super::snapshot::SnapshotFile;
use super::{ChainStateStore, ReplayStore};
use crate::replay::{IngestionResult, LeaseDecision, ReplayLedger, ReplayRange, ReplayStats};
use crate::sync::{ChainId, ChainSyncState, SyncStateChange};
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Tables {
    chains: BTreeMap<ChainId, ChainSyncState>,
    replay: ReplayLedger,
}

/// Both control-plane tables behind a single async mutex.
///
/// Built with [`MemoryStore::persistent`], every mutation is staged on a copy,
/// written to the snapshot file, and only then made visible, so the file and
/// memory never disagree about a committed change.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    snapshot: Option<SnapshotFile>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens (or creates on first write) a JSON snapshot at `path`.
    pub async fn persistent(path: impl Into<PathBuf>) -> Result<Self> {
        let snapshot = SnapshotFile::new(path);
        let tables: Tables = snapshot.load().await?.unwrap_or_default();
        tracing::info!(
            path = %snapshot.path().display(),
            chains = tables.chains.len(),
            "opened control plane snapshot"
        );
        Ok(Self {
            tables: Mutex::new(tables),
            snapshot: Some(snapshot),
        })
    }

    /// Copy of the replay table, for inspection and tests.
    pub async fn replay_ledger(&self) -> ReplayLedger {
        self.tables.lock().await.replay.clone()
    }

    async fn mutate<R, F>(&self, change: F) -> Result<R>
    where
        F: FnOnce(&mut Tables) -> Result<R>,
    {
        let mut tables = self.tables.lock().await;
        match &self.snapshot {
            None => change(&mut tables),
            Some(snapshot) => {
                let mut staged = tables.clone();
                let outcome = change(&mut staged)?;
                snapshot
                    .write(&staged)
                    .await
                    .context("failed to persist control plane snapshot")?;
                *tables = staged;
                Ok(outcome)
            }
        }
    }
}

impl ChainStateStore for MemoryStore {
    fn load<'a>(&'a self, chain: &'a ChainId) -> BoxFuture<'a, Result<Option<ChainSyncState>>> {
        Box::pin(async move { Ok(self.tables.lock().await.chains.get(chain).cloned()) })
    }

    fn load_all(&self) -> BoxFuture<'_, Result<Vec<ChainSyncState>>> {
        Box::pin(async move { Ok(self.tables.lock().await.chains.values().cloned().collect()) })
    }

    fn insert_if_absent(&self, state: ChainSyncState) -> BoxFuture<'_, Result<ChainSyncState>> {
        Box::pin(async move {
            {
                let tables = self.tables.lock().await;
                if let Some(existing) = tables.chains.get(&state.chain) {
                    return Ok(existing.clone());
                }
            }
            self.mutate(move |tables| {
                Ok(tables
                    .chains
                    .entry(state.chain.clone())
                    .or_insert(state)
                    .clone())
            })
            .await
        })
    }

    fn apply<'a>(
        &'a self,
        chain: &'a ChainId,
        change: SyncStateChange,
        now_ms: u64,
    ) -> BoxFuture<'a, Result<ChainSyncState>> {
        Box::pin(async move {
            self.mutate(move |tables| {
                let state = tables
                    .chains
                    .get_mut(chain)
                    .with_context(|| format!("chain {chain} has no sync state"))?;
                state.apply(change, now_ms);
                Ok(state.clone())
            })
            .await
        })
    }
}

impl ReplayStore for MemoryStore {
    fn begin<'a>(
        &'a self,
        chain: &'a ChainId,
        from_block: u64,
        to_block: u64,
        now_ms: u64,
    ) -> BoxFuture<'a, Result<LeaseDecision>> {
        Box::pin(async move {
            self.mutate(|tables| Ok(tables.replay.begin(chain, from_block, to_block, now_ms)))
                .await
        })
    }

    fn complete<'a>(
        &'a self,
        chain: &'a ChainId,
        from_block: u64,
        to_block: u64,
        result: IngestionResult,
        now_ms: u64,
    ) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            self.mutate(|tables| {
                tables
                    .replay
                    .mark_done(chain, from_block, to_block, result, now_ms)
            })
            .await
        })
    }

    fn fail<'a>(
        &'a self,
        chain: &'a ChainId,
        from_block: u64,
        to_block: u64,
        error_message: &'a str,
        now_ms: u64,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            self.mutate(|tables| {
                tables
                    .replay
                    .mark_failed(chain, from_block, to_block, error_message, now_ms)
            })
            .await
        })
    }

    fn failed_ranges<'a>(
        &'a self,
        chain: Option<&'a ChainId>,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<ReplayRange>>> {
        Box::pin(async move { Ok(self.tables.lock().await.replay.failed_ranges(chain, limit)) })
    }

    fn stats(&self) -> BoxFuture<'_, Result<ReplayStats>> {
        Box::pin(async move { Ok(self.tables.lock().await.replay.stats()) })
    }

    fn expire_leases(
        &self,
        cutoff_ms: u64,
        now_ms: u64,
    ) -> BoxFuture<'_, Result<Vec<ReplayRange>>> {
        Box::pin(async move {
            self.mutate(|tables| Ok(tables.replay.expire_leases(cutoff_ms, now_ms)))
                .await
        })
    }
}
