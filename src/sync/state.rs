use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalized chain identifier ("eth", " Eth " and "ETH" are the same chain).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(String);

impl ChainId {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChainId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ChainId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl AsRef<str> for ChainId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainStatus {
    Active,
    Paused,
    Error,
}

/// Ingestion metadata reported alongside a successful window.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct SuccessMetrics {
    pub events_ingested: u64,
    pub latency_ms: u64,
}

/// A single mutation of a chain's durable progress record.
///
/// Stores apply changes through [`ChainSyncState::apply`] inside their own
/// atomic section so the guards below hold regardless of writer interleaving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStateChange {
    Head {
        head: u64,
    },
    Success {
        from_block: u64,
        to_block: u64,
        head: u64,
        metrics: SuccessMetrics,
    },
    Error {
        message: String,
    },
    Pause {
        reason: String,
    },
    Resume,
}

/// Durable per-chain progress record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSyncState {
    pub chain: ChainId,
    pub status: ChainStatus,
    pub last_synced_block: u64,
    pub last_head_block: u64,
    pub total_events_ingested: u64,
    pub consecutive_failures: u32,
    pub pause_reason: Option<String>,
    pub last_error: Option<String>,
    pub last_latency_ms: Option<u64>,
    pub updated_at_ms: u64,
}

impl ChainSyncState {
    pub fn new(chain: ChainId, start_block: u64, now_ms: u64) -> Self {
        Self {
            chain,
            status: ChainStatus::Active,
            last_synced_block: start_block,
            last_head_block: start_block,
            total_events_ingested: 0,
            consecutive_failures: 0,
            pause_reason: None,
            last_error: None,
            last_latency_ms: None,
            updated_at_ms: now_ms,
        }
    }

    pub fn lag(&self) -> u64 {
        calculate_lag(self)
    }

    pub fn is_paused(&self) -> bool {
        self.status == ChainStatus::Paused
    }

    pub fn apply(&mut self, change: SyncStateChange, now_ms: u64) {
        match change {
            SyncStateChange::Head { head } => {
                self.last_head_block = self.last_head_block.max(head);
            }
            SyncStateChange::Success {
                to_block,
                head,
                metrics,
                ..
            } => {
                // Completions can arrive out of block order under retries.
                if to_block > self.last_synced_block {
                    self.last_synced_block = to_block;
                }
                self.last_head_block = self
                    .last_head_block
                    .max(head)
                    .max(self.last_synced_block);
                self.total_events_ingested = self
                    .total_events_ingested
                    .saturating_add(metrics.events_ingested);
                self.last_latency_ms = Some(metrics.latency_ms);
                self.last_error = None;
                self.consecutive_failures = 0;
                if self.status != ChainStatus::Paused {
                    self.status = ChainStatus::Active;
                }
            }
            SyncStateChange::Error { message } => {
                self.last_error = Some(message);
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.status != ChainStatus::Paused {
                    self.status = ChainStatus::Error;
                }
            }
            SyncStateChange::Pause { reason } => {
                self.status = ChainStatus::Paused;
                self.pause_reason = Some(reason);
            }
            SyncStateChange::Resume => {
                self.status = if self.last_error.is_some() {
                    ChainStatus::Error
                } else {
                    ChainStatus::Active
                };
                self.pause_reason = None;
            }
        }
        self.updated_at_ms = now_ms;
    }
}

/// Blocks between the last known head and the last synced block.
pub fn calculate_lag(state: &ChainSyncState) -> u64 {
    state
        .last_head_block
        .saturating_sub(state.last_synced_block)
}
