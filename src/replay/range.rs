use crate::sync::ChainId;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplayStatus {
    InProgress,
    Done,
    Failed,
}

/// What the event ingester reported for a window.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionResult {
    pub events_found: u64,
    pub events_ingested: u64,
}

impl IngestionResult {
    pub fn combined(self, other: IngestionResult) -> IngestionResult {
        IngestionResult {
            events_found: self.events_found.saturating_add(other.events_found),
            events_ingested: self.events_ingested.saturating_add(other.events_ingested),
        }
    }
}

/// One attempted window, unique per `(chain, from_block, to_block)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayRange {
    pub chain: ChainId,
    pub from_block: u64,
    pub to_block: u64,
    pub status: ReplayStatus,
    /// Number of failed attempts recorded for this range.
    pub retry_count: u32,
    pub started_at_ms: u64,
    pub finished_at_ms: Option<u64>,
    pub error_message: Option<String>,
    pub result: Option<IngestionResult>,
}

impl ReplayRange {
    pub(crate) fn leased(chain: ChainId, from_block: u64, to_block: u64, now_ms: u64) -> Self {
        Self {
            chain,
            from_block,
            to_block,
            status: ReplayStatus::InProgress,
            retry_count: 0,
            started_at_ms: now_ms,
            finished_at_ms: None,
            error_message: None,
            result: None,
        }
    }

    pub fn overlaps(&self, from_block: u64, to_block: u64) -> bool {
        self.from_block <= to_block && from_block <= self.to_block
    }

    pub fn is_range(&self, from_block: u64, to_block: u64) -> bool {
        self.from_block == from_block && self.to_block == to_block
    }

    /// True when every block of `[from_block, to_block]` lies in this range.
    pub fn covers(&self, from_block: u64, to_block: u64) -> bool {
        self.from_block <= from_block && to_block <= self.to_block
    }
}

/// Why a lease was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayDenial {
    InProgress { from_block: u64, to_block: u64 },
    AlreadyDone { from_block: u64, to_block: u64 },
    InvalidRange { from_block: u64, to_block: u64 },
}

impl fmt::Display for ReplayDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayDenial::InProgress {
                from_block,
                to_block,
            } => write!(f, "overlapping range {from_block}-{to_block} is in progress"),
            ReplayDenial::AlreadyDone {
                from_block,
                to_block,
            } => write!(f, "overlapping range {from_block}-{to_block} is already done"),
            ReplayDenial::InvalidRange {
                from_block,
                to_block,
            } => write!(f, "range {from_block}-{to_block} is inverted"),
        }
    }
}

impl std::error::Error for ReplayDenial {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseDecision {
    /// The range is now IN_PROGRESS and owned by the caller. `resumed` is set
    /// when a previously FAILED record was re-leased.
    Leased { retry_count: u32, resumed: bool },
    Denied(ReplayDenial),
}

impl LeaseDecision {
    pub fn can_process(&self) -> bool {
        matches!(self, LeaseDecision::Leased { .. })
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayStats {
    pub done: u64,
    pub in_progress: u64,
    /// Failed attempts recorded across all ranges.
    pub failed: u64,
    /// Ranges currently sitting in FAILED, awaiting a retry.
    pub failed_ranges_unresolved: u64,
}
