use crate::budget::DenyReason;
use crate::replay::{IngestionResult, ReplayDenial};
use crate::sync::{BlockWindow, ChainId};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestionErrorKind {
    HeadFetchFailure,
    WindowValidationFailure,
    BudgetDenied,
    ReplayDenied,
    IngestionFailure,
    /// The control plane's own state could not be read or written.
    StorageFailure,
}

impl IngestionErrorKind {
    /// Genuine faults, as opposed to expected control-flow denials.
    pub fn is_fault(self) -> bool {
        matches!(
            self,
            IngestionErrorKind::HeadFetchFailure
                | IngestionErrorKind::IngestionFailure
                | IngestionErrorKind::StorageFailure
        )
    }
}

impl fmt::Display for IngestionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            IngestionErrorKind::HeadFetchFailure => "HEAD_FETCH_FAILURE",
            IngestionErrorKind::WindowValidationFailure => "WINDOW_VALIDATION_FAILURE",
            IngestionErrorKind::BudgetDenied => "BUDGET_DENIED",
            IngestionErrorKind::ReplayDenied => "REPLAY_DENIED",
            IngestionErrorKind::IngestionFailure => "INGESTION_FAILURE",
            IngestionErrorKind::StorageFailure => "STORAGE_FAILURE",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Operator pause recorded in the chain's sync state.
    Paused,
    /// Within `confirmation_lag` of the head.
    CaughtUp,
    BudgetDenied { reason: DenyReason, wait_ms: u64 },
    ReplayDenied(ReplayDenial),
}

impl SkipReason {
    pub fn error_kind(&self) -> Option<IngestionErrorKind> {
        match self {
            SkipReason::BudgetDenied { .. } => Some(IngestionErrorKind::BudgetDenied),
            SkipReason::ReplayDenied(_) => Some(IngestionErrorKind::ReplayDenied),
            SkipReason::Paused | SkipReason::CaughtUp => None,
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Paused => f.write_str("chain is paused"),
            SkipReason::CaughtUp => f.write_str("caught up with the confirmed head"),
            SkipReason::BudgetDenied { reason, wait_ms } => {
                write!(f, "{reason}; retry in {wait_ms}ms")
            }
            SkipReason::ReplayDenied(denial) => write!(f, "{denial}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Success {
        window: BlockWindow,
        result: IngestionResult,
        latency_ms: u64,
    },
    Skipped {
        reason: SkipReason,
    },
    Failed {
        kind: IngestionErrorKind,
        error: String,
        window: Option<BlockWindow>,
    },
}

/// What one chain's cycle (or one retried range) ended with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleResult {
    pub chain: ChainId,
    pub outcome: CycleOutcome,
}

impl CycleResult {
    pub(crate) fn new(chain: ChainId, outcome: CycleOutcome) -> Self {
        Self { chain, outcome }
    }

    pub(crate) fn skipped(chain: ChainId, reason: SkipReason) -> Self {
        Self::new(chain, CycleOutcome::Skipped { reason })
    }

    pub(crate) fn failed(
        chain: ChainId,
        kind: IngestionErrorKind,
        error: impl Into<String>,
        window: Option<BlockWindow>,
    ) -> Self {
        Self::new(
            chain,
            CycleOutcome::Failed {
                kind,
                error: error.into(),
                window,
            },
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, CycleOutcome::Success { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.outcome, CycleOutcome::Skipped { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, CycleOutcome::Failed { .. })
    }

    pub fn window(&self) -> Option<&BlockWindow> {
        match &self.outcome {
            CycleOutcome::Success { window, .. } => Some(window),
            CycleOutcome::Failed { window, .. } => window.as_ref(),
            CycleOutcome::Skipped { .. } => None,
        }
    }

    pub fn error_kind(&self) -> Option<IngestionErrorKind> {
        match &self.outcome {
            CycleOutcome::Success { .. } => None,
            CycleOutcome::Skipped { reason } => reason.error_kind(),
            CycleOutcome::Failed { kind, .. } => Some(*kind),
        }
    }

    /// Wait hint from a budget denial, if that is why the cycle was skipped.
    pub fn wait_hint_ms(&self) -> Option<u64> {
        match &self.outcome {
            CycleOutcome::Skipped {
                reason: SkipReason::BudgetDenied { wait_ms, .. },
            } => Some(*wait_ms),
            _ => None,
        }
    }
}
