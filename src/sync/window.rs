use super::state::{ChainId, ChainSyncState};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_CONFIRMATION_LAG: u64 = 5;
pub const DEFAULT_MAX_WINDOW_SIZE: u64 = 1_000;

/// Why a window was chosen; purely informational.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WindowReason {
    CatchUp,
    TipFollow,
    Retry,
}

impl fmt::Display for WindowReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowReason::CatchUp => f.write_str("catch-up"),
            WindowReason::TipFollow => f.write_str("tip-follow"),
            WindowReason::Retry => f.write_str("retry"),
        }
    }
}

/// Contiguous inclusive block range `[from_block, to_block]` processed as one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockWindow {
    pub chain: ChainId,
    pub from_block: u64,
    pub to_block: u64,
    pub reason: WindowReason,
}

impl BlockWindow {
    /// Number of blocks covered; zero for an inverted range.
    pub fn len(&self) -> u64 {
        if self.to_block < self.from_block {
            return 0;
        }
        self.to_block - self.from_block + 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reorg safety margin and batch sizing applied to one chain.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WindowPolicy {
    pub confirmation_lag: u64,
    pub max_window_size: u64,
}

impl Default for WindowPolicy {
    fn default() -> Self {
        Self {
            confirmation_lag: DEFAULT_CONFIRMATION_LAG,
            max_window_size: DEFAULT_MAX_WINDOW_SIZE,
        }
    }
}

/// Computes the next window to ingest, or `None` when the chain is within
/// `confirmation_lag` blocks of `head_block`.
pub fn calculate_next_window(
    state: &ChainSyncState,
    head_block: u64,
    policy: &WindowPolicy,
) -> Option<BlockWindow> {
    let max_window = policy.max_window_size.max(1);
    let distance = head_block.saturating_sub(state.last_synced_block);
    if distance <= policy.confirmation_lag {
        return None;
    }

    let from_block = state.last_synced_block + 1;
    let safe_tip = head_block - policy.confirmation_lag;
    let to_block = safe_tip.min(from_block.saturating_add(max_window - 1));
    let reason = if distance > max_window.saturating_mul(2) {
        WindowReason::CatchUp
    } else {
        WindowReason::TipFollow
    };

    Some(BlockWindow {
        chain: state.chain.clone(),
        from_block,
        to_block,
        reason,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowValidationError {
    ChainMismatch { window: ChainId, state: ChainId },
    AlreadySynced { from_block: u64, last_synced_block: u64 },
    Inverted { from_block: u64, to_block: u64 },
    TooLarge { len: u64, max_window_size: u64 },
}

impl fmt::Display for WindowValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowValidationError::ChainMismatch { window, state } => {
                write!(f, "window for chain {window} validated against state of {state}")
            }
            WindowValidationError::AlreadySynced {
                from_block,
                last_synced_block,
            } => write!(
                f,
                "window starts at {from_block} but chain is already synced to {last_synced_block}"
            ),
            WindowValidationError::Inverted {
                from_block,
                to_block,
            } => write!(f, "window end {to_block} is before its start {from_block}"),
            WindowValidationError::TooLarge {
                len,
                max_window_size,
            } => write!(
                f,
                "window spans {len} blocks which exceeds the maximum of {max_window_size}"
            ),
        }
    }
}

impl std::error::Error for WindowValidationError {}

/// Safety net run on every window before it is leased, whatever produced it.
pub fn validate_window(
    window: &BlockWindow,
    state: &ChainSyncState,
    policy: &WindowPolicy,
) -> Result<(), WindowValidationError> {
    if window.chain != state.chain {
        return Err(WindowValidationError::ChainMismatch {
            window: window.chain.clone(),
            state: state.chain.clone(),
        });
    }

    if window.from_block <= state.last_synced_block {
        return Err(WindowValidationError::AlreadySynced {
            from_block: window.from_block,
            last_synced_block: state.last_synced_block,
        });
    }

    if window.to_block < window.from_block {
        return Err(WindowValidationError::Inverted {
            from_block: window.from_block,
            to_block: window.to_block,
        });
    }

    let max_window_size = policy.max_window_size.max(1);
    if window.len() > max_window_size {
        return Err(WindowValidationError::TooLarge {
            len: window.len(),
            max_window_size,
        });
    }

    Ok(())
}
