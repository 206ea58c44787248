//! Per-chain progress bookkeeping and the block window calculator that turns
//! progress plus a fresh head into the next safe range to ingest.

pub mod state;
pub mod window;

pub use state::{
    calculate_lag, ChainId, ChainStatus, ChainSyncState, SuccessMetrics, SyncStateChange,
};
pub use window::{
    calculate_next_window, validate_window, BlockWindow, WindowPolicy, WindowReason,
    WindowValidationError,
};
