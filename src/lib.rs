pub mod budget;
pub mod orchestrator;
pub mod replay;
pub mod runtime;
pub mod store;
pub mod sync;

pub use budget::{
    classify_error, BudgetConfig, BudgetLimits, BudgetSnapshot, DenyReason, RpcBudgetManager,
    RpcErrorKind, RpcFault, SlotDecision,
};
pub use orchestrator::{
    ChainStatusRow, CollaboratorFuture, CycleOutcome, CycleResult, EventIngester,
    HeadBlockFetcher, IngestionErrorKind, IngestionOrchestrator, IngestionStatus,
    IngestionSummary, SkipReason,
};
pub use replay::{
    IngestionResult, LeaseDecision, ReplayDenial, ReplayGuard, ReplayRange, ReplayStats,
    ReplayStatus,
};
pub use runtime::clock::{Clock, ManualClock, SystemClock};
pub use runtime::config::{ChainOverrides, IngestionConfig, IngestionConfigBuilder};
pub use runtime::runner::IngestionRunner;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use store::{ChainStateStore, MemoryStore, ReplayStore};
pub use sync::{
    calculate_lag, calculate_next_window, validate_window, BlockWindow, ChainId, ChainStatus,
    ChainSyncState, SyncStateChange, WindowPolicy, WindowReason, WindowValidationError,
};
