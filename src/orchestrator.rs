//! Per-chain ingestion cycles and the global scheduler that runs them.
//!
//! A cycle walks one chain through head fetch, window calculation, budget
//! admission, replay lease, ingestion, and finalization. Every outcome,
//! including failures, is reported as a [`CycleResult`]; nothing here returns
//! an error to the caller.

pub mod collaborators;
pub mod cycle;
pub mod outcome;
pub mod retry;
pub mod status;

pub use collaborators::{CollaboratorFuture, EventIngester, HeadBlockFetcher};
pub use cycle::IngestionOrchestrator;
pub use outcome::{CycleOutcome, CycleResult, IngestionErrorKind, SkipReason};
pub use status::{ChainStatusRow, IngestionStatus, IngestionSummary};
