//! Idempotency ledger for block windows. A window must be leased here before
//! it is ingested, and its terminal outcome is recorded here afterwards.

pub mod guard;
pub mod ledger;
pub mod range;

pub use guard::ReplayGuard;
pub use ledger::ReplayLedger;
pub use range::{
    IngestionResult, LeaseDecision, ReplayDenial, ReplayRange, ReplayStats, ReplayStatus,
};
