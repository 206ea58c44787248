//! Per-chain RPC admission control: circuit-breaker pause, error backoff,
//! sliding-window rate limiting, and a concurrency cap, plus the classifier
//! that maps collaborator failures onto error kinds.

pub mod classify;
pub mod config;
pub mod manager;

pub use classify::{classify_error, classify_message, RpcErrorKind, RpcFault};
pub use config::{BudgetConfig, BudgetLimits};
pub use manager::{BudgetSnapshot, DenyReason, RpcBudgetManager, SlotDecision};
