use super::classify::{classify_error, RpcErrorKind};
use super::config::BudgetConfig;
use crate::runtime::clock::{duration_to_millis, Clock};
use crate::sync::ChainId;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Length of the rolling rate-limit window.
pub const RATE_WINDOW_MS: u64 = 60_000;

/// Which gate turned a slot request away.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    Paused,
    Backoff,
    RateLimited,
    ConcurrencyLimit,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::Paused => f.write_str("circuit breaker paused"),
            DenyReason::Backoff => f.write_str("backing off after rpc errors"),
            DenyReason::RateLimited => f.write_str("requests per minute exhausted"),
            DenyReason::ConcurrencyLimit => f.write_str("concurrent request cap reached"),
        }
    }
}

/// Answer to a slot request. Denials carry a hint of how long to wait before
/// asking again; the manager itself never sleeps.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SlotDecision {
    pub can_proceed: bool,
    pub wait_ms: u64,
    pub reason: Option<DenyReason>,
}

impl SlotDecision {
    fn granted() -> Self {
        Self {
            can_proceed: true,
            wait_ms: 0,
            reason: None,
        }
    }

    fn denied(reason: DenyReason, wait_ms: u64) -> Self {
        Self {
            can_proceed: false,
            wait_ms,
            reason: Some(reason),
        }
    }
}

/// Read-only view of one chain's budget for status endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetSnapshot {
    pub requests_this_minute: u32,
    pub max_requests_per_minute: u32,
    pub current_concurrent: u32,
    pub max_concurrent: u32,
    pub consecutive_errors: u32,
    pub current_backoff_ms: u64,
    pub is_paused: bool,
    pub paused_until_ms: Option<u64>,
    pub last_error_kind: Option<RpcErrorKind>,
}

#[derive(Debug, Clone)]
struct BudgetState {
    requests_this_minute: u32,
    current_concurrent: u32,
    minute_started_at_ms: u64,
    consecutive_errors: u32,
    current_backoff_ms: u64,
    is_paused: bool,
    paused_until_ms: Option<u64>,
    last_request_at_ms: Option<u64>,
    last_error_kind: Option<RpcErrorKind>,
}

impl BudgetState {
    fn new(now_ms: u64) -> Self {
        Self {
            requests_this_minute: 0,
            current_concurrent: 0,
            minute_started_at_ms: now_ms,
            consecutive_errors: 0,
            current_backoff_ms: 0,
            is_paused: false,
            paused_until_ms: None,
            last_request_at_ms: None,
            last_error_kind: None,
        }
    }
}

/// Per-chain admission controller for provider RPC traffic.
///
/// One instance is built at startup and shared by reference; state lives only
/// in memory and starts clean on every process restart.
#[derive(Debug)]
pub struct RpcBudgetManager {
    config: BudgetConfig,
    clock: Arc<dyn Clock>,
    chains: Mutex<HashMap<ChainId, BudgetState>>,
}

impl RpcBudgetManager {
    pub fn new(config: BudgetConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            chains: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// Checks the breaker, backoff, rate, and concurrency gates in that order and
    /// reserves a slot when all of them pass.
    pub fn acquire_slot(&self, chain: &ChainId) -> SlotDecision {
        let now = self.clock.now_ms();
        let limits = self.config.limits_for(chain);
        let mut chains = self.lock();
        let state = chains
            .entry(chain.clone())
            .or_insert_with(|| BudgetState::new(now));

        if state.is_paused {
            match state.paused_until_ms {
                Some(until) if now < until => {
                    return SlotDecision::denied(DenyReason::Paused, until - now);
                }
                Some(_) => {
                    state.is_paused = false;
                    state.paused_until_ms = None;
                    state.consecutive_errors = 0;
                    tracing::info!(chain = %chain, "rpc budget cooldown elapsed; resuming chain");
                }
                None => {
                    return SlotDecision::denied(
                        DenyReason::Paused,
                        duration_to_millis(self.config.max_backoff),
                    );
                }
            }
        }

        if let Some(last_request) = state.last_request_at_ms {
            let ready_at = last_request.saturating_add(state.current_backoff_ms);
            if now < ready_at {
                return SlotDecision::denied(DenyReason::Backoff, ready_at - now);
            }
        }

        if now.saturating_sub(state.minute_started_at_ms) > RATE_WINDOW_MS {
            state.requests_this_minute = 0;
            state.minute_started_at_ms = now;
        }

        if state.requests_this_minute >= limits.max_requests_per_minute {
            let window_ends = state.minute_started_at_ms.saturating_add(RATE_WINDOW_MS);
            let wait_ms = window_ends.saturating_sub(now).max(1);
            return SlotDecision::denied(DenyReason::RateLimited, wait_ms);
        }

        if state.current_concurrent >= limits.max_concurrent {
            return SlotDecision::denied(
                DenyReason::ConcurrencyLimit,
                duration_to_millis(self.config.concurrency_retry_hint),
            );
        }

        state.requests_this_minute += 1;
        state.current_concurrent += 1;
        state.last_request_at_ms = Some(now);
        SlotDecision::granted()
    }

    pub fn release_slot(&self, chain: &ChainId) {
        let mut chains = self.lock();
        if let Some(state) = chains.get_mut(chain) {
            state.current_concurrent = state.current_concurrent.saturating_sub(1);
        }
    }

    /// Classifies `error`, then applies [`Self::on_rpc_error_kind`].
    pub fn on_rpc_error(&self, chain: &ChainId, error: &anyhow::Error) -> RpcErrorKind {
        let kind = classify_error(error);
        self.on_rpc_error_kind(chain, kind);
        kind
    }

    /// Releases the slot held by the failed call, grows the backoff, and trips
    /// the breaker once `error_threshold` consecutive errors accumulate.
    pub fn on_rpc_error_kind(&self, chain: &ChainId, kind: RpcErrorKind) {
        let now = self.clock.now_ms();
        let base_ms = duration_to_millis(self.config.base_backoff);
        let max_ms = duration_to_millis(self.config.max_backoff);
        let mut chains = self.lock();
        let state = chains
            .entry(chain.clone())
            .or_insert_with(|| BudgetState::new(now));

        state.current_concurrent = state.current_concurrent.saturating_sub(1);
        state.consecutive_errors = state.consecutive_errors.saturating_add(1);
        state.last_error_kind = Some(kind);

        let errors = state.consecutive_errors;
        let backoff_ms = match kind {
            RpcErrorKind::RateLimit => {
                let multiplier = 1u64.checked_shl(errors).unwrap_or(u64::MAX);
                base_ms.saturating_mul(multiplier)
            }
            _ => base_ms.saturating_mul(u64::from(errors)),
        };
        state.current_backoff_ms = backoff_ms.min(max_ms);

        tracing::debug!(
            chain = %chain,
            kind = %kind,
            consecutive_errors = errors,
            backoff_ms = state.current_backoff_ms,
            "rpc error recorded"
        );

        if errors >= self.config.error_threshold && !state.is_paused {
            state.is_paused = true;
            state.paused_until_ms = Some(now.saturating_add(max_ms));
            tracing::warn!(
                chain = %chain,
                consecutive_errors = errors,
                paused_for_ms = max_ms,
                "rpc circuit breaker tripped; pausing chain"
            );
        }
    }

    /// Full recovery: clears the error streak and any backoff.
    pub fn on_rpc_success(&self, chain: &ChainId) {
        let mut chains = self.lock();
        if let Some(state) = chains.get_mut(chain) {
            state.consecutive_errors = 0;
            state.current_backoff_ms = 0;
        }
    }

    /// Operator override. `None` keeps the chain paused until [`Self::force_unpause`].
    pub fn force_pause(&self, chain: &ChainId, duration: Option<Duration>, reason: &str) {
        let now = self.clock.now_ms();
        let mut chains = self.lock();
        let state = chains
            .entry(chain.clone())
            .or_insert_with(|| BudgetState::new(now));
        state.is_paused = true;
        state.paused_until_ms = duration.map(|d| now.saturating_add(duration_to_millis(d)));
        tracing::warn!(
            chain = %chain,
            reason,
            paused_until_ms = ?state.paused_until_ms,
            "rpc budget force-paused"
        );
    }

    pub fn force_unpause(&self, chain: &ChainId) {
        let mut chains = self.lock();
        if let Some(state) = chains.get_mut(chain) {
            state.is_paused = false;
            state.paused_until_ms = None;
            state.consecutive_errors = 0;
            state.current_backoff_ms = 0;
            tracing::warn!(chain = %chain, "rpc budget force-unpaused");
        }
    }

    pub fn budget_status(&self, chain: &ChainId) -> BudgetSnapshot {
        let now = self.clock.now_ms();
        let chains = self.lock();
        match chains.get(chain) {
            Some(state) => self.snapshot_of(chain, state),
            None => self.snapshot_of(chain, &BudgetState::new(now)),
        }
    }

    pub fn all_budget_status(&self) -> BTreeMap<ChainId, BudgetSnapshot> {
        let chains = self.lock();
        chains
            .iter()
            .map(|(chain, state)| (chain.clone(), self.snapshot_of(chain, state)))
            .collect()
    }

    fn snapshot_of(&self, chain: &ChainId, state: &BudgetState) -> BudgetSnapshot {
        let limits = self.config.limits_for(chain);
        BudgetSnapshot {
            requests_this_minute: state.requests_this_minute,
            max_requests_per_minute: limits.max_requests_per_minute,
            current_concurrent: state.current_concurrent,
            max_concurrent: limits.max_concurrent,
            consecutive_errors: state.consecutive_errors,
            current_backoff_ms: state.current_backoff_ms,
            is_paused: state.is_paused,
            paused_until_ms: state.paused_until_ms,
            last_error_kind: state.last_error_kind,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ChainId, BudgetState>> {
        self.chains.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
