use crate::sync::ChainId;
use anyhow::{bail, Result};
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_MAX_REQUESTS_PER_MINUTE: u32 = 120;
pub const DEFAULT_MAX_CONCURRENT: u32 = 2;
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);
pub const DEFAULT_ERROR_THRESHOLD: u32 = 5;
/// Poll interval suggested to callers turned away by the concurrency cap.
pub const DEFAULT_CONCURRENCY_RETRY_HINT: Duration = Duration::from_millis(100);

/// Rate and concurrency ceilings for one chain's provider.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BudgetLimits {
    pub max_requests_per_minute: u32,
    pub max_concurrent: u32,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            max_requests_per_minute: DEFAULT_MAX_REQUESTS_PER_MINUTE,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetConfig {
    pub default_limits: BudgetLimits,
    pub overrides: HashMap<ChainId, BudgetLimits>,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub error_threshold: u32,
    pub concurrency_retry_hint: Duration,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            default_limits: BudgetLimits::default(),
            overrides: HashMap::new(),
            base_backoff: DEFAULT_BASE_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            concurrency_retry_hint: DEFAULT_CONCURRENCY_RETRY_HINT,
        }
    }
}

impl BudgetConfig {
    /// Installs tighter (or looser) limits for a single chain.
    pub fn with_override(mut self, chain: impl Into<ChainId>, limits: BudgetLimits) -> Self {
        self.overrides.insert(chain.into(), limits);
        self
    }

    pub fn limits_for(&self, chain: &ChainId) -> BudgetLimits {
        self.overrides
            .get(chain)
            .copied()
            .unwrap_or(self.default_limits)
    }

    pub fn validate(&self) -> Result<()> {
        validate_limits("default", &self.default_limits)?;
        for (chain, limits) in &self.overrides {
            validate_limits(chain.as_str(), limits)?;
        }

        if self.base_backoff.is_zero() {
            bail!("base_backoff must be greater than 0");
        }

        if self.max_backoff < self.base_backoff {
            bail!("max_backoff must be at least base_backoff");
        }

        if self.error_threshold == 0 {
            bail!("error_threshold must be greater than 0");
        }

        if self.concurrency_retry_hint.is_zero() {
            bail!("concurrency_retry_hint must be greater than 0");
        }

        Ok(())
    }
}

fn validate_limits(scope: &str, limits: &BudgetLimits) -> Result<()> {
    if limits.max_requests_per_minute == 0 {
        bail!("max_requests_per_minute for {scope} must be greater than 0");
    }
    if limits.max_concurrent == 0 {
        bail!("max_concurrent for {scope} must be greater than 0");
    }
    Ok(())
}
