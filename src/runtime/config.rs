use crate::budget::config::{
    DEFAULT_BASE_BACKOFF, DEFAULT_CONCURRENCY_RETRY_HINT, DEFAULT_ERROR_THRESHOLD,
    DEFAULT_MAX_BACKOFF, DEFAULT_MAX_CONCURRENT, DEFAULT_MAX_REQUESTS_PER_MINUTE,
};
use crate::budget::{BudgetConfig, BudgetLimits};
use crate::runtime::telemetry;
use crate::sync::window::{DEFAULT_CONFIRMATION_LAG, DEFAULT_MAX_WINDOW_SIZE};
use crate::sync::{ChainId, WindowPolicy};
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_MAX_CONCURRENT_CHAINS: usize = 3;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;
const DEFAULT_RETRY_INTERVAL_SECS: u64 = 60;
const DEFAULT_RETRY_BATCH_LIMIT: usize = 10;
const DEFAULT_LEASE_TIMEOUT_SECS: u64 = 10 * 60;

/// Per-chain deviations from the shared defaults, for providers that need
/// tighter limits or a deeper reorg margin.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChainOverrides {
    pub max_requests_per_minute: Option<u32>,
    pub max_concurrent_requests: Option<u32>,
    pub confirmation_lag: Option<u64>,
}

/// Runtime configuration for the ingestion control plane.
///
/// Instances are only produced by [`IngestionConfigBuilder::build`], which
/// normalizes chain identifiers and validates every value first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionConfig {
    chains: Vec<ChainId>,
    start_blocks: HashMap<ChainId, u64>,
    overrides: HashMap<ChainId, ChainOverrides>,
    confirmation_lag: u64,
    max_window_size: u64,
    max_concurrent_chains: usize,
    max_requests_per_minute: u32,
    max_concurrent_requests: u32,
    base_backoff: Duration,
    max_backoff: Duration,
    error_threshold: u32,
    concurrency_retry_hint: Duration,
    poll_interval: Duration,
    retry_interval: Duration,
    retry_batch_limit: usize,
    lease_timeout: Duration,
    metrics_interval: Duration,
}

impl IngestionConfig {
    pub fn builder() -> IngestionConfigBuilder {
        IngestionConfigBuilder::default()
    }

    /// Chains driven by the scheduler, normalized and in configuration order.
    pub fn chains(&self) -> &[ChainId] {
        &self.chains
    }

    /// Initial `last_synced_block` for a chain that has no stored state yet.
    pub fn start_block(&self, chain: &ChainId) -> u64 {
        self.start_blocks.get(chain).copied().unwrap_or(0)
    }

    pub fn start_blocks(&self) -> &HashMap<ChainId, u64> {
        &self.start_blocks
    }

    pub fn max_window_size(&self) -> u64 {
        self.max_window_size
    }

    /// Upper bound on chains with a cycle in flight at once.
    pub fn max_concurrent_chains(&self) -> usize {
        self.max_concurrent_chains
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    pub fn retry_batch_limit(&self) -> usize {
        self.retry_batch_limit
    }

    /// Age after which an IN_PROGRESS lease is considered abandoned.
    pub fn lease_timeout(&self) -> Duration {
        self.lease_timeout
    }

    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    pub fn window_policy(&self, chain: &ChainId) -> WindowPolicy {
        WindowPolicy {
            confirmation_lag: self
                .overrides
                .get(chain)
                .and_then(|overrides| overrides.confirmation_lag)
                .unwrap_or(self.confirmation_lag),
            max_window_size: self.max_window_size,
        }
    }

    pub fn budget_config(&self) -> BudgetConfig {
        let default_limits = BudgetLimits {
            max_requests_per_minute: self.max_requests_per_minute,
            max_concurrent: self.max_concurrent_requests,
        };

        let overrides = self
            .overrides
            .iter()
            .filter(|(_, chain_overrides)| {
                chain_overrides.max_requests_per_minute.is_some()
                    || chain_overrides.max_concurrent_requests.is_some()
            })
            .map(|(chain, chain_overrides)| {
                let limits = BudgetLimits {
                    max_requests_per_minute: chain_overrides
                        .max_requests_per_minute
                        .unwrap_or(default_limits.max_requests_per_minute),
                    max_concurrent: chain_overrides
                        .max_concurrent_requests
                        .unwrap_or(default_limits.max_concurrent),
                };
                (chain.clone(), limits)
            })
            .collect();

        BudgetConfig {
            default_limits,
            overrides,
            base_backoff: self.base_backoff,
            max_backoff: self.max_backoff,
            error_threshold: self.error_threshold,
            concurrency_retry_hint: self.concurrency_retry_hint,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chains.is_empty() {
            bail!("at least one chain must be configured");
        }

        if let Some(chain) = self.chains.iter().find(|chain| chain.is_empty()) {
            bail!("chain identifiers cannot be empty (got {:?})", chain.as_str());
        }

        for chain in self.start_blocks.keys().chain(self.overrides.keys()) {
            if !self.chains.contains(chain) {
                bail!("chain {chain} has settings but is not in the configured chain list");
            }
        }

        if self.max_window_size == 0 {
            bail!("max_window_size must be greater than 0");
        }

        if self.max_concurrent_chains == 0 {
            bail!("max_concurrent_chains must be greater than 0");
        }

        if self.poll_interval.is_zero() {
            bail!("poll_interval must be greater than 0");
        }

        if self.retry_interval.is_zero() {
            bail!("retry_interval must be greater than 0");
        }

        if self.retry_batch_limit == 0 {
            bail!("retry_batch_limit must be greater than 0");
        }

        if self.lease_timeout.is_zero() {
            bail!("lease_timeout must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        self.budget_config().validate()
    }
}

#[derive(Debug, Default, Clone)]
pub struct IngestionConfigBuilder {
    chains: Vec<ChainId>,
    start_blocks: HashMap<ChainId, u64>,
    overrides: HashMap<ChainId, ChainOverrides>,
    confirmation_lag: Option<u64>,
    max_window_size: Option<u64>,
    max_concurrent_chains: Option<usize>,
    max_requests_per_minute: Option<u32>,
    max_concurrent_requests: Option<u32>,
    base_backoff: Option<Duration>,
    max_backoff: Option<Duration>,
    error_threshold: Option<u32>,
    concurrency_retry_hint: Option<Duration>,
    poll_interval: Option<Duration>,
    retry_interval: Option<Duration>,
    retry_batch_limit: Option<usize>,
    lease_timeout: Option<Duration>,
    metrics_interval: Option<Duration>,
}

impl IngestionConfigBuilder {
    /// Seeds a builder from `CHAINSYNC_*` environment variables. Unset variables
    /// keep their defaults; malformed ones are reported by name.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut builder = Self::default();

        if let Some(chains) = lookup("CHAINSYNC_CHAINS") {
            builder = builder.chains(
                chains
                    .split(',')
                    .map(str::trim)
                    .filter(|chain| !chain.is_empty()),
            );
        }

        if let Some(raw) = lookup("CHAINSYNC_START_BLOCKS") {
            for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                let (chain, block) = entry.split_once(':').with_context(|| {
                    format!("CHAINSYNC_START_BLOCKS entry {entry:?} must look like CHAIN:BLOCK")
                })?;
                let block = block.trim().parse::<u64>().with_context(|| {
                    format!("CHAINSYNC_START_BLOCKS entry {entry:?} has an invalid block number")
                })?;
                builder = builder.start_block(chain, block);
            }
        }

        builder.confirmation_lag = parse_var(&lookup, "CHAINSYNC_CONFIRMATION_LAG")?;
        builder.max_window_size = parse_var(&lookup, "CHAINSYNC_MAX_WINDOW_SIZE")?;
        builder.max_concurrent_chains = parse_var(&lookup, "CHAINSYNC_MAX_CONCURRENT_CHAINS")?;
        builder.max_requests_per_minute = parse_var(&lookup, "CHAINSYNC_MAX_RPM")?;
        builder.max_concurrent_requests =
            parse_var(&lookup, "CHAINSYNC_MAX_CONCURRENT_REQUESTS")?;
        builder.error_threshold = parse_var(&lookup, "CHAINSYNC_ERROR_THRESHOLD")?;
        builder.poll_interval =
            parse_var::<u64>(&lookup, "CHAINSYNC_POLL_INTERVAL_SECS")?.map(Duration::from_secs);

        Ok(builder)
    }

    pub fn chain(mut self, chain: impl Into<ChainId>) -> Self {
        let chain = chain.into();
        if !self.chains.contains(&chain) {
            self.chains.push(chain);
        }
        self
    }

    pub fn chains<I, C>(mut self, chains: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<ChainId>,
    {
        for chain in chains {
            self = self.chain(chain);
        }
        self
    }

    pub fn start_block(mut self, chain: impl Into<ChainId>, block: u64) -> Self {
        self.start_blocks.insert(chain.into(), block);
        self
    }

    pub fn chain_overrides(mut self, chain: impl Into<ChainId>, overrides: ChainOverrides) -> Self {
        self.overrides.insert(chain.into(), overrides);
        self
    }

    pub fn confirmation_lag(mut self, blocks: u64) -> Self {
        self.confirmation_lag = Some(blocks);
        self
    }

    pub fn max_window_size(mut self, blocks: u64) -> Self {
        self.max_window_size = Some(blocks);
        self
    }

    pub fn max_concurrent_chains(mut self, chains: usize) -> Self {
        self.max_concurrent_chains = Some(chains);
        self
    }

    pub fn max_requests_per_minute(mut self, requests: u32) -> Self {
        self.max_requests_per_minute = Some(requests);
        self
    }

    pub fn max_concurrent_requests(mut self, requests: u32) -> Self {
        self.max_concurrent_requests = Some(requests);
        self
    }

    pub fn base_backoff(mut self, backoff: Duration) -> Self {
        self.base_backoff = Some(backoff);
        self
    }

    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = Some(backoff);
        self
    }

    pub fn error_threshold(mut self, errors: u32) -> Self {
        self.error_threshold = Some(errors);
        self
    }

    pub fn concurrency_retry_hint(mut self, hint: Duration) -> Self {
        self.concurrency_retry_hint = Some(hint);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = Some(interval);
        self
    }

    pub fn retry_batch_limit(mut self, limit: usize) -> Self {
        self.retry_batch_limit = Some(limit);
        self
    }

    pub fn lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = Some(timeout);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<IngestionConfig> {
        let config = IngestionConfig {
            chains: self.chains,
            start_blocks: self.start_blocks,
            overrides: self.overrides,
            confirmation_lag: self.confirmation_lag.unwrap_or(DEFAULT_CONFIRMATION_LAG),
            max_window_size: self.max_window_size.unwrap_or(DEFAULT_MAX_WINDOW_SIZE),
            max_concurrent_chains: self
                .max_concurrent_chains
                .unwrap_or(DEFAULT_MAX_CONCURRENT_CHAINS),
            max_requests_per_minute: self
                .max_requests_per_minute
                .unwrap_or(DEFAULT_MAX_REQUESTS_PER_MINUTE),
            max_concurrent_requests: self
                .max_concurrent_requests
                .unwrap_or(DEFAULT_MAX_CONCURRENT),
            base_backoff: self.base_backoff.unwrap_or(DEFAULT_BASE_BACKOFF),
            max_backoff: self.max_backoff.unwrap_or(DEFAULT_MAX_BACKOFF),
            error_threshold: self.error_threshold.unwrap_or(DEFAULT_ERROR_THRESHOLD),
            concurrency_retry_hint: self
                .concurrency_retry_hint
                .unwrap_or(DEFAULT_CONCURRENCY_RETRY_HINT),
            poll_interval: self
                .poll_interval
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS)),
            retry_interval: self
                .retry_interval
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_RETRY_INTERVAL_SECS)),
            retry_batch_limit: self.retry_batch_limit.unwrap_or(DEFAULT_RETRY_BATCH_LIMIT),
            lease_timeout: self
                .lease_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_LEASE_TIMEOUT_SECS)),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
        };

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("{key} has an invalid value {raw:?}")),
    }
}
