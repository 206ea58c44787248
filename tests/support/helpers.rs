use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Result};
use chainsync_control::{
    ChainId, Clock, IngestionConfigBuilder, IngestionOrchestrator, MemoryStore,
};
use once_cell::sync::Lazy;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

/// Builds an orchestrator over a fresh in-memory store.
pub async fn memory_orchestrator(
    config: IngestionConfigBuilder,
    clock: Arc<dyn Clock>,
) -> Result<Arc<IngestionOrchestrator>> {
    let orchestrator = Arc::new(IngestionOrchestrator::with_store(
        config.build()?,
        Arc::new(MemoryStore::new()),
        clock,
    ));
    orchestrator.initialize_ingestion(None).await?;
    Ok(orchestrator)
}

pub async fn synced_block(orchestrator: &IngestionOrchestrator, chain: &ChainId) -> u64 {
    orchestrator
        .get_chain_state(chain)
        .await
        .ok()
        .flatten()
        .map(|state| state.last_synced_block)
        .unwrap_or_default()
}

/// Polls `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    loop {
        if check().await {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!("condition not reached within {:?}", timeout);
        }
        sleep(Duration::from_millis(10)).await;
    }
}

pub fn temp_snapshot_path(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    std::env::temp_dir().join(format!(
        "chainsync-it-{}-{nanos}-{name}.json",
        std::process::id()
    ))
}

/// Asserts that `windows` tile `[first, last]` without gaps or overlaps.
pub fn assert_is_contiguous(windows: &[(u64, u64)], first: u64, last: u64) {
    let mut expected = first;
    for &(from, to) in windows {
        assert_eq!(from, expected, "window {from}-{to} leaves a gap or overlap");
        assert!(to >= from, "window {from}-{to} is inverted");
        expected = to + 1;
    }
    assert_eq!(expected, last + 1, "windows stop before block {last}");
}
