use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use chainsync_control::{
    ChainId, CollaboratorFuture, EventIngester, HeadBlockFetcher, IngestionResult,
};
use futures::FutureExt;
use tokio::sync::watch;

/// In-process stand-in for chain providers: serves scripted heads and ingests
/// windows, with knobs for failures, latency, and holding calls in flight.
#[derive(Clone)]
pub struct ScriptedChains {
    inner: Arc<Inner>,
}

struct Inner {
    heads: Mutex<HashMap<ChainId, u64>>,
    one_shot_failures: Mutex<HashMap<ChainId, VecDeque<anyhow::Error>>>,
    broken: Mutex<HashSet<ChainId>>,
    calls: Mutex<Vec<(ChainId, u64, u64)>>,
    latency: Mutex<Duration>,
    gate: watch::Sender<bool>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedChains {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                heads: Mutex::new(HashMap::new()),
                one_shot_failures: Mutex::new(HashMap::new()),
                broken: Mutex::new(HashSet::new()),
                calls: Mutex::new(Vec::new()),
                latency: Mutex::new(Duration::ZERO),
                gate,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }),
        }
    }

    pub fn set_head(&self, chain: &str, head: u64) {
        self.inner
            .heads
            .lock()
            .unwrap()
            .insert(ChainId::new(chain), head);
    }

    /// The next ingestion on `chain` fails with `error`.
    pub fn fail_next(&self, chain: &str, error: anyhow::Error) {
        self.inner
            .one_shot_failures
            .lock()
            .unwrap()
            .entry(ChainId::new(chain))
            .or_default()
            .push_back(error);
    }

    /// Every ingestion on `chain` fails until [`Self::heal`] is called.
    pub fn break_chain(&self, chain: &str) {
        self.inner.broken.lock().unwrap().insert(ChainId::new(chain));
    }

    pub fn heal(&self, chain: &str) {
        self.inner.broken.lock().unwrap().remove(&ChainId::new(chain));
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.lock().unwrap() = latency;
    }

    /// Holds every ingestion call until [`Self::open_gate`].
    pub fn close_gate(&self) {
        self.inner.gate.send_replace(false);
    }

    pub fn open_gate(&self) {
        self.inner.gate.send_replace(true);
    }

    pub fn calls(&self) -> Vec<(ChainId, u64, u64)> {
        self.inner.calls.lock().unwrap().clone()
    }

    pub fn windows_for(&self, chain: &str) -> Vec<(u64, u64)> {
        let chain = ChainId::new(chain);
        self.calls()
            .into_iter()
            .filter(|(called, _, _)| *called == chain)
            .map(|(_, from, to)| (from, to))
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    fn scripted_outcome(&self, chain: &ChainId) -> Option<anyhow::Error> {
        if let Some(error) = self
            .inner
            .one_shot_failures
            .lock()
            .unwrap()
            .get_mut(chain)
            .and_then(VecDeque::pop_front)
        {
            return Some(error);
        }
        if self.inner.broken.lock().unwrap().contains(chain) {
            return Some(anyhow!("connection reset by peer while fetching logs for {chain}"));
        }
        None
    }
}

impl EventIngester for ScriptedChains {
    fn ingest(
        &self,
        chain: ChainId,
        from_block: u64,
        to_block: u64,
    ) -> CollaboratorFuture<IngestionResult> {
        self.inner
            .calls
            .lock()
            .unwrap()
            .push((chain.clone(), from_block, to_block));
        let failure = self.scripted_outcome(&chain);
        let latency = *self.inner.latency.lock().unwrap();
        let mut gate = self.inner.gate.subscribe();
        let inner = self.inner.clone();

        async move {
            let now_in_flight = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            inner.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

            let _ = gate.wait_for(|open| *open).await;
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }

            inner.in_flight.fetch_sub(1, Ordering::SeqCst);
            match failure {
                Some(error) => Err(error),
                None => {
                    let blocks = to_block - from_block + 1;
                    Ok(IngestionResult {
                        events_found: blocks,
                        events_ingested: blocks,
                    })
                }
            }
        }
        .boxed()
    }
}

impl HeadBlockFetcher for ScriptedChains {
    fn fetch_head(&self, chain: ChainId) -> CollaboratorFuture<u64> {
        let head = self.inner.heads.lock().unwrap().get(&chain).copied();
        async move { head.ok_or_else(|| anyhow!("no head block scripted for {chain}")) }.boxed()
    }
}
