use crate::replay::IngestionResult;
use crate::sync::ChainId;
use anyhow::Result;
use core::future::Future;
use futures::future::BoxFuture;
use futures::FutureExt;

pub type CollaboratorFuture<T> = BoxFuture<'static, Result<T>>;

/// Fetches and persists the events of one inclusive block window.
///
/// Errors should carry an [`crate::budget::RpcFault`] when the failure kind is
/// known; anything else is classified from its message.
pub trait EventIngester: Send + Sync {
    fn ingest(
        &self,
        chain: ChainId,
        from_block: u64,
        to_block: u64,
    ) -> CollaboratorFuture<IngestionResult>;
}

/// Reports the current head block of a chain's provider.
pub trait HeadBlockFetcher: Send + Sync {
    fn fetch_head(&self, chain: ChainId) -> CollaboratorFuture<u64>;
}

impl<F, Fut> EventIngester for F
where
    F: Fn(ChainId, u64, u64) -> Fut + Send + Sync,
    Fut: Future<Output = Result<IngestionResult>> + Send + 'static,
{
    fn ingest(
        &self,
        chain: ChainId,
        from_block: u64,
        to_block: u64,
    ) -> CollaboratorFuture<IngestionResult> {
        self(chain, from_block, to_block).boxed()
    }
}

impl<F, Fut> HeadBlockFetcher for F
where
    F: Fn(ChainId) -> Fut + Send + Sync,
    Fut: Future<Output = Result<u64>> + Send + 'static,
{
    fn fetch_head(&self, chain: ChainId) -> CollaboratorFuture<u64> {
        self(chain).boxed()
    }
}
