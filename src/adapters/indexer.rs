//! Index provider / retrieval announcement interface.

use async_trait::async_trait;
use cid::Cid;

use crate::types::ProviderDealState;

#[derive(Debug, thiserror::Error)]
pub enum AnnounceError {
    #[error("announce failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait IndexAnnouncer: Send + Sync {
    /// Register the deal with the indexer and announce it for retrieval.
    /// Returns the CID of the advertisement.
    async fn announce_deal(&self, deal: &ProviderDealState) -> Result<Cid, AnnounceError>;
}
