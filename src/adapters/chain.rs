//! Chain node operations consumed by the deal core.

use async_trait::async_trait;
use cid::Cid;

use crate::types::{Address, ChainEpoch, ClientDealProposal, DealId, TokenAmount};

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// The node could not be reached or answered with a transient fault.
    #[error("chain rpc: {0}")]
    Rpc(String),

    /// The chain refused the publish message; retrying cannot help.
    #[error("publish rejected: {0}")]
    PublishRejected(String),

    #[error("message {0} not found on chain")]
    MessageNotFound(Cid),
}

impl ChainError {
    /// Whether a retry of the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Rpc(_) | ChainError::MessageNotFound(_))
    }
}

/// Client for the chain node backing the provider.
///
/// Publish submission is expected to batch deals behind this interface; the
/// core only sees the publish message CID.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn chain_head(&self) -> Result<ChainEpoch, ChainError>;

    /// Balance of the wallet used to pay for publish messages.
    async fn wallet_balance(&self, address: &Address) -> Result<TokenAmount, ChainError>;

    /// Unlocked market escrow balance available for deal collateral.
    async fn market_available(&self, address: &Address) -> Result<TokenAmount, ChainError>;

    /// Submit the signed deal for publishing, returning the CID of the
    /// publish message that carries it.
    async fn publish_deal(&self, deal: &ClientDealProposal) -> Result<Cid, ChainError>;

    /// Wait until the publish message has landed on-chain and return the
    /// deal id it assigned.
    async fn wait_for_publish(&self, publish_cid: &Cid) -> Result<DealId, ChainError>;
}
