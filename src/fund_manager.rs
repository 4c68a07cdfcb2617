//! Reservations over the provider's on-chain funds.
//!
//! Accepting a deal requires money for the publish message (paid from the
//! publish wallet) and for provider collateral (locked from market escrow).
//! Both are tagged per deal so concurrent acceptances cannot promise the
//! same tokens twice. The ledger lives in memory; on restart it is rebuilt
//! from the deals database before any deal runs.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use uuid::Uuid;

use crate::{
    adapters::chain::{ChainClient, ChainError},
    types::{Address, DealProposal, TokenAmount},
};

#[derive(Debug, thiserror::Error)]
pub enum FundManagerError {
    #[error("insufficient funds for {leg}: required {required}, available {available}")]
    InsufficientFunds {
        leg: &'static str,
        required: TokenAmount,
        available: TokenAmount,
    },

    #[error("no funds tagged for deal {0}")]
    NotFound(Uuid),

    #[error(transparent)]
    Chain(#[from] ChainError),
}

#[derive(Debug, Clone)]
pub struct FundManagerConfig {
    /// Wallet paying for publish messages.
    pub publish_wallet: Address,
    /// Address whose market escrow backs deal collateral.
    pub collateral_wallet: Address,
    /// Amount reserved per deal for its share of the publish message.
    pub publish_fee_per_deal: TokenAmount,
}

/// Funds tagged for a single deal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaggedFunds {
    pub collateral: TokenAmount,
    pub publish: TokenAmount,
}

/// What a successful tag reserved, plus the running totals for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagFundsResponse {
    pub publish: TokenAmount,
    pub collateral: TokenAmount,
    pub total_publish: TokenAmount,
    pub total_collateral: TokenAmount,
    pub available_publish: TokenAmount,
    pub available_collateral: TokenAmount,
}

pub struct FundManager {
    cfg: FundManagerConfig,
    chain: Arc<dyn ChainClient>,
    tagged: Mutex<HashMap<Uuid, TaggedFunds>>,
}

impl FundManager {
    pub fn new(cfg: FundManagerConfig, chain: Arc<dyn ChainClient>) -> Self {
        Self {
            cfg,
            chain,
            tagged: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve the publish fee and collateral the deal needs.
    ///
    /// Checks the chain balances minus what is already tagged and either
    /// records the reservation or fails with
    /// [`FundManagerError::InsufficientFunds`]. Balance probe failures come
    /// back as [`FundManagerError::Chain`].
    pub async fn tag_funds(
        &self,
        deal_uuid: Uuid,
        proposal: &DealProposal,
    ) -> Result<TagFundsResponse, FundManagerError> {
        let publish = self.cfg.publish_fee_per_deal;
        let collateral = proposal.provider_collateral;

        let wallet_balance = self.chain.wallet_balance(&self.cfg.publish_wallet).await?;
        let escrow_available = self
            .chain
            .market_available(&self.cfg.collateral_wallet)
            .await?;

        let mut tagged = self.tagged.lock().expect("fund ledger lock is never poisoned");

        // Already reserved for this deal; tagging twice must neither fail
        // the balance check against its own reservation nor double-count
        // the totals.
        if let Some(existing) = tagged.get(&deal_uuid).copied() {
            let totals = Self::totals_locked(&tagged);
            return Ok(TagFundsResponse {
                publish: existing.publish,
                collateral: existing.collateral,
                total_publish: totals.publish,
                total_collateral: totals.collateral,
                available_publish: wallet_balance.saturating_sub(totals.publish),
                available_collateral: escrow_available.saturating_sub(totals.collateral),
            });
        }

        let totals = Self::totals_locked(&tagged);

        let available_publish = wallet_balance.saturating_sub(totals.publish);
        if publish > available_publish {
            return Err(FundManagerError::InsufficientFunds {
                leg: "publish message",
                required: publish,
                available: available_publish,
            });
        }

        let available_collateral = escrow_available.saturating_sub(totals.collateral);
        if collateral > available_collateral {
            return Err(FundManagerError::InsufficientFunds {
                leg: "collateral",
                required: collateral,
                available: available_collateral,
            });
        }

        tagged.insert(
            deal_uuid,
            TaggedFunds {
                collateral,
                publish,
            },
        );

        Ok(TagFundsResponse {
            publish,
            collateral,
            total_publish: totals.publish + publish,
            total_collateral: totals.collateral + collateral,
            available_publish: available_publish - publish,
            available_collateral: available_collateral - collateral,
        })
    }

    /// Release everything tagged for the deal.
    ///
    /// Returns [`FundManagerError::NotFound`] when nothing is tagged; the
    /// caller layer treats that as a successful no-op.
    pub fn untag_funds(&self, deal_uuid: Uuid) -> Result<TaggedFunds, FundManagerError> {
        self.tagged
            .lock()
            .expect("fund ledger lock is never poisoned")
            .remove(&deal_uuid)
            .ok_or(FundManagerError::NotFound(deal_uuid))
    }

    /// Re-establish the deal's reservation when rebuilding the ledger on
    /// startup. Skips the balance checks: the reservation existed before
    /// the restart and must exist after it, whatever the balances say now.
    pub fn restore_tag(&self, deal_uuid: Uuid, proposal: &DealProposal) -> TaggedFunds {
        let funds = TaggedFunds {
            collateral: proposal.provider_collateral,
            publish: self.cfg.publish_fee_per_deal,
        };
        self.tagged
            .lock()
            .expect("fund ledger lock is never poisoned")
            .insert(deal_uuid, funds);
        funds
    }

    /// Sum of everything currently tagged, across all deals.
    pub fn total_tagged(&self) -> TaggedFunds {
        let tagged = self.tagged.lock().expect("fund ledger lock is never poisoned");
        Self::totals_locked(&tagged)
    }

    fn totals_locked(tagged: &HashMap<Uuid, TaggedFunds>) -> TaggedFunds {
        tagged.values().fold(TaggedFunds::default(), |acc, funds| {
            TaggedFunds {
                collateral: acc.collateral + funds.collateral,
                publish: acc.publish + funds.publish,
            }
        })
    }
}
