//! Core data model for storage deals.

use std::{fmt, ops::Deref, path::PathBuf};

use chrono::{DateTime, Utc};
use cid::{multihash::Multihash, Cid};
use serde::{Deserialize, Serialize};
use sha2::Digest;
use uuid::Uuid;

use crate::adapters::sealing::SectorAllocation;

/// Reference: <https://github.com/multiformats/multicodec/blob/master/table.csv>
const SHA2_256_MULTICODEC_CODE: u64 = 0x12;
const JSON_MULTICODEC_CODE: u64 = 0x0200;

/// Chain-native token amount, in the smallest denomination.
pub type TokenAmount = u128;

/// Height of the chain at which something happens.
pub type ChainEpoch = u64;

/// On-chain identifier assigned to a deal once its publish message lands.
pub type DealId = u64;

#[derive(Debug, thiserror::Error)]
pub enum ProposalError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Multihash(#[from] cid::multihash::Error),
}

/// An on-chain actor address.
///
/// Kept as a wrapper to `String`; validation belongs to the chain client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(String);

impl Deref for Address {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<String> for Address {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable stage marker of a deal's lifecycle. A deal only ever advances
/// forward through these, one at a time, and `Complete` is terminal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Checkpoint {
    Accepted,
    Transferred,
    Published,
    PublishConfirmed,
    AddedPiece,
    IndexedAndAnnounced,
    Complete,
}

impl Checkpoint {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Checkpoint::Complete)
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Checkpoint::Accepted => "Accepted",
            Checkpoint::Transferred => "Transferred",
            Checkpoint::Published => "Published",
            Checkpoint::PublishConfirmed => "PublishConfirmed",
            Checkpoint::AddedPiece => "AddedPiece",
            Checkpoint::IndexedAndAnnounced => "IndexedAndAnnounced",
            Checkpoint::Complete => "Complete",
        };
        f.write_str(s)
    }
}

/// The deal terms proposed by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealProposal {
    #[serde(deserialize_with = "deserialize_string_to_cid")]
    #[serde(serialize_with = "serialize_cid_to_string")]
    pub piece_cid: Cid,
    /// Padded piece size in bytes.
    pub piece_size: u64,
    pub verified_deal: bool,
    pub client: Address,
    pub provider: Address,
    pub label: String,
    pub start_epoch: ChainEpoch,
    pub end_epoch: ChainEpoch,
    pub storage_price_per_epoch: TokenAmount,
    pub provider_collateral: TokenAmount,
    pub client_collateral: TokenAmount,
}

/// A [`DealProposal`] together with the client's signature over it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDealProposal {
    pub proposal: DealProposal,
    /// Opaque signature bytes; verification is the chain's concern.
    pub client_signature: Vec<u8>,
}

impl ClientDealProposal {
    /// Get the CID of this signed proposal, as serialized into JSON.
    ///
    /// This is the deduplication key for deal acceptance: two proposals with
    /// the same CID are the same proposal, whatever UUIDs they arrive under.
    pub fn signed_proposal_cid(&self) -> Result<Cid, ProposalError> {
        let encoded = serde_json::to_string(self)?;
        let digest = sha2::Sha256::digest(encoded.as_bytes());
        let multihash = Multihash::wrap(SHA2_256_MULTICODEC_CODE, digest.as_slice())?;
        Ok(Cid::new_v1(JSON_MULTICODEC_CODE, multihash))
    }
}

/// How the deal data gets to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    /// Transfer protocol tag, e.g. `"http"`.
    pub kind: String,
    /// Protocol-specific parameters, opaque to the core.
    pub params: Vec<u8>,
    /// Advertised size of the data to be transferred, in bytes.
    pub size: u64,
    /// Client-chosen identifier for the transfer, if any.
    pub client_id: Option<String>,
}

/// Parameters of a deal proposal as submitted by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealParams {
    pub deal_uuid: Uuid,
    pub is_offline: bool,
    pub client_deal_proposal: ClientDealProposal,
    pub client_peer_id: String,
    pub transfer: Transfer,
}

/// The provider's answer to a deal proposal.
///
/// `accepted` means the deal is durably persisted, not that it completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealRejectionInfo {
    pub accepted: bool,
    pub reason: String,
}

impl DealRejectionInfo {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            reason: String::new(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: reason.into(),
        }
    }
}

/// The full state of a deal as owned by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDealState {
    pub deal_uuid: Uuid,
    pub client_deal_proposal: ClientDealProposal,
    pub client_peer_id: String,
    pub is_offline: bool,
    pub transfer: Transfer,

    pub checkpoint: Checkpoint,
    pub checkpoint_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,

    pub nbytes_received: u64,
    pub inbound_file_path: Option<PathBuf>,

    pub chain_deal_id: Option<DealId>,
    #[serde(default)]
    #[serde(deserialize_with = "deserialize_string_to_optional_cid")]
    #[serde(serialize_with = "serialize_optional_cid_to_string")]
    pub publish_cid: Option<Cid>,
    pub sector: Option<SectorAllocation>,

    /// Reason the deal reached a terminal state unsuccessfully.
    /// Empty on live deals and on successful completion.
    pub err: String,
}

impl ProviderDealState {
    pub fn new(params: DealParams) -> Self {
        let now = Utc::now();
        Self {
            deal_uuid: params.deal_uuid,
            client_deal_proposal: params.client_deal_proposal,
            client_peer_id: params.client_peer_id,
            is_offline: params.is_offline,
            transfer: params.transfer,
            checkpoint: Checkpoint::Accepted,
            checkpoint_at: now,
            created_at: now,
            nbytes_received: 0,
            inbound_file_path: None,
            chain_deal_id: None,
            publish_cid: None,
            sector: None,
            err: String::new(),
        }
    }

    pub fn proposal(&self) -> &DealProposal {
        &self.client_deal_proposal.proposal
    }

    pub fn signed_proposal_cid(&self) -> Result<Cid, ProposalError> {
        self.client_deal_proposal.signed_proposal_cid()
    }

    pub fn is_complete(&self) -> bool {
        self.checkpoint.is_terminal()
    }

    /// The wire form of this deal, handed to the acceptance filter.
    pub fn params(&self) -> DealParams {
        DealParams {
            deal_uuid: self.deal_uuid,
            is_offline: self.is_offline,
            client_deal_proposal: self.client_deal_proposal.clone(),
            client_peer_id: self.client_peer_id.clone(),
            transfer: self.transfer.clone(),
        }
    }
}

// The CID has some issues that require a workaround for strings.
// For more details, see: <https://github.com/multiformats/rust-cid/issues/162>

pub(crate) fn deserialize_string_to_cid<'de, D>(deserializer: D) -> Result<Cid, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let cid = Cid::try_from(s.as_str()).map_err(|e| {
        serde::de::Error::custom(format!(
            "failed to parse CID, check that the input is a valid CID: {e:?}"
        ))
    })?;
    Ok(cid)
}

pub(crate) fn serialize_cid_to_string<S>(cid: &Cid, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(cid.to_string().as_str())
}

pub(crate) fn deserialize_string_to_optional_cid<'de, D>(
    deserializer: D,
) -> Result<Option<Cid>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?;
    s.map(|s| {
        Cid::try_from(s.as_str()).map_err(|e| {
            serde::de::Error::custom(format!(
                "failed to parse CID, check that the input is a valid CID: {e:?}"
            ))
        })
    })
    .transpose()
}

pub(crate) fn serialize_optional_cid_to_string<S>(
    cid: &Option<Cid>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match cid {
        Some(cid) => serializer.serialize_some(cid.to_string().as_str()),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn dummy_proposal() -> ClientDealProposal {
        ClientDealProposal {
            proposal: DealProposal {
                piece_cid: crate::commp::commitment_to_cid([7u8; 32]).unwrap(),
                piece_size: 2048,
                verified_deal: false,
                client: "t0100".into(),
                provider: "t0101".into(),
                label: "a deal".to_string(),
                start_epoch: 10,
                end_epoch: 100,
                storage_price_per_epoch: 1,
                provider_collateral: 100,
                client_collateral: 0,
            },
            client_signature: vec![1, 2, 3],
        }
    }

    #[test]
    fn signed_proposal_cid_is_stable() {
        let proposal = dummy_proposal();
        let first = proposal.signed_proposal_cid().unwrap();
        let second = proposal.signed_proposal_cid().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn signed_proposal_cid_depends_on_signature() {
        let proposal = dummy_proposal();
        let mut resigned = proposal.clone();
        resigned.client_signature = vec![4, 5, 6];
        assert_ne!(
            proposal.signed_proposal_cid().unwrap(),
            resigned.signed_proposal_cid().unwrap()
        );
    }

    #[test]
    fn checkpoints_are_ordered() {
        assert!(Checkpoint::Accepted < Checkpoint::Transferred);
        assert!(Checkpoint::Published < Checkpoint::PublishConfirmed);
        assert!(Checkpoint::IndexedAndAnnounced < Checkpoint::Complete);
        assert!(Checkpoint::Complete.is_terminal());
        assert!(!Checkpoint::AddedPiece.is_terminal());
    }

    #[test]
    fn deal_state_roundtrips_through_json() {
        let mut deal = ProviderDealState::new(DealParams {
            deal_uuid: Uuid::new_v4(),
            is_offline: false,
            client_deal_proposal: dummy_proposal(),
            client_peer_id: "12D3KooWDev".to_string(),
            transfer: Transfer {
                kind: "http".to_string(),
                params: b"{}".to_vec(),
                size: 2000,
                client_id: None,
            },
        });
        deal.publish_cid = Some(crate::commp::commitment_to_cid([9u8; 32]).unwrap());

        let encoded = serde_json::to_vec(&deal).unwrap();
        let decoded: ProviderDealState = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(deal, decoded);
    }
}
