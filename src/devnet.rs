//! In-process development adapters.
//!
//! A full deployment wires the provider against a chain node, a sealing
//! pipeline daemon and a real data transport. For local development and
//! for the integration tests, the implementations below stand in for all
//! of them: a chain with configurable balances and instant publishing, a
//! sealing pipeline that copies pieces into an unsealed-sector directory,
//! and a transport that streams a local file in chunks.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use cid::{multihash::Multihash, Cid};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{mpsc, Notify},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    adapters::{
        chain::{ChainClient, ChainError},
        filter::{DealFilterParams, FilterDecision, FilterError, StorageDealFilter},
        indexer::{AnnounceError, IndexAnnouncer},
        sealing::{SealingError, SealingPipelineApi, SealingPipelineState, SectorAllocation},
        transport::{Transport, TransportError},
    },
    types::{Address, ChainEpoch, ClientDealProposal, DealId, ProviderDealState, TokenAmount},
};

const RAW_MULTICODEC_CODE: u64 = 0x55;
const DAG_CBOR_MULTICODEC_CODE: u64 = 0x71;
const SHA2_256_MULTICODEC_CODE: u64 = 0x12;

/// Transfer kind understood by [`DevTransport`].
pub const DEV_TRANSFER_KIND: &str = "devfile";

fn sha256_cid(codec: u64, data: &[u8]) -> Cid {
    let digest = Sha256::digest(data);
    let multihash = Multihash::wrap(SHA2_256_MULTICODEC_CODE, digest.as_slice())
        .expect("sha256 digests always fit a multihash");
    Cid::new_v1(codec, multihash)
}

struct DevChainState {
    wallet: HashMap<Address, TokenAmount>,
    escrow: HashMap<Address, TokenAmount>,
    next_deal_id: DealId,
    published: HashMap<Cid, DealId>,
}

/// A development chain: balances are whatever the operator says they are,
/// publish messages land instantly (unless confirmations are held back for
/// crash testing) and deal ids are handed out sequentially.
pub struct DevChain {
    state: Mutex<DevChainState>,
    head: AtomicU64,
    hold_confirmations: Mutex<bool>,
    confirmations_released: Notify,
}

impl DevChain {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DevChainState {
                wallet: HashMap::new(),
                escrow: HashMap::new(),
                next_deal_id: 1,
                published: HashMap::new(),
            }),
            head: AtomicU64::new(1),
            hold_confirmations: Mutex::new(false),
            confirmations_released: Notify::new(),
        }
    }

    pub fn set_wallet_balance(&self, address: Address, amount: TokenAmount) {
        self.state
            .lock()
            .expect("dev chain lock is never poisoned")
            .wallet
            .insert(address, amount);
    }

    pub fn set_escrow_available(&self, address: Address, amount: TokenAmount) {
        self.state
            .lock()
            .expect("dev chain lock is never poisoned")
            .escrow
            .insert(address, amount);
    }

    /// While held, [`ChainClient::wait_for_publish`] blocks; publish
    /// messages still get accepted and assigned deal ids.
    pub fn set_hold_confirmations(&self, hold: bool) {
        *self
            .hold_confirmations
            .lock()
            .expect("dev chain lock is never poisoned") = hold;
        if !hold {
            self.confirmations_released.notify_waiters();
        }
    }

    fn confirmations_held(&self) -> bool {
        *self
            .hold_confirmations
            .lock()
            .expect("dev chain lock is never poisoned")
    }
}

impl Default for DevChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainClient for DevChain {
    async fn chain_head(&self) -> Result<ChainEpoch, ChainError> {
        Ok(self.head.fetch_add(1, Ordering::Relaxed))
    }

    async fn wallet_balance(&self, address: &Address) -> Result<TokenAmount, ChainError> {
        let state = self.state.lock().expect("dev chain lock is never poisoned");
        Ok(state.wallet.get(address).copied().unwrap_or(0))
    }

    async fn market_available(&self, address: &Address) -> Result<TokenAmount, ChainError> {
        let state = self.state.lock().expect("dev chain lock is never poisoned");
        Ok(state.escrow.get(address).copied().unwrap_or(0))
    }

    async fn publish_deal(&self, deal: &ClientDealProposal) -> Result<Cid, ChainError> {
        let mut state = self.state.lock().expect("dev chain lock is never poisoned");
        let deal_id = state.next_deal_id;
        state.next_deal_id += 1;

        // The publish message also covers the deal id it assigns, so
        // republishing the same proposal yields a distinct message CID.
        let mut payload = serde_json::to_vec(deal).map_err(|err| ChainError::Rpc(err.to_string()))?;
        payload.extend_from_slice(&deal_id.to_be_bytes());
        let publish_cid = sha256_cid(DAG_CBOR_MULTICODEC_CODE, &payload);

        state.published.insert(publish_cid, deal_id);
        Ok(publish_cid)
    }

    async fn wait_for_publish(&self, publish_cid: &Cid) -> Result<DealId, ChainError> {
        loop {
            // Register for the release notification before checking the
            // flag, so a release in between cannot be missed.
            let released = self.confirmations_released.notified();
            if !self.confirmations_held() {
                let state = self.state.lock().expect("dev chain lock is never poisoned");
                return state
                    .published
                    .get(publish_cid)
                    .copied()
                    .ok_or(ChainError::MessageNotFound(*publish_cid));
            }
            released.await;
        }
    }
}

/// A sealing pipeline that keeps an unsealed-sector directory on disk and
/// a running tally of what passed through it.
pub struct DevSealingPipeline {
    unsealed_dir: PathBuf,
    next_sector: AtomicU64,
    sectors_by_state: Mutex<BTreeMap<String, u64>>,
}

impl DevSealingPipeline {
    pub fn new(unsealed_dir: PathBuf) -> Self {
        Self {
            unsealed_dir,
            next_sector: AtomicU64::new(1),
            sectors_by_state: Mutex::new(BTreeMap::new()),
        }
    }
}

#[async_trait]
impl SealingPipelineApi for DevSealingPipeline {
    async fn get_status(&self) -> Result<SealingPipelineState, SealingError> {
        let sectors_by_state = self
            .sectors_by_state
            .lock()
            .expect("sealing tally lock is never poisoned")
            .clone();
        Ok(SealingPipelineState {
            workers_total: 4,
            workers_free: 4,
            sectors_by_state,
        })
    }

    async fn add_piece(
        &self,
        deal: &ProviderDealState,
        piece_path: &Path,
    ) -> Result<SectorAllocation, SealingError> {
        tokio::fs::create_dir_all(&self.unsealed_dir)
            .await
            .map_err(|err| SealingError::Rpc(err.to_string()))?;

        let sector_number = self.next_sector.fetch_add(1, Ordering::Relaxed);
        let dest = self.unsealed_dir.join(sector_number.to_string());
        tokio::fs::copy(piece_path, &dest)
            .await
            .map_err(|err| SealingError::Rpc(err.to_string()))?;

        *self
            .sectors_by_state
            .lock()
            .expect("sealing tally lock is never poisoned")
            .entry("unsealed".to_string())
            .or_insert(0) += 1;

        Ok(SectorAllocation {
            sector_number,
            offset: 0,
            length: deal.proposal().piece_size,
        })
    }
}

/// Parameters carried by a [`DEV_TRANSFER_KIND`] transfer: where on the
/// local filesystem the deal data lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevTransferParams {
    pub path: PathBuf,
}

impl DevTransferParams {
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("transfer params are always serializable")
    }
}

/// A transport that copies a local file in chunks, reporting progress per
/// chunk. An optional per-chunk delay makes in-flight transfers observable
/// for cancellation testing.
pub struct DevTransport {
    chunk_size: usize,
    chunk_delay: Option<Duration>,
    transferred: Mutex<HashMap<Uuid, u64>>,
}

impl DevTransport {
    pub fn new(chunk_size: usize, chunk_delay: Option<Duration>) -> Self {
        Self {
            chunk_size,
            chunk_delay,
            transferred: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for DevTransport {
    fn default() -> Self {
        Self::new(1 << 20, None)
    }
}

#[async_trait]
impl Transport for DevTransport {
    async fn execute(
        &self,
        deal_uuid: Uuid,
        transfer: &crate::types::Transfer,
        dest: &Path,
        progress: mpsc::UnboundedSender<u64>,
        cancel: CancellationToken,
    ) -> Result<u64, TransportError> {
        if transfer.kind != DEV_TRANSFER_KIND {
            return Err(TransportError::InvalidParams(format!(
                "unsupported transfer kind {:?}",
                transfer.kind
            )));
        }
        let params: DevTransferParams = serde_json::from_slice(&transfer.params)
            .map_err(|err| TransportError::InvalidParams(err.to_string()))?;

        let mut source = tokio::fs::File::open(&params.path).await?;
        let mut sink = tokio::fs::File::create(dest).await?;

        let mut buffer = vec![0u8; self.chunk_size];
        let mut total: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }

            let read = source.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            sink.write_all(&buffer[..read]).await?;

            total += read as u64;
            self.transferred
                .lock()
                .expect("transfer tally lock is never poisoned")
                .insert(deal_uuid, total);
            let _ = progress.send(total);

            if let Some(delay) = self.chunk_delay {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                }
            }
        }
        sink.flush().await?;

        Ok(total)
    }

    fn transferred(&self, deal_uuid: Uuid) -> u64 {
        self.transferred
            .lock()
            .expect("transfer tally lock is never poisoned")
            .get(&deal_uuid)
            .copied()
            .unwrap_or(0)
    }
}

/// An announcer that derives a deterministic advertisement CID per deal.
pub struct DevIndexer;

#[async_trait]
impl IndexAnnouncer for DevIndexer {
    async fn announce_deal(&self, deal: &ProviderDealState) -> Result<Cid, AnnounceError> {
        Ok(sha256_cid(
            RAW_MULTICODEC_CODE,
            deal.deal_uuid.as_bytes(),
        ))
    }
}

/// A filter that takes everything.
pub struct AcceptAllFilter;

#[async_trait]
impl StorageDealFilter for AcceptAllFilter {
    async fn filter(&self, _params: &DealFilterParams) -> Result<FilterDecision, FilterError> {
        Ok(FilterDecision::accept())
    }
}

/// A filter that refuses everything with a fixed reason.
pub struct RejectAllFilter {
    pub reason: String,
}

#[async_trait]
impl StorageDealFilter for RejectAllFilter {
    async fn filter(&self, _params: &DealFilterParams) -> Result<FilterDecision, FilterError> {
        Ok(FilterDecision::reject(self.reason.clone()))
    }
}
