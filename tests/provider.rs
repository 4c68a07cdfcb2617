//! End-to-end tests driving the provider through whole deal lifecycles
//! with the in-process development adapters.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use rand::RngCore;
use storage_market::{
    commp,
    db::DealsDB,
    devnet::{
        AcceptAllFilter, DevChain, DevIndexer, DevSealingPipeline, DevTransferParams,
        DevTransport, DEV_TRANSFER_KIND,
    },
    fund_manager::FundManagerConfig,
    handler::Subscription,
    provider::{Provider, ProviderDeps, ProviderError},
    storage_manager::StorageManagerConfig,
    types::{
        Address, Checkpoint, ClientDealProposal, DealParams, DealProposal, ProviderDealState,
        TokenAmount, Transfer,
    },
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const PUBLISH_FEE: TokenAmount = 1_000;
const COLLATERAL: TokenAmount = 10_000;
const PROVIDER_WALLET: &str = "t01000";

const RECV_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct HarnessOptions {
    wallet_funds: TokenAmount,
    escrow_funds: TokenAmount,
    staging_capacity: u64,
    chunk_size: usize,
    chunk_delay: Option<Duration>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            wallet_funds: 1_000_000,
            escrow_funds: 1_000_000,
            staging_capacity: 100 * 1024 * 1024,
            chunk_size: 1 << 20,
            chunk_delay: None,
        }
    }
}

struct Harness {
    dirs: TempDir,
    opts: HarnessOptions,
    chain: Arc<DevChain>,
    transport: Arc<DevTransport>,
    provider: Arc<Provider>,
    token: CancellationToken,
}

impl Harness {
    async fn start(opts: HarnessOptions) -> Self {
        let dirs = TempDir::new().unwrap();
        tokio::fs::create_dir_all(dirs.path().join("source"))
            .await
            .unwrap();

        let chain = Arc::new(DevChain::new());
        chain.set_wallet_balance(Address::from(PROVIDER_WALLET), opts.wallet_funds);
        chain.set_escrow_available(Address::from(PROVIDER_WALLET), opts.escrow_funds);
        let transport = Arc::new(DevTransport::new(opts.chunk_size, opts.chunk_delay));

        let (provider, token) = Self::start_provider(&dirs, &opts, &chain, &transport).await;
        Self {
            dirs,
            opts,
            chain,
            transport,
            provider,
            token,
        }
    }

    async fn start_provider(
        dirs: &TempDir,
        opts: &HarnessOptions,
        chain: &Arc<DevChain>,
        transport: &Arc<DevTransport>,
    ) -> (Arc<Provider>, CancellationToken) {
        let db = Arc::new(DealsDB::open(dirs.path().join("deals_database")).unwrap());
        let token = CancellationToken::new();
        let provider = Provider::start(
            ProviderDeps {
                db,
                fund_config: FundManagerConfig {
                    publish_wallet: Address::from(PROVIDER_WALLET),
                    collateral_wallet: Address::from(PROVIDER_WALLET),
                    publish_fee_per_deal: PUBLISH_FEE,
                },
                storage_config: StorageManagerConfig {
                    staging_root: dirs.path().join("staging"),
                    max_bytes: opts.staging_capacity,
                },
                chain: chain.clone(),
                sealing: Arc::new(DevSealingPipeline::new(dirs.path().join("unsealed"))),
                transport: transport.clone(),
                filter: Arc::new(AcceptAllFilter),
                indexer: Arc::new(DevIndexer),
            },
            token.clone(),
        )
        .await
        .unwrap();
        (provider, token)
    }

    /// Shut the provider down as a process kill would (fibers pause at
    /// their last persisted checkpoint) and bring up a fresh one over the
    /// same database, staging area and chain.
    async fn restart(self) -> Self {
        let Harness {
            dirs,
            opts,
            chain,
            transport,
            provider,
            token,
        } = self;

        token.cancel();
        provider.join().await;
        drop(provider);

        let (provider, token) = Self::start_provider(&dirs, &opts, &chain, &transport).await;
        Self {
            dirs,
            opts,
            chain,
            transport,
            provider,
            token,
        }
    }

    fn source_dir(&self) -> PathBuf {
        self.dirs.path().join("source")
    }

    /// Build an online deal over a freshly generated payload.
    async fn make_online_deal(&self, payload_bytes: u64) -> DealParams {
        let deal_uuid = Uuid::new_v4();
        let (source_path, piece_cid, piece_size) =
            generate_payload(&self.source_dir(), deal_uuid, payload_bytes).await;

        DealParams {
            deal_uuid,
            is_offline: false,
            client_deal_proposal: proposal(piece_cid, piece_size, deal_uuid),
            client_peer_id: "12D3KooWTestClient".to_string(),
            transfer: Transfer {
                kind: DEV_TRANSFER_KIND.to_string(),
                params: DevTransferParams { path: source_path }.to_bytes(),
                size: payload_bytes,
                client_id: None,
            },
        }
    }

    /// Build an offline deal; returns the path the operator would later
    /// import from.
    async fn make_offline_deal(&self, payload_bytes: u64) -> (DealParams, PathBuf) {
        let deal_uuid = Uuid::new_v4();
        let (source_path, piece_cid, piece_size) =
            generate_payload(&self.source_dir(), deal_uuid, payload_bytes).await;

        let params = DealParams {
            deal_uuid,
            is_offline: true,
            client_deal_proposal: proposal(piece_cid, piece_size, deal_uuid),
            client_peer_id: "12D3KooWTestClient".to_string(),
            transfer: Transfer {
                kind: "manual".to_string(),
                params: Vec::new(),
                size: payload_bytes,
                client_id: None,
            },
        };
        (params, source_path)
    }

    fn tagged_funds(&self) -> TokenAmount {
        let totals = self.provider.fund_manager().total_tagged();
        totals.publish + totals.collateral
    }

    fn tagged_bytes(&self) -> u64 {
        self.provider.storage_manager().total_tagged()
    }
}

fn proposal(piece_cid: cid::Cid, piece_size: u64, deal_uuid: Uuid) -> ClientDealProposal {
    ClientDealProposal {
        proposal: DealProposal {
            piece_cid,
            piece_size,
            verified_deal: false,
            client: Address::from("t0101"),
            provider: Address::from(PROVIDER_WALLET),
            label: format!("test deal {deal_uuid}"),
            start_epoch: 10,
            end_epoch: 1_010,
            storage_price_per_epoch: 1,
            provider_collateral: COLLATERAL,
            client_collateral: 0,
        },
        client_signature: deal_uuid.as_bytes().to_vec(),
    }
}

async fn generate_payload(
    source_dir: &Path,
    deal_uuid: Uuid,
    payload_bytes: u64,
) -> (PathBuf, cid::Cid, u64) {
    let mut payload = vec![0u8; payload_bytes as usize];
    rand::thread_rng().fill_bytes(&mut payload);

    let source_path = source_dir.join(format!("{deal_uuid}.payload"));
    tokio::fs::write(&source_path, &payload).await.unwrap();

    let piece_size = commp::padded_piece_size(payload_bytes);
    let commitment = commp::calculate_commp(std::io::Cursor::new(payload), piece_size).unwrap();
    let piece_cid = commp::commitment_to_cid(commitment).unwrap();

    (source_path, piece_cid, piece_size)
}

/// Wait until the subscription reports the deal at `checkpoint`.
async fn wait_for_checkpoint(
    sub: &mut Subscription<ProviderDealState>,
    checkpoint: Checkpoint,
) -> ProviderDealState {
    loop {
        let deal = tokio::time::timeout(RECV_TIMEOUT, sub.next())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for checkpoint {checkpoint}"))
            .unwrap_or_else(|| panic!("subscription closed before checkpoint {checkpoint}"));
        if deal.checkpoint == checkpoint {
            return deal;
        }
        assert!(
            deal.checkpoint < checkpoint,
            "deal passed {checkpoint} and is now at {}",
            deal.checkpoint
        );
    }
}

/// Drain the subscription until the deal's handler closes; by then every
/// terminal release has been processed. Returns the last observed state.
async fn drain_updates(sub: &mut Subscription<ProviderDealState>) -> ProviderDealState {
    let mut last = None;
    loop {
        match tokio::time::timeout(RECV_TIMEOUT, sub.next())
            .await
            .expect("timed out draining deal updates")
        {
            Some(deal) => last = Some(deal),
            None => return last.expect("subscription closed without any update"),
        }
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting until {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll the database until the deal reaches `checkpoint`; robust against
/// the deal finishing (and its handler closing) before we get to look.
async fn wait_for_db_checkpoint(
    harness: &Harness,
    deal_uuid: Uuid,
    checkpoint: Checkpoint,
) -> ProviderDealState {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    loop {
        if let Some(deal) = harness.provider.deals_db().by_id(deal_uuid).unwrap() {
            if deal.checkpoint >= checkpoint {
                return deal;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {deal_uuid} to reach {checkpoint}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn happy_path_online_deal() {
    let harness = Harness::start(HarnessOptions {
        // Slow the transfer down enough to observe the reserved state.
        chunk_size: 8 * 1024,
        chunk_delay: Some(Duration::from_millis(50)),
        ..Default::default()
    })
    .await;
    let mut new_deals = harness.provider.subscribe_new_deals();

    let params = harness.make_online_deal(64 * 1024).await;
    let deal_uuid = params.deal_uuid;

    let response = harness.provider.execute_deal(params).await.unwrap();
    assert!(response.accepted, "rejected: {}", response.reason);

    // Accepted and durable: row at Accepted, funds and storage tagged.
    let stored = harness
        .provider
        .deals_db()
        .by_id(deal_uuid)
        .unwrap()
        .expect("accepted deal is persisted");
    assert!(!stored.is_complete());
    assert_eq!(harness.tagged_funds(), PUBLISH_FEE + COLLATERAL);
    assert_eq!(harness.tagged_bytes(), 64 * 1024);

    let announced = tokio::time::timeout(RECV_TIMEOUT, new_deals.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(announced.deal_uuid, deal_uuid);

    let mut updates = harness.provider.subscribe_deal_updates(deal_uuid).unwrap();

    wait_for_checkpoint(&mut updates, Checkpoint::Published).await;
    // Publish funds are released once the Published checkpoint is durable.
    wait_until("publish funds are released", || harness.tagged_funds() == 0).await;

    wait_for_checkpoint(&mut updates, Checkpoint::AddedPiece).await;
    wait_until("staging bytes are released", || harness.tagged_bytes() == 0).await;
    let staging_file = harness
        .provider
        .storage_manager()
        .download_file_path(deal_uuid);
    wait_until("staging file is removed", || !staging_file.exists()).await;

    let done = drain_updates(&mut updates).await;
    assert_eq!(done.checkpoint, Checkpoint::Complete);
    assert_eq!(done.err, "");
    assert!(done.chain_deal_id.is_some());
    assert!(done.sector.is_some());
    assert!(done.publish_cid.is_some());

    // Nothing leaked.
    assert_eq!(harness.tagged_funds(), 0);
    assert_eq!(harness.tagged_bytes(), 0);

    let stored = harness
        .provider
        .deals_db()
        .by_id(deal_uuid)
        .unwrap()
        .unwrap();
    assert_eq!(stored.checkpoint, Checkpoint::Complete);
    assert_eq!(stored.err, "");
}

#[tokio::test]
async fn duplicate_proposal_is_rejected() {
    let harness = Harness::start(HarnessOptions::default()).await;

    let params = harness.make_online_deal(16 * 1024).await;
    let first_uuid = params.deal_uuid;

    let mut second_params = params.clone();
    let response = harness.provider.execute_deal(params).await.unwrap();
    assert!(response.accepted);

    wait_for_db_checkpoint(&harness, first_uuid, Checkpoint::Complete).await;
    wait_until("first deal's reservations are released", || {
        harness.tagged_funds() == 0 && harness.tagged_bytes() == 0
    })
    .await;

    let funds_before = harness.tagged_funds();
    let bytes_before = harness.tagged_bytes();

    // Same signed proposal under a fresh UUID.
    second_params.deal_uuid = Uuid::new_v4();
    let second_uuid = second_params.deal_uuid;
    let response = harness.provider.execute_deal(second_params).await.unwrap();

    assert!(!response.accepted);
    assert!(
        response.reason.contains(&first_uuid.to_string()),
        "reason should name the colliding deal: {}",
        response.reason
    );

    // No new row, no new reservations.
    assert!(harness
        .provider
        .deals_db()
        .by_id(second_uuid)
        .unwrap()
        .is_none());
    assert_eq!(harness.tagged_funds(), funds_before);
    assert_eq!(harness.tagged_bytes(), bytes_before);
}

#[tokio::test]
async fn insufficient_funds_is_rejected() {
    let harness = Harness::start(HarnessOptions {
        // Not enough escrow for the deal's collateral.
        escrow_funds: COLLATERAL / 2,
        ..Default::default()
    })
    .await;

    let params = harness.make_online_deal(16 * 1024).await;
    let deal_uuid = params.deal_uuid;

    let response = harness.provider.execute_deal(params).await.unwrap();
    assert!(!response.accepted);
    assert!(
        response.reason.contains("insufficient funds"),
        "unexpected reason: {}",
        response.reason
    );

    assert!(harness
        .provider
        .deals_db()
        .by_id(deal_uuid)
        .unwrap()
        .is_none());
    assert_eq!(harness.tagged_funds(), 0);
    assert_eq!(harness.tagged_bytes(), 0);
}

#[tokio::test]
async fn offline_deal_waits_for_import() {
    let harness = Harness::start(HarnessOptions::default()).await;
    let mut new_deals = harness.provider.subscribe_new_deals();

    let (params, data_path) = harness.make_offline_deal(16 * 1024).await;
    let deal_uuid = params.deal_uuid;

    let response = harness.provider.execute_deal(params).await.unwrap();
    assert!(response.accepted);

    // Persisted and announced, but nothing reserved and nothing running.
    let stored = harness
        .provider
        .deals_db()
        .by_id(deal_uuid)
        .unwrap()
        .unwrap();
    assert_eq!(stored.checkpoint, Checkpoint::Accepted);
    assert_eq!(harness.tagged_funds(), 0);
    assert_eq!(harness.tagged_bytes(), 0);

    let announced = tokio::time::timeout(RECV_TIMEOUT, new_deals.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(announced.deal_uuid, deal_uuid);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let stored = harness
        .provider
        .deals_db()
        .by_id(deal_uuid)
        .unwrap()
        .unwrap();
    assert_eq!(stored.checkpoint, Checkpoint::Accepted, "no fiber may run yet");

    // Importing an unknown deal is a typed miss.
    let err = harness
        .provider
        .import_offline_deal(Uuid::new_v4(), data_path.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::DealNotFound(_)));

    // Import the data; funds get tagged and the deal executes to the end.
    let response = harness
        .provider
        .import_offline_deal(deal_uuid, data_path.clone())
        .await
        .unwrap();
    assert!(response.accepted, "rejected: {}", response.reason);

    let done = wait_for_db_checkpoint(&harness, deal_uuid, Checkpoint::Complete).await;
    assert_eq!(done.err, "");
    assert!(done.chain_deal_id.is_some());

    // Offline deals never touch the staging budget; the funds tagged at
    // import time are back to zero once the deal finishes.
    wait_until("funds are released", || harness.tagged_funds() == 0).await;
    assert_eq!(harness.tagged_bytes(), 0);
}

#[tokio::test]
async fn cancel_mid_transfer() {
    let harness = Harness::start(HarnessOptions {
        chunk_size: 4 * 1024,
        chunk_delay: Some(Duration::from_millis(50)),
        ..Default::default()
    })
    .await;

    let params = harness.make_online_deal(256 * 1024).await;
    let deal_uuid = params.deal_uuid;

    let response = harness.provider.execute_deal(params).await.unwrap();
    assert!(response.accepted);

    let mut updates = harness.provider.subscribe_deal_updates(deal_uuid).unwrap();

    // Let some bytes flow before pulling the plug.
    loop {
        let deal = tokio::time::timeout(RECV_TIMEOUT, updates.next())
            .await
            .unwrap()
            .unwrap();
        if deal.nbytes_received > 0 {
            break;
        }
    }
    harness.provider.cancel_deal(deal_uuid).unwrap();

    let done = drain_updates(&mut updates).await;
    assert_eq!(done.checkpoint, Checkpoint::Complete);
    assert_eq!(done.err, "Cancelled");

    assert_eq!(harness.tagged_funds(), 0);
    assert_eq!(harness.tagged_bytes(), 0);
    let staging_file = harness
        .provider
        .storage_manager()
        .download_file_path(deal_uuid);
    wait_until("staging file is removed", || !staging_file.exists()).await;

    // Cancelling a deal that is no longer executing is a typed miss.
    let err = harness.provider.cancel_deal(deal_uuid).unwrap_err();
    assert!(matches!(err, ProviderError::DealExecNotFound(_)));
}

#[tokio::test]
async fn restart_resumes_a_published_deal() {
    let harness = Harness::start(HarnessOptions::default()).await;
    // Publish messages land but confirmations are held back, pinning the
    // deal at Published.
    harness.chain.set_hold_confirmations(true);

    let params = harness.make_online_deal(16 * 1024).await;
    let deal_uuid = params.deal_uuid;

    let response = harness.provider.execute_deal(params).await.unwrap();
    assert!(response.accepted);

    let mut updates = harness.provider.subscribe_deal_updates(deal_uuid).unwrap();
    wait_for_checkpoint(&mut updates, Checkpoint::Published).await;
    // Publish funds release once Published is durable.
    wait_until("publish funds are released", || harness.tagged_funds() == 0).await;
    drop(updates);

    // "Kill" the process and come back up over the same state.
    let harness = harness.restart().await;

    let stored = harness
        .provider
        .deals_db()
        .by_id(deal_uuid)
        .unwrap()
        .unwrap();
    assert_eq!(stored.checkpoint, Checkpoint::Published);

    // The publish phase still owes its release on confirmation, so the
    // restart reconcile re-established the full fund tag, plus the
    // deal's staging bytes.
    assert_eq!(harness.tagged_funds(), PUBLISH_FEE + COLLATERAL);
    assert_eq!(harness.tagged_bytes(), 16 * 1024);

    let mut updates = harness.provider.subscribe_deal_updates(deal_uuid).unwrap();
    harness.chain.set_hold_confirmations(false);

    let done = drain_updates(&mut updates).await;
    assert_eq!(done.checkpoint, Checkpoint::Complete);
    assert_eq!(done.err, "");
    assert!(done.chain_deal_id.is_some());

    assert_eq!(harness.tagged_funds(), 0);
    assert_eq!(harness.tagged_bytes(), 0);
}

#[tokio::test]
async fn storage_release_is_idempotent() {
    let harness = Harness::start(HarnessOptions {
        chunk_size: 4 * 1024,
        chunk_delay: Some(Duration::from_millis(50)),
        ..Default::default()
    })
    .await;

    let params = harness.make_online_deal(256 * 1024).await;
    let deal_uuid = params.deal_uuid;

    let response = harness.provider.execute_deal(params).await.unwrap();
    assert!(response.accepted);
    assert_eq!(harness.tagged_bytes(), 256 * 1024);

    // The client aborts before the transfer matters; two releases leave
    // exactly zero tagged and nothing complains.
    harness.provider.release_storage(deal_uuid).await;
    assert_eq!(harness.tagged_bytes(), 0);
    harness.provider.release_storage(deal_uuid).await;
    assert_eq!(harness.tagged_bytes(), 0);

    let mut updates = harness.provider.subscribe_deal_updates(deal_uuid).unwrap();
    harness.provider.cancel_deal(deal_uuid).unwrap();
    let done = drain_updates(&mut updates).await;
    assert_eq!(done.err, "Cancelled");
    assert_eq!(harness.tagged_funds(), 0);
    assert_eq!(harness.tagged_bytes(), 0);
}
