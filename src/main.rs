//! A development-mode storage market provider daemon.
//!
//! Runs the full deal acceptance and execution core against the
//! in-process development adapters: a chain with operator-configured
//! balances, a sealing pipeline backed by a local directory, and a
//! file-copy transport. Optionally submits a batch of self-generated
//! deals to exercise the whole pipeline end to end.
#![deny(clippy::unwrap_used)]

use std::{env::temp_dir, path::PathBuf, sync::Arc};

use clap::Parser;
use rand::{Rng, RngCore};
use storage_market::{
    commp,
    db::{DBError, DealsDB},
    devnet::{
        AcceptAllFilter, DevChain, DevIndexer, DevSealingPipeline, DevTransferParams,
        DevTransport, DEV_TRANSFER_KIND,
    },
    fund_manager::FundManagerConfig,
    provider::{Provider, ProviderDeps, ProviderError},
    storage_manager::StorageManagerConfig,
    types::{Address, ClientDealProposal, DealParams, DealProposal, TokenAmount, Transfer},
};
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

/// Name for the directory where the deal downloads are staged.
const STAGING_DIRECTORY_NAME: &str = "staging";

/// Name for the directory where the dev sealing pipeline keeps unsealed
/// sectors.
const UNSEALED_SECTOR_DIRECTORY_NAME: &str = "unsealed";

/// Name for the directory where demo deal payloads are generated.
const DEMO_SOURCE_DIRECTORY_NAME: &str = "demo";

fn get_random_temporary_folder() -> PathBuf {
    temp_dir().join(
        rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(7)
            .map(char::from)
            .collect::<String>(),
    )
}

fn main() -> Result<(), ServerError> {
    // Logger initialization.
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .init();

    let configuration: ServerConfiguration = ServerArguments::parse().try_into()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build the runtime")
        .block_on(configuration.run())?;

    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("FromEnv error: {0}")]
    EnvFilter(#[from] tracing_subscriber::filter::FromEnvError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Db(#[from] DBError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    CommP(#[from] commp::CommPError),
}

/// The server arguments, as passed by the user, unvalidated.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct ServerArguments {
    /// Deals database directory.
    /// Defaults to a temporary random directory, like `/tmp/<random>/deals_database`.
    #[arg(long)]
    database_directory: Option<PathBuf>,

    /// Storage root directory, holding the staging area and the dev
    /// sealing pipeline's sectors.
    /// Defaults to a temporary random directory, like `/tmp/<random>/deals_storage`.
    #[arg(long)]
    storage_directory: Option<PathBuf>,

    /// Staging area byte budget.
    #[arg(long, default_value_t = 8 * 1024 * 1024 * 1024)]
    staging_capacity: u64,

    /// Funds reserved per deal for its share of the publish message.
    #[arg(long, default_value_t = 1_000)]
    publish_fee: TokenAmount,

    /// Balance of the dev chain wallet paying for publish messages.
    #[arg(long, default_value_t = 1_000_000)]
    wallet_funds: TokenAmount,

    /// Market escrow available on the dev chain for deal collateral.
    #[arg(long, default_value_t = 1_000_000_000)]
    escrow_funds: TokenAmount,

    /// Number of self-generated demo deals to submit on startup.
    #[arg(long, default_value_t = 0)]
    demo_deals: u32,

    /// Payload size of each demo deal, in bytes.
    #[arg(long, default_value_t = 1024 * 1024)]
    demo_deal_bytes: u64,
}

/// A valid server configuration. To be created using
/// [`ServerConfiguration::try_from`].
pub struct ServerConfiguration {
    database_directory: PathBuf,
    storage_directory: PathBuf,
    staging_capacity: u64,
    publish_fee: TokenAmount,
    wallet_funds: TokenAmount,
    escrow_funds: TokenAmount,
    demo_deals: u32,
    demo_deal_bytes: u64,
}

impl TryFrom<ServerArguments> for ServerConfiguration {
    type Error = ServerError;

    fn try_from(value: ServerArguments) -> Result<Self, Self::Error> {
        let common_folder = get_random_temporary_folder();
        let database_directory = value.database_directory.unwrap_or_else(|| {
            let path = common_folder.join("deals_database");
            tracing::warn!(
                "no database directory was defined, using: {}",
                path.display()
            );
            path
        });
        std::fs::create_dir_all(&database_directory)?;

        let storage_directory = value.storage_directory.unwrap_or_else(|| {
            let path = common_folder.join("deals_storage");
            tracing::warn!(
                "no storage directory was defined, using: {}",
                path.display()
            );
            path
        });
        std::fs::create_dir_all(&storage_directory)?;

        Ok(Self {
            database_directory,
            storage_directory,
            staging_capacity: value.staging_capacity,
            publish_fee: value.publish_fee,
            wallet_funds: value.wallet_funds,
            escrow_funds: value.escrow_funds,
            demo_deals: value.demo_deals,
            demo_deal_bytes: value.demo_deal_bytes,
        })
    }
}

impl ServerConfiguration {
    pub async fn run(self) -> Result<(), ServerError> {
        let provider_wallet = Address::from("t01000");

        let chain = Arc::new(DevChain::new());
        chain.set_wallet_balance(provider_wallet.clone(), self.wallet_funds);
        chain.set_escrow_available(provider_wallet.clone(), self.escrow_funds);

        let db = Arc::new(DealsDB::open(&self.database_directory)?);
        let sealing = Arc::new(DevSealingPipeline::new(
            self.storage_directory.join(UNSEALED_SECTOR_DIRECTORY_NAME),
        ));
        let transport = Arc::new(DevTransport::default());

        let token = CancellationToken::new();
        let provider = Provider::start(
            ProviderDeps {
                db,
                fund_config: FundManagerConfig {
                    publish_wallet: provider_wallet.clone(),
                    collateral_wallet: provider_wallet.clone(),
                    publish_fee_per_deal: self.publish_fee,
                },
                storage_config: StorageManagerConfig {
                    staging_root: self.storage_directory.join(STAGING_DIRECTORY_NAME),
                    max_bytes: self.staging_capacity,
                },
                chain,
                sealing,
                transport,
                filter: Arc::new(AcceptAllFilter),
                indexer: Arc::new(DevIndexer),
            },
            token.clone(),
        )
        .await?;
        tracing::info!("storage market provider started");

        if self.demo_deals > 0 {
            let demo_dir = self.storage_directory.join(DEMO_SOURCE_DIRECTORY_NAME);
            tokio::fs::create_dir_all(&demo_dir).await?;
            let demo_provider = provider.clone();
            let demo_deal_bytes = self.demo_deal_bytes;
            let demo_deals = self.demo_deals;
            tokio::spawn(async move {
                for i in 0..demo_deals {
                    match submit_demo_deal(&demo_provider, &demo_dir, demo_deal_bytes).await {
                        Ok(rejection) if rejection.accepted => {
                            tracing::info!(deal = i, "demo deal accepted");
                        }
                        Ok(rejection) => {
                            tracing::warn!(deal = i, reason = %rejection.reason, "demo deal rejected");
                        }
                        Err(err) => {
                            tracing::error!(deal = i, %err, "failed to submit demo deal");
                        }
                    }
                }
            });
        }

        // Wait for SIGTERM on the main task and once received "unblock".
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for event");
        tracing::info!("SIGTERM received, shutting down...");

        token.cancel();
        provider.join().await;
        tracing::info!("storage market provider stopped");

        Ok(())
    }
}

/// Generate a random payload, compute its piece commitment and submit it
/// as an online deal over the dev transport.
async fn submit_demo_deal(
    provider: &Provider,
    demo_dir: &std::path::Path,
    payload_bytes: u64,
) -> Result<storage_market::types::DealRejectionInfo, ServerError> {
    let deal_uuid = Uuid::new_v4();

    let mut payload = vec![0u8; payload_bytes as usize];
    rand::thread_rng().fill_bytes(&mut payload);
    let source_path = demo_dir.join(format!("{deal_uuid}.payload"));
    tokio::fs::write(&source_path, &payload).await?;

    let piece_size = commp::padded_piece_size(payload_bytes);
    let piece_cid = {
        let payload = payload.clone();
        tokio::task::spawn_blocking(move || {
            let commitment = commp::calculate_commp(std::io::Cursor::new(payload), piece_size)?;
            commp::commitment_to_cid(commitment)
        })
        .await
        .expect("commp task never panics")?
    };

    let head = 10;
    let params = DealParams {
        deal_uuid,
        is_offline: false,
        client_deal_proposal: ClientDealProposal {
            proposal: DealProposal {
                piece_cid,
                piece_size,
                verified_deal: false,
                client: Address::from("t0101"),
                provider: Address::from("t01000"),
                label: format!("demo deal {deal_uuid}"),
                start_epoch: head,
                end_epoch: head + 1_000,
                storage_price_per_epoch: 1,
                provider_collateral: 1_000,
                client_collateral: 0,
            },
            client_signature: deal_uuid.as_bytes().to_vec(),
        },
        client_peer_id: "12D3KooWDevClient".to_string(),
        transfer: Transfer {
            kind: DEV_TRANSFER_KIND.to_string(),
            params: DevTransferParams { path: source_path }.to_bytes(),
            size: payload_bytes,
            client_id: None,
        },
    };

    let rejection = provider.execute_deal(params).await?;

    // Follow the accepted deal's progress so it shows up in the daemon's
    // logs.
    if rejection.accepted {
        if let Ok(mut updates) = provider.subscribe_deal_updates(deal_uuid) {
            tokio::spawn(async move {
                while let Some(deal) = updates.next().await {
                    tracing::info!(
                        deal = %deal.deal_uuid,
                        checkpoint = %deal.checkpoint,
                        received = deal.nbytes_received,
                        "deal update"
                    );
                }
            });
        }
    }

    Ok(rejection)
}
