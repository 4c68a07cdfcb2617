//! The storage deal provider.
//!
//! The provider serialises every mutation of the two shared resources
//! (reservable funds and reservable staging bytes) through a single event
//! loop, while each accepted deal executes on its own task. The loop is
//! effectively a lock over those resources: acceptance, the release of
//! publish funds, and the release of staging space all pass through it one
//! message at a time.

mod acceptance;
mod execution;

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use tokio::sync::{mpsc, oneshot};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use uuid::Uuid;

use crate::{
    adapters::{ChainClient, IndexAnnouncer, SealingPipelineApi, StorageDealFilter, Transport},
    db::{DBError, DealsDB},
    deal_logger::DealLogger,
    fund_manager::{FundManager, FundManagerConfig, FundManagerError},
    handler::{DealHandler, StatefulBus, Subscription},
    storage_manager::{StorageManager, StorageManagerConfig, StorageManagerError},
    types::{Checkpoint, DealParams, DealRejectionInfo, ProviderDealState},
};

/// How many requests each provider channel buffers. Sends from deal tasks
/// must never be able to deadlock with the event loop, so every channel is
/// buffered and the loop never waits on a deal task.
const CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("deal {0} not found")]
    DealNotFound(Uuid),

    #[error("deal execution not found for deal {0}")]
    DealExecNotFound(Uuid),

    #[error("deal {0} is not an offline deal")]
    NotOfflineDeal(Uuid),

    #[error("deal {0} has already reached a terminal state")]
    AlreadyComplete(Uuid),

    #[error("data for deal {0} has already been imported")]
    AlreadyImported(Uuid),

    #[error("cannot read deal data at {path}: {source}")]
    ImportFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("provider is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    DB(#[from] DBError),

    #[error(transparent)]
    Storage(#[from] StorageManagerError),
}

/// Everything the provider is wired with.
pub struct ProviderDeps {
    pub db: Arc<DealsDB>,
    pub fund_config: FundManagerConfig,
    pub storage_config: StorageManagerConfig,
    pub chain: Arc<dyn ChainClient>,
    pub sealing: Arc<dyn SealingPipelineApi>,
    pub transport: Arc<dyn Transport>,
    pub filter: Arc<dyn StorageDealFilter>,
    pub indexer: Arc<dyn IndexAnnouncer>,
}

pub(crate) struct AcceptDealRequest {
    pub deal: ProviderDealState,
    pub handler: Arc<DealHandler>,
    /// Whether this request created the handler. A rejection only tears
    /// the handler down when it did; a duplicate proposal must not close
    /// the handler of the live deal it collided with.
    pub owns_handler: bool,
    pub is_import: bool,
    pub rsp: oneshot::Sender<DealRejectionInfo>,
}

pub(crate) struct ReleaseRequest {
    pub deal_uuid: Uuid,
    pub done: oneshot::Sender<()>,
}

pub struct Provider {
    pub(crate) db: Arc<DealsDB>,
    pub(crate) logger: DealLogger,
    pub(crate) funds: FundManager,
    pub(crate) storage: StorageManager,

    pub(crate) chain: Arc<dyn ChainClient>,
    pub(crate) sealing: Arc<dyn SealingPipelineApi>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) filter: Arc<dyn StorageDealFilter>,
    pub(crate) indexer: Arc<dyn IndexAnnouncer>,

    handlers: Mutex<HashMap<Uuid, Arc<DealHandler>>>,
    new_deals: StatefulBus<ProviderDealState>,

    accept_tx: mpsc::Sender<AcceptDealRequest>,
    storage_release_tx: mpsc::Sender<ReleaseRequest>,
    publish_release_tx: mpsc::Sender<ReleaseRequest>,
    finish_release_tx: mpsc::Sender<ReleaseRequest>,

    pub(crate) token: CancellationToken,
    tasks: TaskTracker,
}

impl Provider {
    /// Build the provider, reconcile resource reservations against the
    /// deals database, then start the event loop and a task per resumable
    /// deal.
    ///
    /// Cancelling `token` stops the event loop and pauses all running
    /// deals at their last persisted checkpoint; [`Provider::join`] waits
    /// for everything to wind down.
    pub async fn start(
        deps: ProviderDeps,
        token: CancellationToken,
    ) -> Result<Arc<Self>, ProviderError> {
        let storage = StorageManager::new(deps.storage_config).await?;
        let funds = FundManager::new(deps.fund_config, deps.chain.clone());

        let (accept_tx, accept_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (storage_release_tx, storage_release_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (publish_release_tx, publish_release_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (finish_release_tx, finish_release_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let provider = Arc::new(Self {
            logger: DealLogger::new(deps.db.clone()),
            db: deps.db,
            funds,
            storage,
            chain: deps.chain,
            sealing: deps.sealing,
            transport: deps.transport,
            filter: deps.filter,
            indexer: deps.indexer,
            handlers: Mutex::new(HashMap::new()),
            new_deals: StatefulBus::new(),
            accept_tx,
            storage_release_tx,
            publish_release_tx,
            finish_release_tx,
            token,
            tasks: TaskTracker::new(),
        });

        // Reservations must match the database before any deal runs again.
        let resumable = provider.reconcile_reservations()?;

        provider.tasks.spawn(run_loop(
            provider.clone(),
            accept_rx,
            storage_release_rx,
            publish_release_rx,
            finish_release_rx,
        ));

        for (deal, handler) in resumable {
            provider
                .logger
                .info(deal.deal_uuid, "resuming deal execution", serde_json::json!({
                    "checkpoint": deal.checkpoint.to_string(),
                }));
            provider.spawn_fiber(deal, handler);
        }

        Ok(provider)
    }

    /// Wait for the event loop and all deal tasks to finish. Only returns
    /// once the token passed to [`Provider::start`] has been cancelled.
    pub async fn join(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Submit a deal proposal for acceptance. The reply tells the client
    /// whether the deal was durably accepted and, if not, why.
    pub async fn execute_deal(
        &self,
        params: DealParams,
    ) -> Result<DealRejectionInfo, ProviderError> {
        let deal = ProviderDealState::new(params);
        let (handler, owns_handler) = self.mk_and_insert_handler(deal.deal_uuid);
        self.send_accept(deal, handler, owns_handler, false).await
    }

    /// Import the data for a previously accepted offline deal and start
    /// executing it.
    pub async fn import_offline_deal(
        &self,
        deal_uuid: Uuid,
        file_path: PathBuf,
    ) -> Result<DealRejectionInfo, ProviderError> {
        let Some(mut deal) = self.db.by_id(deal_uuid)? else {
            return Err(ProviderError::DealNotFound(deal_uuid));
        };
        if !deal.is_offline {
            return Err(ProviderError::NotOfflineDeal(deal_uuid));
        }
        if deal.is_complete() {
            return Err(ProviderError::AlreadyComplete(deal_uuid));
        }
        if deal.inbound_file_path.is_some() {
            return Err(ProviderError::AlreadyImported(deal_uuid));
        }

        let metadata = tokio::fs::metadata(&file_path)
            .await
            .map_err(|source| ProviderError::ImportFile {
                path: file_path.clone(),
                source,
            })?;
        deal.inbound_file_path = Some(file_path);
        deal.nbytes_received = metadata.len();

        let (handler, owns_handler) = self.mk_and_insert_handler(deal_uuid);
        self.send_accept(deal, handler, owns_handler, true).await
    }

    /// Cancel a running deal. The deal records `Err = "Cancelled"` and
    /// releases its reservations before reaching `Complete`.
    pub fn cancel_deal(&self, deal_uuid: Uuid) -> Result<(), ProviderError> {
        let handlers = self.handlers.lock().expect("handler map lock is never poisoned");
        let handler = handlers
            .get(&deal_uuid)
            .ok_or(ProviderError::DealExecNotFound(deal_uuid))?;
        handler.trigger_cancel();
        Ok(())
    }

    /// Subscribe to a live deal's state updates. The current state is
    /// delivered immediately, then every transition in order.
    pub fn subscribe_deal_updates(
        &self,
        deal_uuid: Uuid,
    ) -> Result<Subscription<ProviderDealState>, ProviderError> {
        let handlers = self.handlers.lock().expect("handler map lock is never poisoned");
        handlers
            .get(&deal_uuid)
            .map(|handler| handler.subscribe())
            .ok_or(ProviderError::DealExecNotFound(deal_uuid))
    }

    /// Subscribe to newly accepted deals.
    pub fn subscribe_new_deals(&self) -> Subscription<ProviderDealState> {
        self.new_deals.subscribe()
    }

    /// Release the staging space tagged for a deal, e.g. when a client
    /// aborts before its transfer begins. Idempotent.
    pub async fn release_storage(&self, deal_uuid: Uuid) {
        Self::send_release(&self.storage_release_tx, deal_uuid).await;
    }

    /// Bytes transferred so far for the deal, as reported by the transport.
    pub fn transferred(&self, deal_uuid: Uuid) -> u64 {
        self.transport.transferred(deal_uuid)
    }

    pub fn deals_db(&self) -> &Arc<DealsDB> {
        &self.db
    }

    pub fn fund_manager(&self) -> &FundManager {
        &self.funds
    }

    pub fn storage_manager(&self) -> &StorageManager {
        &self.storage
    }

    async fn send_accept(
        &self,
        deal: ProviderDealState,
        handler: Arc<DealHandler>,
        owns_handler: bool,
        is_import: bool,
    ) -> Result<DealRejectionInfo, ProviderError> {
        let (rsp_tx, rsp_rx) = oneshot::channel();
        self.accept_tx
            .send(AcceptDealRequest {
                deal,
                handler,
                owns_handler,
                is_import,
                rsp: rsp_tx,
            })
            .await
            .map_err(|_| ProviderError::ShuttingDown)?;
        rsp_rx.await.map_err(|_| ProviderError::ShuttingDown)
    }

    /// Scan the database for non-terminal deals and re-establish the fund
    /// and storage reservations they are owed, before any deal task runs.
    ///
    /// Returns the deals that should resume execution, with their handlers.
    fn reconcile_reservations(
        self: &Arc<Self>,
    ) -> Result<Vec<(ProviderDealState, Arc<DealHandler>)>, ProviderError> {
        let active = self.db.list_active()?;
        let mut resumable = Vec::with_capacity(active.len());

        for deal in active {
            let imported = deal.inbound_file_path.is_some();
            let awaiting_import = deal.is_offline && !imported;

            // Deals that released their funds on publish confirmation keep
            // them released; offline deals only tag funds at import time.
            if deal.checkpoint < Checkpoint::PublishConfirmed && !awaiting_import {
                let funds = self.funds.restore_tag(deal.deal_uuid, deal.proposal());
                self.logger.info(
                    deal.deal_uuid,
                    "restored fund tags for deal",
                    serde_json::json!({
                        "publish": funds.publish,
                        "collateral": funds.collateral,
                    }),
                );
            }

            // Online deals keep their staging bytes until the piece lands
            // in a sector; offline data never lives in the staging area.
            if !deal.is_offline && deal.checkpoint < Checkpoint::AddedPiece {
                self.storage.restore_tag(deal.deal_uuid, deal.transfer.size);
                self.logger.info(
                    deal.deal_uuid,
                    "restored storage tag for deal",
                    serde_json::json!({ "bytes": deal.transfer.size }),
                );
            }

            let (handler, _) = self.mk_and_insert_handler(deal.deal_uuid);
            if awaiting_import {
                // Still parked until the operator imports the data.
                continue;
            }
            resumable.push((deal, handler));
        }

        Ok(resumable)
    }

    pub(crate) fn spawn_fiber(
        self: &Arc<Self>,
        deal: ProviderDealState,
        handler: Arc<DealHandler>,
    ) {
        let provider = self.clone();
        self.tasks.spawn(async move {
            let deal_uuid = deal.deal_uuid;
            execution::run_deal(provider.clone(), deal, handler).await;
            provider.logger.info(
                deal_uuid,
                "deal execution task finished",
                serde_json::Value::Null,
            );
        });
    }

    /// Get the deal's handler, creating one if none exists. The second
    /// element reports whether this call created it.
    pub(crate) fn mk_and_insert_handler(&self, deal_uuid: Uuid) -> (Arc<DealHandler>, bool) {
        let mut handlers = self.handlers.lock().expect("handler map lock is never poisoned");
        match handlers.entry(deal_uuid) {
            std::collections::hash_map::Entry::Occupied(entry) => (entry.get().clone(), false),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let handler = Arc::new(DealHandler::new(deal_uuid));
                entry.insert(handler.clone());
                (handler, true)
            }
        }
    }

    pub(crate) fn remove_handler(&self, deal_uuid: Uuid) {
        self.handlers
            .lock()
            .expect("handler map lock is never poisoned")
            .remove(&deal_uuid);
    }

    pub(crate) fn fire_new_deal(&self, deal: &ProviderDealState) {
        self.new_deals.publish(deal.clone());
    }

    pub(crate) async fn release_publish_funds(&self, deal_uuid: Uuid) {
        Self::send_release(&self.publish_release_tx, deal_uuid).await;
    }

    pub(crate) async fn release_finished(&self, deal_uuid: Uuid) {
        Self::send_release(&self.finish_release_tx, deal_uuid).await;
    }

    async fn send_release(tx: &mpsc::Sender<ReleaseRequest>, deal_uuid: Uuid) {
        let (done_tx, done_rx) = oneshot::channel();
        let req = ReleaseRequest {
            deal_uuid,
            done: done_tx,
        };
        // A closed loop means the provider is shutting down; the ledgers
        // die with the process, so there is nothing left to release.
        if tx.send(req).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    fn handle_storage_release(&self, req: ReleaseRequest) {
        match self.storage.untag(req.deal_uuid) {
            Ok(bytes) => self.logger.info(
                req.deal_uuid,
                "untagged storage space",
                serde_json::json!({ "bytes": bytes }),
            ),
            Err(StorageManagerError::NotFound(_)) => {}
            Err(err) => self
                .logger
                .error(req.deal_uuid, "failed to untag storage space", err),
        }
        let _ = req.done.send(());
    }

    fn handle_publish_release(&self, req: ReleaseRequest) {
        match self.funds.untag_funds(req.deal_uuid) {
            Ok(funds) => self.logger.info(
                req.deal_uuid,
                "untagged funds for deal after publish",
                serde_json::json!({
                    "untagged publish": funds.publish,
                    "untagged collateral": funds.collateral,
                }),
            ),
            Err(FundManagerError::NotFound(_)) => {}
            Err(err) => self
                .logger
                .error(req.deal_uuid, "failed to untag funds", err),
        }
        let _ = req.done.send(());
    }

    fn handle_finish_release(&self, req: ReleaseRequest) {
        self.logger
            .info(req.deal_uuid, "deal finished", serde_json::Value::Null);

        match self.funds.untag_funds(req.deal_uuid) {
            Ok(funds) => self.logger.info(
                req.deal_uuid,
                "untagged funds for deal as deal finished",
                serde_json::json!({
                    "untagged publish": funds.publish,
                    "untagged collateral": funds.collateral,
                }),
            ),
            Err(FundManagerError::NotFound(_)) => {}
            Err(err) => self
                .logger
                .error(req.deal_uuid, "failed to untag funds", err),
        }

        match self.storage.untag(req.deal_uuid) {
            Ok(bytes) => self.logger.info(
                req.deal_uuid,
                "untagged storage space for deal",
                serde_json::json!({ "bytes": bytes }),
            ),
            Err(StorageManagerError::NotFound(_)) => {}
            Err(err) => self
                .logger
                .error(req.deal_uuid, "failed to untag storage", err),
        }

        let _ = req.done.send(());
    }
}

/// The provider event loop: the single consumer of all four channels.
#[tracing::instrument(skip_all)]
async fn run_loop(
    provider: Arc<Provider>,
    mut accept_rx: mpsc::Receiver<AcceptDealRequest>,
    mut storage_release_rx: mpsc::Receiver<ReleaseRequest>,
    mut publish_release_rx: mpsc::Receiver<ReleaseRequest>,
    mut finish_release_rx: mpsc::Receiver<ReleaseRequest>,
) {
    loop {
        tokio::select! {
            Some(req) = accept_rx.recv() => {
                provider.handle_accept(req).await;
            }
            Some(req) = storage_release_rx.recv() => {
                provider.handle_storage_release(req);
            }
            Some(req) = publish_release_rx.recv() => {
                provider.handle_publish_release(req);
            }
            Some(req) = finish_release_rx.recv() => {
                provider.handle_finish_release(req);
            }
            _ = provider.token.cancelled() => {
                tracing::info!("provider event loop complete");
                break;
            }
        }
    }
}
