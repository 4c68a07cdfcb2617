//! Deal execution.
//!
//! One task per accepted deal drives the checkpoint state machine from
//! `Accepted` to `Complete`, persisting each advance before announcing it
//! on the deal's handler. The task owns exactly one deal and talks to the
//! shared resource ledgers only through the provider's release channels.

use std::{path::PathBuf, sync::Arc, time::Duration};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    adapters::TransportError,
    commp,
    handler::DealHandler,
    provider::Provider,
    types::{Checkpoint, ProviderDealState},
};

const MAX_RETRIES: u32 = 5;
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(60);

/// Why a single attempt of a transition step did not produce a result.
enum StepError {
    /// Worth retrying with backoff.
    Transient(String),
    /// Retrying cannot help; `code` becomes the deal's terminal `err`.
    Fatal { code: String, detail: String },
    Cancelled,
    Shutdown,
}

impl StepError {
    fn fatal(code: impl Into<String>, detail: impl Into<String>) -> Self {
        StepError::Fatal {
            code: code.into(),
            detail: detail.into(),
        }
    }
}

/// Why the deal's execution ended before reaching `Complete` successfully.
enum ExecutionError {
    /// The user cancelled the deal.
    Cancelled,
    /// The daemon is shutting down; the deal resumes after restart.
    Shutdown,
    /// The deal is dead; `code` is the stable reason recorded on it.
    Fatal { code: String, detail: String },
}

impl From<StepError> for ExecutionError {
    fn from(err: StepError) -> Self {
        match err {
            StepError::Cancelled => ExecutionError::Cancelled,
            StepError::Shutdown => ExecutionError::Shutdown,
            StepError::Fatal { code, detail } => ExecutionError::Fatal { code, detail },
            // Transient errors never escape the retry loops.
            StepError::Transient(detail) => ExecutionError::Fatal {
                code: "retries exhausted".to_string(),
                detail,
            },
        }
    }
}

/// Drive one deal to a terminal state (or to the daemon's shutdown).
pub(crate) async fn run_deal(
    provider: Arc<Provider>,
    mut deal: ProviderDealState,
    handler: Arc<DealHandler>,
) {
    let cancel = handler.cancel_token();

    match execute_checkpoints(&provider, &mut deal, &handler, &cancel).await {
        Ok(()) => {
            provider.logger.info(
                deal.deal_uuid,
                "deal execution complete",
                serde_json::Value::Null,
            );
        }
        Err(ExecutionError::Shutdown) => {
            // The deal stays at its last persisted checkpoint and resumes
            // on the next start; reservations are rebuilt from the
            // database then, so nothing is released here.
            provider.logger.info(
                deal.deal_uuid,
                "pausing deal execution for shutdown",
                serde_json::json!({ "checkpoint": deal.checkpoint.to_string() }),
            );
            return;
        }
        Err(ExecutionError::Cancelled) => {
            provider.logger.info(
                deal.deal_uuid,
                "deal cancelled by user",
                serde_json::Value::Null,
            );
            fail_deal(&provider, &mut deal, &handler, "Cancelled".to_string()).await;
        }
        Err(ExecutionError::Fatal { code, detail }) => {
            provider
                .logger
                .error(deal.deal_uuid, "deal execution failed", &detail);
            fail_deal(&provider, &mut deal, &handler, code).await;
        }
    }

    // Terminal either way: release whatever is still tagged and take the
    // handler down. Handler close is driven from here and only here.
    provider.release_finished(deal.deal_uuid).await;
    handler.publish(deal.clone());
    handler.close();
    provider.remove_handler(deal.deal_uuid);
}

async fn execute_checkpoints(
    provider: &Provider,
    deal: &mut ProviderDealState,
    handler: &DealHandler,
    cancel: &CancellationToken,
) -> Result<(), ExecutionError> {
    while !deal.checkpoint.is_terminal() {
        if provider.token.is_cancelled() {
            return Err(ExecutionError::Shutdown);
        }
        if cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        match deal.checkpoint {
            Checkpoint::Accepted => transfer_step(provider, deal, handler, cancel).await?,
            Checkpoint::Transferred => publish_step(provider, deal, handler, cancel).await?,
            Checkpoint::Published => confirm_step(provider, deal, handler, cancel).await?,
            Checkpoint::PublishConfirmed => {
                add_piece_step(provider, deal, handler, cancel).await?
            }
            Checkpoint::AddedPiece => announce_step(provider, deal, handler, cancel).await?,
            Checkpoint::IndexedAndAnnounced => complete_step(provider, deal, handler)?,
            Checkpoint::Complete => break,
        }
    }
    Ok(())
}

/// `Accepted → Transferred`: get the bytes onto disk and make sure they
/// are the bytes the client committed to.
async fn transfer_step(
    provider: &Provider,
    deal: &mut ProviderDealState,
    handler: &DealHandler,
    cancel: &CancellationToken,
) -> Result<(), ExecutionError> {
    let dest = deal
        .inbound_file_path
        .clone()
        .ok_or_else(|| StepError::fatal("missing inbound file", "no inbound file path on deal"))?;

    if !deal.is_offline {
        let mut attempt = 0;
        let total = loop {
            match transfer_once(provider, deal, handler, &dest, cancel).await {
                Ok(total) => break total,
                Err(StepError::Transient(detail)) => {
                    attempt += 1;
                    if attempt >= MAX_RETRIES {
                        return Err(ExecutionError::Fatal {
                            code: "transfer failed".to_string(),
                            detail,
                        });
                    }
                    retry_pause(provider, deal.deal_uuid, "transfer", attempt, &detail, cancel)
                        .await?;
                }
                Err(err) => return Err(err.into()),
            }
        };

        if total != deal.transfer.size {
            return Err(ExecutionError::Fatal {
                code: "incorrect transfer size".to_string(),
                detail: format!(
                    "transferred {total} bytes, transfer params announced {}",
                    deal.transfer.size
                ),
            });
        }
        deal.nbytes_received = total;
    }
    // Offline deals arrive with the data already on disk; only the
    // commitment check below applies.

    verify_commp(provider, deal).await?;
    provider.logger.info(
        deal.deal_uuid,
        "piece commitment verified",
        serde_json::json!({ "piece_cid": deal.proposal().piece_cid.to_string() }),
    );

    advance(provider, deal, handler, Checkpoint::Transferred)?;
    Ok(())
}

/// One attempt at fetching the deal data, streaming progress updates out
/// on the handler bus as bytes arrive.
async fn transfer_once(
    provider: &Provider,
    deal: &mut ProviderDealState,
    handler: &DealHandler,
    dest: &PathBuf,
    cancel: &CancellationToken,
) -> Result<u64, StepError> {
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let transport = provider.transport.clone();
    let transfer = deal.transfer.clone();
    let deal_uuid = deal.deal_uuid;

    let fut = transport.execute(deal_uuid, &transfer, dest, progress_tx, cancel.clone());
    tokio::pin!(fut);

    loop {
        tokio::select! {
            res = &mut fut => {
                return match res {
                    Ok(total) => Ok(total),
                    Err(TransportError::Cancelled) => Err(StepError::Cancelled),
                    Err(err) if err.is_transient() => Err(StepError::Transient(err.to_string())),
                    Err(err) => Err(StepError::fatal("transfer failed", err.to_string())),
                };
            }
            Some(nbytes) = progress_rx.recv() => {
                deal.nbytes_received = nbytes;
                if let Err(err) = provider.db.update(deal) {
                    tracing::warn!(%err, deal = %deal_uuid, "failed to persist transfer progress");
                }
                handler.publish(deal.clone());
            }
            _ = cancel.cancelled() => return Err(StepError::Cancelled),
            _ = provider.token.cancelled() => return Err(StepError::Shutdown),
        }
    }
}

/// The assembled file must hash to the piece CID from the proposal;
/// anything else is terminal.
async fn verify_commp(
    provider: &Provider,
    deal: &ProviderDealState,
) -> Result<(), ExecutionError> {
    let path = deal
        .inbound_file_path
        .clone()
        .ok_or_else(|| StepError::fatal("missing inbound file", "no inbound file path on deal"))?;
    let piece_size = deal.proposal().piece_size;

    let calculated = tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&path)?;
        let reader = std::io::BufReader::new(file);
        let commitment = commp::calculate_commp(reader, piece_size)?;
        commp::commitment_to_cid(commitment)
    })
    .await
    .map_err(|err| StepError::fatal("commP calculation failed", err.to_string()))?
    .map_err(|err| StepError::fatal("commP calculation failed", err.to_string()))?;

    let expected = deal.proposal().piece_cid;
    if calculated != expected {
        provider.logger.warn(
            deal.deal_uuid,
            "piece commitment mismatch",
            serde_json::json!({
                "expected": expected.to_string(),
                "calculated": calculated.to_string(),
            }),
        );
        return Err(ExecutionError::Fatal {
            code: "commP mismatch".to_string(),
            detail: format!("calculated {calculated}, proposal has {expected}"),
        });
    }
    Ok(())
}

/// `Transferred → Published`: hand the signed deal to the chain's publish
/// batcher. Publish funds are released once the new checkpoint is durable,
/// so a crash in between still holds the funds on restart.
async fn publish_step(
    provider: &Provider,
    deal: &mut ProviderDealState,
    handler: &DealHandler,
    cancel: &CancellationToken,
) -> Result<(), ExecutionError> {
    let chain = provider.chain.clone();
    let proposal = deal.client_deal_proposal.clone();

    let publish_cid = with_retries(
        provider,
        deal.deal_uuid,
        "publish deal",
        "publish failed",
        cancel,
        || {
            let chain = chain.clone();
            let proposal = proposal.clone();
            async move {
                chain.publish_deal(&proposal).await.map_err(|err| {
                    if err.is_transient() {
                        StepError::Transient(err.to_string())
                    } else {
                        StepError::fatal("publish rejected", err.to_string())
                    }
                })
            }
        },
    )
    .await?;

    deal.publish_cid = Some(publish_cid);
    provider.logger.info(
        deal.deal_uuid,
        "deal publish message submitted",
        serde_json::json!({ "publish_cid": publish_cid.to_string() }),
    );

    advance(provider, deal, handler, Checkpoint::Published)?;
    provider.release_publish_funds(deal.deal_uuid).await;
    Ok(())
}

/// `Published → PublishConfirmed`: poll until the publish message lands
/// and record the chain's deal id.
async fn confirm_step(
    provider: &Provider,
    deal: &mut ProviderDealState,
    handler: &DealHandler,
    cancel: &CancellationToken,
) -> Result<(), ExecutionError> {
    let publish_cid = deal.publish_cid.ok_or_else(|| {
        StepError::fatal("missing publish cid", "deal is at Published without a publish cid")
    })?;
    let chain = provider.chain.clone();

    let chain_deal_id = with_retries(
        provider,
        deal.deal_uuid,
        "await publish confirmation",
        "publish confirmation failed",
        cancel,
        || {
            let chain = chain.clone();
            async move {
                chain.wait_for_publish(&publish_cid).await.map_err(|err| {
                    if err.is_transient() {
                        StepError::Transient(err.to_string())
                    } else {
                        StepError::fatal("publish rejected", err.to_string())
                    }
                })
            }
        },
    )
    .await?;

    deal.chain_deal_id = Some(chain_deal_id);
    provider.logger.info(
        deal.deal_uuid,
        "deal publish confirmed",
        serde_json::json!({ "chain_deal_id": chain_deal_id }),
    );

    advance(provider, deal, handler, Checkpoint::PublishConfirmed)?;
    // A deal resumed at `Published` after a restart had its publish funds
    // re-tagged; release them again now that confirmation is durable. In
    // the crash-free path this unwinds as a tolerated no-op.
    provider.release_publish_funds(deal.deal_uuid).await;
    Ok(())
}

/// `PublishConfirmed → AddedPiece`: hand the piece to the sealing
/// pipeline, then drop the staged copy and its reservation.
async fn add_piece_step(
    provider: &Provider,
    deal: &mut ProviderDealState,
    handler: &DealHandler,
    cancel: &CancellationToken,
) -> Result<(), ExecutionError> {
    let path = deal
        .inbound_file_path
        .clone()
        .ok_or_else(|| StepError::fatal("missing inbound file", "no inbound file path on deal"))?;
    let sealing = provider.sealing.clone();
    let deal_snapshot = deal.clone();

    let allocation = with_retries(
        provider,
        deal.deal_uuid,
        "hand piece to sealing pipeline",
        "sealing handoff failed",
        cancel,
        || {
            let sealing = sealing.clone();
            let deal = deal_snapshot.clone();
            let path = path.clone();
            async move {
                sealing.add_piece(&deal, &path).await.map_err(|err| {
                    if err.is_transient() {
                        StepError::Transient(err.to_string())
                    } else {
                        StepError::fatal("piece rejected", err.to_string())
                    }
                })
            }
        },
    )
    .await?;

    deal.sector = Some(allocation);
    provider.logger.info(
        deal.deal_uuid,
        "piece added to sector",
        serde_json::json!({
            "sector": allocation.sector_number,
            "offset": allocation.offset,
            "length": allocation.length,
        }),
    );

    // The sealing pipeline has its own copy now.
    let _ = tokio::fs::remove_file(&path).await.inspect_err(|err| {
        tracing::error!(%err, path = %path.display(), "failed to remove inbound file");
    });
    deal.inbound_file_path = None;

    advance(provider, deal, handler, Checkpoint::AddedPiece)?;
    provider.release_storage(deal.deal_uuid).await;
    Ok(())
}

/// `AddedPiece → IndexedAndAnnounced`: make the deal retrievable.
async fn announce_step(
    provider: &Provider,
    deal: &mut ProviderDealState,
    handler: &DealHandler,
    cancel: &CancellationToken,
) -> Result<(), ExecutionError> {
    let indexer = provider.indexer.clone();
    let deal_snapshot = deal.clone();

    let ad_cid = with_retries(
        provider,
        deal.deal_uuid,
        "announce deal",
        "announce failed",
        cancel,
        || {
            let indexer = indexer.clone();
            let deal = deal_snapshot.clone();
            async move {
                indexer
                    .announce_deal(&deal)
                    .await
                    .map_err(|err| StepError::Transient(err.to_string()))
            }
        },
    )
    .await?;

    provider.logger.info(
        deal.deal_uuid,
        "deal announced to index provider",
        serde_json::json!({ "ad_cid": ad_cid.to_string() }),
    );

    advance(provider, deal, handler, Checkpoint::IndexedAndAnnounced)?;
    Ok(())
}

/// `IndexedAndAnnounced → Complete`: the successful terminal transition
/// changes nothing but the checkpoint and the (empty) terminal reason, so
/// it goes through the database's own checkpoint stamping.
fn complete_step(
    provider: &Provider,
    deal: &mut ProviderDealState,
    handler: &DealHandler,
) -> Result<(), ExecutionError> {
    *deal = provider
        .db
        .update_checkpoint(deal.deal_uuid, Checkpoint::Complete, Some(String::new()))
        .map_err(|err| ExecutionError::Fatal {
            code: "failed to persist deal state".to_string(),
            detail: err.to_string(),
        })?;

    provider.logger.info(
        deal.deal_uuid,
        "deal checkpoint reached",
        serde_json::json!({ "checkpoint": Checkpoint::Complete.to_string() }),
    );
    handler.publish(deal.clone());
    Ok(())
}

/// Persist the new checkpoint, then announce it. The persisted checkpoint
/// never goes backwards; retries replay the same transition instead.
fn advance(
    provider: &Provider,
    deal: &mut ProviderDealState,
    handler: &DealHandler,
    checkpoint: Checkpoint,
) -> Result<(), ExecutionError> {
    deal.checkpoint = checkpoint;
    deal.checkpoint_at = Utc::now();
    provider.db.update(deal).map_err(|err| ExecutionError::Fatal {
        code: "failed to persist deal state".to_string(),
        detail: err.to_string(),
    })?;

    provider.logger.info(
        deal.deal_uuid,
        "deal checkpoint reached",
        serde_json::json!({ "checkpoint": checkpoint.to_string() }),
    );
    handler.publish(deal.clone());
    Ok(())
}

/// Mark the deal terminally failed (which includes user cancellation) and
/// drop the staged download if there is one.
async fn fail_deal(
    provider: &Provider,
    deal: &mut ProviderDealState,
    handler: &DealHandler,
    reason: String,
) {
    deal.err = reason;
    deal.checkpoint = Checkpoint::Complete;
    deal.checkpoint_at = Utc::now();
    if let Err(err) = provider.db.update(deal) {
        provider
            .logger
            .error(deal.deal_uuid, "failed to persist terminal deal state", err);
    }
    handler.publish(deal.clone());

    // Imported data belongs to the operator; only downloads are ours.
    if !deal.is_offline {
        if let Some(path) = &deal.inbound_file_path {
            let _ = tokio::fs::remove_file(path).await.inspect_err(|err| {
                tracing::error!(%err, path = %path.display(), "failed to remove staging file");
            });
        }
    }
}

/// Run `attempt_fn` until it succeeds, fails permanently, or exhausts the
/// retry budget, backing off exponentially (capped) in between.
async fn with_retries<T, F, Fut>(
    provider: &Provider,
    deal_uuid: uuid::Uuid,
    label: &str,
    exhausted_code: &str,
    cancel: &CancellationToken,
    mut attempt_fn: F,
) -> Result<T, ExecutionError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StepError>>,
{
    let mut attempt = 0;
    loop {
        // The attempt itself is raced against cancellation and shutdown;
        // an adapter call that blocks indefinitely must not pin the deal.
        let result = tokio::select! {
            result = attempt_fn() => result,
            _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
            _ = provider.token.cancelled() => return Err(ExecutionError::Shutdown),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(StepError::Transient(detail)) => {
                attempt += 1;
                if attempt >= MAX_RETRIES {
                    return Err(ExecutionError::Fatal {
                        code: exhausted_code.to_string(),
                        detail,
                    });
                }
                retry_pause(provider, deal_uuid, label, attempt, &detail, cancel).await?;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Wait out one backoff period, bailing early on cancellation/shutdown.
async fn retry_pause(
    provider: &Provider,
    deal_uuid: uuid::Uuid,
    label: &str,
    attempt: u32,
    detail: &str,
    cancel: &CancellationToken,
) -> Result<(), ExecutionError> {
    let delay = backoff_delay(attempt);
    provider.logger.warn(
        deal_uuid,
        "retrying deal execution step",
        serde_json::json!({
            "step": label,
            "attempt": attempt,
            "delay_ms": delay.as_millis() as u64,
            "err": detail,
        }),
    );

    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
        _ = provider.token.cancelled() => Err(ExecutionError::Shutdown),
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = RETRY_BASE_DELAY.saturating_mul(1 << exp);
    delay.min(RETRY_MAX_DELAY)
}
