//! Deal acceptance.
//!
//! Every stage of acceptance produces either a severe failure (an
//! infrastructure fault the operator needs to hear about) or a plain
//! rejection (a policy outcome the client needs to hear about). The event
//! loop composes the stages linearly and unwinds any reservations already
//! made when a later stage fails.

use std::{fmt, sync::Arc};

use chrono::Utc;

use crate::{
    adapters::filter::DealFilterParams,
    fund_manager::{FundManagerError, TagFundsResponse},
    provider::{AcceptDealRequest, Provider},
    storage_manager::StorageManagerError,
    types::{Checkpoint, DealRejectionInfo, ProviderDealState},
};

/// Why an acceptance stage did not go through.
pub(crate) enum AcceptError {
    /// Infrastructure fault. Logged at error level; the client only gets
    /// to see which stage fell over.
    Severe { stage: &'static str, error: String },
    /// Policy outcome. Logged at info level; the client sees the reason.
    Rejected { reason: String },
}

impl AcceptError {
    fn severe(stage: &'static str, error: impl fmt::Display) -> Self {
        AcceptError::Severe {
            stage,
            error: error.to_string(),
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        AcceptError::Rejected {
            reason: reason.into(),
        }
    }

    fn is_severe(&self) -> bool {
        matches!(self, AcceptError::Severe { .. })
    }

    /// The reason sent back to the client.
    fn client_reason(&self) -> String {
        match self {
            AcceptError::Severe { stage, .. } => format!("server error: {stage}"),
            AcceptError::Rejected { reason } => reason.clone(),
        }
    }
}

impl fmt::Display for AcceptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceptError::Severe { stage, error } => write!(f, "{stage}: {error}"),
            AcceptError::Rejected { reason } => f.write_str(reason),
        }
    }
}

impl Provider {
    /// Process one request off the accept channel.
    pub(crate) async fn handle_accept(self: &Arc<Self>, req: AcceptDealRequest) {
        let AcceptDealRequest {
            mut deal,
            handler,
            owns_handler,
            is_import,
            rsp,
        } = req;

        self.logger.info(
            deal.deal_uuid,
            "processing deal acceptance request",
            serde_json::json!({
                "is_offline": deal.is_offline,
                "is_import": is_import,
            }),
        );

        let result = if deal.is_offline {
            if is_import {
                // The operator is importing the deal data: tag funds for
                // the deal and execute it.
                self.process_import_offline_deal_data(&mut deal).await
            } else {
                // An offline proposal is only saved; execution starts when
                // the operator imports the data.
                match self.process_offline_deal_proposal(&mut deal, &handler) {
                    Ok(()) => {
                        let _ = rsp.send(DealRejectionInfo::accepted());
                        return;
                    }
                    Err(err) => Err(err),
                }
            }
        } else {
            self.process_deal_proposal(&mut deal).await
        };

        match result {
            Ok(()) => {
                if !is_import {
                    self.fire_new_deal(&deal);
                }
                handler.publish(deal.clone());
                self.spawn_fiber(deal, handler);
                let _ = rsp.send(DealRejectionInfo::accepted());
            }
            Err(err) => {
                if err.is_severe() {
                    self.logger.error(
                        deal.deal_uuid,
                        "error while processing deal acceptance request",
                        &err,
                    );
                } else {
                    self.logger.info(
                        deal.deal_uuid,
                        "deal acceptance request rejected",
                        serde_json::json!({ "reason": err.client_reason() }),
                    );
                }

                // A failed proposal has no deal left to subscribe to. A
                // failed import (or a collision with a live deal) leaves
                // the existing handler untouched.
                if owns_handler {
                    self.remove_handler(deal.deal_uuid);
                    handler.close();
                }

                let _ = rsp.send(DealRejectionInfo::rejected(err.client_reason()));
            }
        }
    }

    /// The full acceptance sequence for an online deal.
    async fn process_deal_proposal(
        &self,
        deal: &mut ProviderDealState,
    ) -> Result<(), AcceptError> {
        self.check_deal_proposal_unique(deal)?;
        self.check_deal_uuid_unique(deal)?;

        let sealing_state = self
            .sealing
            .get_status()
            .await
            .map_err(|err| AcceptError::severe("get sealing status", err))?;

        // Run the operator's decision logic.
        let decision = self
            .filter
            .filter(&DealFilterParams {
                deal: deal.params(),
                sealing_state,
            })
            .await
            .map_err(|err| AcceptError::severe("deal filter", err))?;
        if !decision.accept {
            return Err(AcceptError::rejected(decision.reason));
        }

        // Tag the funds required for collateral and for sending the publish
        // message, so other deals cannot claim them.
        match self.funds.tag_funds(deal.deal_uuid, deal.proposal()).await {
            Ok(resp) => self.log_funds(deal, &resp),
            Err(err @ FundManagerError::InsufficientFunds { .. }) => {
                self.cleanup_failed_acceptance(deal).await;
                self.logger.info(
                    deal.deal_uuid,
                    "not enough funds to accept deal",
                    serde_json::json!({ "err": err.to_string() }),
                );
                return Err(AcceptError::rejected(
                    "provider has insufficient funds to accept deal",
                ));
            }
            Err(err) => {
                self.cleanup_failed_acceptance(deal).await;
                return Err(AcceptError::severe("tag funds", err));
            }
        }

        // Tag the storage required for the deal in the staging area.
        match self.storage.tag(deal.deal_uuid, deal.transfer.size) {
            Ok(()) => {}
            Err(err @ StorageManagerError::NoSpaceLeft { .. }) => {
                self.cleanup_failed_acceptance(deal).await;
                self.logger.info(
                    deal.deal_uuid,
                    "not enough storage space to accept deal",
                    serde_json::json!({ "err": err.to_string() }),
                );
                return Err(AcceptError::rejected(
                    "provider has no space left for storage deals",
                ));
            }
            Err(err) => {
                self.cleanup_failed_acceptance(deal).await;
                return Err(AcceptError::severe("tag storage", err));
            }
        }

        // Create the staging file the deal data will be downloaded into.
        let download_path = self.storage.download_file_path(deal.deal_uuid);
        if let Err(err) = tokio::fs::File::create(&download_path).await {
            self.cleanup_failed_acceptance(deal).await;
            return Err(AcceptError::severe("creating download staging file", err));
        }
        deal.inbound_file_path = Some(download_path.clone());
        self.logger.info(
            deal.deal_uuid,
            "created deal download staging file",
            serde_json::json!({ "path": download_path.display().to_string() }),
        );

        // Write the deal state to the database.
        let now = Utc::now();
        deal.created_at = now;
        deal.checkpoint = Checkpoint::Accepted;
        deal.checkpoint_at = now;
        if let Err(err) = self.db.insert(deal) {
            self.cleanup_failed_acceptance(deal).await;
            return Err(AcceptError::severe("save to db", err));
        }

        self.logger.info(
            deal.deal_uuid,
            "inserted deal into deals db",
            serde_json::Value::Null,
        );

        Ok(())
    }

    /// Save an offline deal proposal; execution resumes when the operator
    /// imports the data.
    fn process_offline_deal_proposal(
        &self,
        deal: &mut ProviderDealState,
        handler: &Arc<crate::handler::DealHandler>,
    ) -> Result<(), AcceptError> {
        self.check_deal_proposal_unique(deal)?;
        self.check_deal_uuid_unique(deal)?;

        let now = Utc::now();
        deal.created_at = now;
        deal.checkpoint = Checkpoint::Accepted;
        deal.checkpoint_at = now;
        self.db
            .insert(deal)
            .map_err(|err| AcceptError::severe("save to db", err))?;

        self.logger.info(
            deal.deal_uuid,
            "inserted offline deal into deals db",
            serde_json::Value::Null,
        );

        self.fire_new_deal(deal);
        handler.publish(deal.clone());

        Ok(())
    }

    /// Acceptance of an offline deal's data import: only the funds still
    /// need tagging. Storage was taken care of when the data landed on the
    /// provider through its out-of-band path.
    async fn process_import_offline_deal_data(
        &self,
        deal: &mut ProviderDealState,
    ) -> Result<(), AcceptError> {
        match self.funds.tag_funds(deal.deal_uuid, deal.proposal()).await {
            Ok(resp) => self.log_funds(deal, &resp),
            Err(err @ FundManagerError::InsufficientFunds { .. }) => {
                self.cleanup_failed_acceptance(deal).await;
                self.logger.info(
                    deal.deal_uuid,
                    "not enough funds to accept deal",
                    serde_json::json!({ "err": err.to_string() }),
                );
                return Err(AcceptError::rejected(
                    "provider has insufficient funds to accept deal",
                ));
            }
            Err(err) => {
                self.cleanup_failed_acceptance(deal).await;
                return Err(AcceptError::severe("tag funds", err));
            }
        }

        // Persist where the imported data lives so a restart can resume
        // from the file.
        if let Err(err) = self.db.update(deal) {
            self.cleanup_failed_acceptance(deal).await;
            return Err(AcceptError::severe("save to db", err));
        }

        Ok(())
    }

    fn check_deal_proposal_unique(&self, deal: &ProviderDealState) -> Result<(), AcceptError> {
        let proposal_cid = deal
            .signed_proposal_cid()
            .map_err(|err| AcceptError::severe("signed proposal cid", err))?;

        match self.db.by_signed_proposal_cid(&proposal_cid) {
            // No deal with this signed proposal cid, so it's unique.
            Ok(None) => Ok(()),
            Ok(Some(existing)) => Err(AcceptError::rejected(format!(
                "deal proposal is identical to deal {} (proposed at {})",
                existing.deal_uuid, existing.created_at
            ))),
            Err(err) => Err(AcceptError::severe("lookup by proposal cid", err)),
        }
    }

    fn check_deal_uuid_unique(&self, deal: &ProviderDealState) -> Result<(), AcceptError> {
        match self.db.by_id(deal.deal_uuid) {
            Ok(None) => Ok(()),
            Ok(Some(existing)) => Err(AcceptError::rejected(format!(
                "deal has the same uuid as deal {} (proposed at {})",
                existing.deal_uuid, existing.created_at
            ))),
            Err(err) => Err(AcceptError::severe("lookup by deal uuid", err)),
        }
    }

    /// Unwind whatever a failed acceptance already reserved. Every step
    /// tolerates "nothing to release".
    async fn cleanup_failed_acceptance(&self, deal: &ProviderDealState) {
        match self.funds.untag_funds(deal.deal_uuid) {
            Ok(funds) => self.logger.info(
                deal.deal_uuid,
                "untagged funds for deal cleanup",
                serde_json::json!({
                    "untagged publish": funds.publish,
                    "untagged collateral": funds.collateral,
                }),
            ),
            Err(FundManagerError::NotFound(_)) => {}
            Err(err) => self.logger.error(
                deal.deal_uuid,
                "failed to untag funds during deal cleanup",
                err,
            ),
        }

        match self.storage.untag(deal.deal_uuid) {
            Ok(bytes) => self.logger.info(
                deal.deal_uuid,
                "untagged storage for deal cleanup",
                serde_json::json!({ "bytes": bytes }),
            ),
            Err(StorageManagerError::NotFound(_)) => {}
            Err(err) => self.logger.error(
                deal.deal_uuid,
                "failed to untag storage during deal cleanup",
                err,
            ),
        }

        // Imported data is the operator's file, not ours to delete.
        if !deal.is_offline {
            if let Some(path) = &deal.inbound_file_path {
                let _ = tokio::fs::remove_file(path).await.inspect_err(|err| {
                    tracing::error!(%err, path = %path.display(), "failed to remove staging file");
                });
            }
        }
    }

    fn log_funds(&self, deal: &ProviderDealState, resp: &TagFundsResponse) {
        self.logger.info(
            deal.deal_uuid,
            "tagged funds for deal",
            serde_json::json!({
                "tagged for deal publish": resp.publish,
                "tagged for deal collateral": resp.collateral,
                "total tagged for publish": resp.total_publish,
                "total tagged for collateral": resp.total_collateral,
                "total available for publish": resp.available_publish,
                "total available for collateral": resp.available_collateral,
            }),
        );
    }
}
