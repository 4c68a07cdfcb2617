//! Durable deal state, backed by RocksDB.
//!
//! Each of the original store's tables maps onto a column family: the deal
//! rows keyed by UUID, a unique index from signed proposal CID to UUID, and
//! the append-only per-deal event log. Values are stored as JSON.

use std::{
    path::Path,
    sync::atomic::{AtomicU32, Ordering},
};

use chrono::{DateTime, Utc};
use cid::Cid;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options as DBOptions, WriteBatch,
    DB as RocksDB,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Checkpoint, ProposalError, ProviderDealState};

const DEALS_CF: &str = "deals";
const SIGNED_PROPOSALS_CF: &str = "signed_proposal_cids";
const DEAL_LOGS_CF: &str = "deal_logs";

const COLUMN_FAMILIES: [&str; 3] = [DEALS_CF, SIGNED_PROPOSALS_CF, DEAL_LOGS_CF];

#[derive(Debug, thiserror::Error)]
pub enum DBError {
    /// The deal was never stored. The acceptance path treats this as
    /// "available", everything else as a hard miss.
    #[error("deal {0} not found")]
    NotFound(Uuid),

    #[error("deal {0} already exists")]
    DuplicateUuid(Uuid),

    #[error("deal proposal {proposal_cid} already belongs to deal {existing}")]
    DuplicateProposal { proposal_cid: Cid, existing: Uuid },

    #[error("deal {deal}: checkpoint cannot go back from {from} to {to}")]
    CheckpointRegression {
        deal: Uuid,
        from: Checkpoint,
        to: Checkpoint,
    },

    #[error(transparent)]
    RocksDB(#[from] rocksdb::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Proposal(#[from] ProposalError),
}

/// Severity level of a [`DealLog`] entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One entry in a deal's append-only event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealLog {
    pub deal_uuid: Uuid,
    pub created_at: DateTime<Utc>,
    pub level: LogLevel,
    pub subsystem: String,
    pub message: String,
    pub params: serde_json::Value,
}

/// Store of all deal records and their event logs.
pub struct DealsDB {
    database: RocksDB,
    /// Breaks key ties between log entries appended within the same
    /// nanosecond, preserving append order.
    log_seq: AtomicU32,
}

impl DealsDB {
    pub fn open<P>(path: P) -> Result<Self, DBError>
    where
        P: AsRef<Path>,
    {
        let mut opts = DBOptions::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = COLUMN_FAMILIES
            .into_iter()
            .map(|cf_name| ColumnFamilyDescriptor::new(cf_name, DBOptions::default()));

        Ok(Self {
            database: RocksDB::open_cf_descriptors(&opts, path, cfs)?,
            log_seq: AtomicU32::new(0),
        })
    }

    fn cf_handle(&self, name: &str) -> &ColumnFamily {
        self.database
            .cf_handle(name)
            .expect("column family should have been initialized on database startup")
    }

    /// Insert a newly accepted deal.
    ///
    /// Both the deal UUID and the signed proposal CID must be unique;
    /// violations surface as [`DBError::DuplicateUuid`] and
    /// [`DBError::DuplicateProposal`] respectively.
    pub fn insert(&self, deal: &ProviderDealState) -> Result<(), DBError> {
        let proposal_cid = deal.signed_proposal_cid()?;

        if self
            .database
            .get_pinned_cf(self.cf_handle(DEALS_CF), deal.deal_uuid.as_bytes())?
            .is_some()
        {
            return Err(DBError::DuplicateUuid(deal.deal_uuid));
        }

        if let Some(existing) = self
            .database
            .get_pinned_cf(self.cf_handle(SIGNED_PROPOSALS_CF), proposal_cid.to_bytes())?
        {
            let existing = Uuid::from_slice(existing.as_ref())
                .expect("proposal index values are always deal UUIDs");
            return Err(DBError::DuplicateProposal {
                proposal_cid,
                existing,
            });
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf_handle(DEALS_CF),
            deal.deal_uuid.as_bytes(),
            serde_json::to_vec(deal)?,
        );
        batch.put_cf(
            self.cf_handle(SIGNED_PROPOSALS_CF),
            proposal_cid.to_bytes(),
            deal.deal_uuid.as_bytes(),
        );
        self.database.write(batch)?;

        Ok(())
    }

    pub fn by_id(&self, deal_uuid: Uuid) -> Result<Option<ProviderDealState>, DBError> {
        let Some(slice) = self
            .database
            .get_pinned_cf(self.cf_handle(DEALS_CF), deal_uuid.as_bytes())?
        else {
            return Ok(None);
        };

        Ok(Some(serde_json::from_slice(slice.as_ref())?))
    }

    pub fn by_signed_proposal_cid(
        &self,
        proposal_cid: &Cid,
    ) -> Result<Option<ProviderDealState>, DBError> {
        let Some(slice) = self
            .database
            .get_pinned_cf(self.cf_handle(SIGNED_PROPOSALS_CF), proposal_cid.to_bytes())?
        else {
            return Ok(None);
        };

        let deal_uuid = Uuid::from_slice(slice.as_ref())
            .expect("proposal index values are always deal UUIDs");
        self.by_id(deal_uuid)
    }

    /// All deals, oldest first.
    pub fn list(&self) -> Result<Vec<ProviderDealState>, DBError> {
        let mut deals = Vec::new();
        for item in self
            .database
            .iterator_cf(self.cf_handle(DEALS_CF), IteratorMode::Start)
        {
            let (_, value) = item?;
            deals.push(serde_json::from_slice(value.as_ref())?);
        }
        deals.sort_by_key(|deal: &ProviderDealState| deal.created_at);
        Ok(deals)
    }

    /// All deals that have not reached a terminal checkpoint, oldest first.
    pub fn list_active(&self) -> Result<Vec<ProviderDealState>, DBError> {
        let mut deals = self.list()?;
        deals.retain(|deal| !deal.is_complete());
        Ok(deals)
    }

    /// Persist the current state of an existing deal.
    ///
    /// The stored checkpoint may never move backwards; an attempt to do so
    /// fails with [`DBError::CheckpointRegression`].
    pub fn update(&self, deal: &ProviderDealState) -> Result<(), DBError> {
        let Some(stored) = self.by_id(deal.deal_uuid)? else {
            return Err(DBError::NotFound(deal.deal_uuid));
        };
        if stored.checkpoint > deal.checkpoint {
            return Err(DBError::CheckpointRegression {
                deal: deal.deal_uuid,
                from: stored.checkpoint,
                to: deal.checkpoint,
            });
        }

        self.database.put_cf(
            self.cf_handle(DEALS_CF),
            deal.deal_uuid.as_bytes(),
            serde_json::to_vec(deal)?,
        )?;
        Ok(())
    }

    /// Advance a deal to `checkpoint`, stamping `checkpoint_at` and,
    /// when given, the terminal error reason.
    ///
    /// Advancing to the checkpoint the deal is already at is a no-op.
    pub fn update_checkpoint(
        &self,
        deal_uuid: Uuid,
        checkpoint: Checkpoint,
        err: Option<String>,
    ) -> Result<ProviderDealState, DBError> {
        let Some(mut deal) = self.by_id(deal_uuid)? else {
            return Err(DBError::NotFound(deal_uuid));
        };
        if deal.checkpoint == checkpoint {
            return Ok(deal);
        }
        if deal.checkpoint > checkpoint {
            return Err(DBError::CheckpointRegression {
                deal: deal_uuid,
                from: deal.checkpoint,
                to: checkpoint,
            });
        }

        deal.checkpoint = checkpoint;
        deal.checkpoint_at = Utc::now();
        if let Some(err) = err {
            deal.err = err;
        }

        self.database.put_cf(
            self.cf_handle(DEALS_CF),
            deal_uuid.as_bytes(),
            serde_json::to_vec(&deal)?,
        )?;
        Ok(deal)
    }

    pub fn append_log(&self, log: &DealLog) -> Result<(), DBError> {
        let key = self.log_key(log);
        self.database
            .put_cf(self.cf_handle(DEAL_LOGS_CF), key, serde_json::to_vec(log)?)?;
        Ok(())
    }

    /// The deal's event log, in append order.
    pub fn logs(&self, deal_uuid: Uuid) -> Result<Vec<DealLog>, DBError> {
        let prefix = deal_uuid.as_bytes();
        let mut logs = Vec::new();
        for item in self.database.iterator_cf(
            self.cf_handle(DEAL_LOGS_CF),
            IteratorMode::From(prefix, rocksdb::Direction::Forward),
        ) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            logs.push(serde_json::from_slice(value.as_ref())?);
        }
        Ok(logs)
    }

    /// Log keys are `uuid ++ big-endian nanos ++ sequence` so a prefix scan
    /// yields a deal's entries in append order.
    fn log_key(&self, log: &DealLog) -> [u8; 28] {
        let mut key = [0u8; 28];
        key[..16].copy_from_slice(log.deal_uuid.as_bytes());
        let nanos = log.created_at.timestamp_nanos_opt().unwrap_or(0).max(0) as u64;
        key[16..24].copy_from_slice(&nanos.to_be_bytes());
        let seq = self.log_seq.fetch_add(1, Ordering::Relaxed);
        key[24..].copy_from_slice(&seq.to_be_bytes());
        key
    }
}
