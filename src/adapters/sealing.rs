//! Sealing pipeline operations consumed by the deal core.

use std::{collections::BTreeMap, path::Path};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::ProviderDealState;

/// Numeric identifier for a sector, relative to the provider.
pub type SectorNumber = u64;

/// Snapshot of the sealing pipeline, handed to the acceptance filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealingPipelineState {
    pub workers_total: usize,
    pub workers_free: usize,
    /// Tally of sectors per pipeline stage, keyed by stage name.
    pub sectors_by_state: BTreeMap<String, u64>,
}

/// Where a piece landed inside a sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorAllocation {
    pub sector_number: SectorNumber,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SealingError {
    #[error("sealing pipeline rpc: {0}")]
    Rpc(String),

    /// The pipeline refused the piece; retrying cannot help.
    #[error("piece rejected: {0}")]
    PieceRejected(String),
}

impl SealingError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SealingError::Rpc(_))
    }
}

#[async_trait]
pub trait SealingPipelineApi: Send + Sync {
    async fn get_status(&self) -> Result<SealingPipelineState, SealingError>;

    /// Hand the staged piece over to the sealing pipeline. Returns once the
    /// pipeline has ingested the data, after which the staging copy may be
    /// deleted.
    async fn add_piece(
        &self,
        deal: &ProviderDealState,
        piece_path: &Path,
    ) -> Result<SectorAllocation, SealingError>;
}
