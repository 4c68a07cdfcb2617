//! Data transfer operations consumed by the deal core.

use std::path::Path;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::types::Transfer;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transfer failed: {0}")]
    Failed(String),

    #[error("malformed transfer params: {0}")]
    InvalidParams(String),

    #[error("transfer cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Failed(_) | TransportError::Io(_))
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch the deal data described by `transfer` into `dest`.
    ///
    /// Running byte totals are reported on `progress` as the transfer
    /// advances; the final size is returned. Implementations must observe
    /// `cancel` between chunks and bail out with
    /// [`TransportError::Cancelled`].
    async fn execute(
        &self,
        deal_uuid: Uuid,
        transfer: &Transfer,
        dest: &Path,
        progress: mpsc::UnboundedSender<u64>,
        cancel: CancellationToken,
    ) -> Result<u64, TransportError>;

    /// Bytes received so far for the given deal, for progress reporting.
    fn transferred(&self, deal_uuid: Uuid) -> u64;
}
