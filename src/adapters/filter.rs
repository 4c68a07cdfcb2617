//! Operator-supplied deal acceptance filter.

use async_trait::async_trait;

use crate::{adapters::sealing::SealingPipelineState, types::DealParams};

/// Everything the filter gets to look at, once per acceptance.
#[derive(Debug, Clone)]
pub struct DealFilterParams {
    pub deal: DealParams,
    pub sealing_state: SealingPipelineState,
}

/// The filter's verdict. A non-empty `reason` on reject is echoed verbatim
/// to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterDecision {
    pub accept: bool,
    pub reason: String,
}

impl FilterDecision {
    pub fn accept() -> Self {
        Self {
            accept: true,
            reason: String::new(),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            accept: false,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("deal filter: {0}")]
    Failed(String),
}

/// Advisory accept/reject decision logic, invoked once per deal proposal.
#[async_trait]
pub trait StorageDealFilter: Send + Sync {
    async fn filter(&self, params: &DealFilterParams) -> Result<FilterDecision, FilterError>;
}
