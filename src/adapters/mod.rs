//! Narrow interfaces to the subsystems the deal core coordinates.
//!
//! The core never talks to a chain node, sealing pipeline, data transport,
//! deal filter or index announcer directly; each is consumed through one of
//! the traits below so the daemon can wire real clients and the tests can
//! wire the in-process [`devnet`](crate::devnet) doubles.

pub mod chain;
pub mod filter;
pub mod indexer;
pub mod sealing;
pub mod transport;

pub use chain::{ChainClient, ChainError};
pub use filter::{DealFilterParams, FilterDecision, FilterError, StorageDealFilter};
pub use indexer::{AnnounceError, IndexAnnouncer};
pub use sealing::{SealingError, SealingPipelineApi, SealingPipelineState, SectorAllocation};
pub use transport::{Transport, TransportError};
