//! Event ingestion: log normalization, the indexing state machine and the
//! handle that starts and stops it.

pub mod control;
pub mod indexer;
pub mod normalizer;

pub use control::IndexerHandle;
pub use indexer::{BlockRange, Indexer, IndexerState, IndexerStatus};
pub use normalizer::{Normalizer, EVENT_SIGNATURES};
