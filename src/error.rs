//! Error taxonomy for the indexing pipeline.

use thiserror::Error;

/// Errors surfaced by the chain adapter, the stores and the projectors.
///
/// The indexer decides per variant whether an error is fatal, retried or
/// skipped; see [`IndexerError::is_retryable`].
#[derive(Debug, Error)]
pub enum IndexerError {
    /// The node could not be reached, or a call timed out.
    #[error("connection error: {0}")]
    Connection(String),

    /// The node refused the requested block range; the caller must shrink it.
    #[error("block range {from}..={to} is too large")]
    RangeTooLarge { from: u64, to: u64 },

    /// A log whose shape is not one of the known event kinds.
    #[error("unknown event kind (topic0 {topic0}) in tx {tx_hash} at log index {log_index}")]
    UnknownEventKind {
        topic0: String,
        tx_hash: String,
        log_index: u64,
    },

    /// A projector failed to write derived state.
    #[error("projection write failed for {event_id}: {reason}")]
    ProjectionWrite { event_id: String, reason: String },

    /// Checkpoint or row storage failed outside of a projection.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl IndexerError {
    /// Returns `true` for transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Storage(_) | Self::ProjectionWrite { .. }
        )
    }
}

impl From<tokio_postgres::Error> for IndexerError {
    fn from(e: tokio_postgres::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for IndexerError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        Self::Storage(e.to_string())
    }
}
