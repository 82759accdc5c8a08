use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Indexer sync progress checkpoint (PostgreSQL).
///
/// Tracks the last fully processed block for a named indexer.
/// Used to resume indexing after restarts without unbounded backfill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,
    pub last_processed_block: u64,
    pub description: String,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(name: impl Into<String>, last_processed_block: u64) -> Self {
        Self {
            name: name.into(),
            last_processed_block,
            description: "Last processed block number for event listener".to_string(),
            updated_at: Utc::now(),
        }
    }
}
