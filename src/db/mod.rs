use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use log::{info, warn};

use crate::{config::Settings, error::IndexerError};

pub mod memory;
pub mod models;
pub mod postgres;
mod queries;

pub use memory::{MemoryCheckpointStore, MemoryProjectionStore};
pub use postgres::PostgresClient;
pub use queries::{Page, DEFAULT_HISTORY_LIMIT, DEFAULT_STATS_DAYS};

use models::{Checkpoint, DailyAggregate, EventKind, Notification, RawEvent, UserAggregate};

/// Durable single-value store for the last fully processed block.
///
/// `save` may be called concurrently; implementations only ever retain the
/// highest value they have seen.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self) -> Result<Option<Checkpoint>, IndexerError>;

    async fn save(&self, block_number: u64) -> Result<(), IndexerError>;
}

/// Sort direction for event queries, by `(block_number, log_index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Filter, order and page over `contract_events`.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub wallet: Option<String>,
    /// Empty means every kind.
    pub kinds: Vec<EventKind>,
    pub order: SortOrder,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl EventQuery {
    pub fn for_wallet(wallet: impl Into<String>) -> Self {
        Self {
            wallet: Some(wallet.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, event: &RawEvent) -> bool {
        self.wallet.as_deref().map_or(true, |w| event.wallet() == w)
            && (self.kinds.is_empty() || self.kinds.contains(&event.kind()))
    }
}

/// A wallet's notifications, newest first.
#[derive(Debug, Clone, Default)]
pub struct NotificationQuery {
    pub wallet: String,
    pub unread_only: bool,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// Row store backing the projectors and the read side.
///
/// Every write is an upsert or an insert-if-absent, so redelivered events
/// leave the store unchanged.
#[async_trait]
pub trait ProjectionStore: Send + Sync {
    /// Upsert by `(transaction_hash, log_index)`; keeps the first `observed_at`.
    async fn upsert_event(&self, event: &RawEvent) -> Result<(), IndexerError>;

    async fn query_events(&self, query: &EventQuery) -> Result<Vec<RawEvent>, IndexerError>;

    async fn upsert_user_aggregate(&self, aggregate: &UserAggregate) -> Result<(), IndexerError>;

    async fn user_aggregate(&self, wallet: &str) -> Result<Option<UserAggregate>, IndexerError>;

    async fn upsert_daily_aggregate(&self, aggregate: &DailyAggregate)
        -> Result<(), IndexerError>;

    /// Most recent `days` rollups, newest first.
    async fn daily_aggregates(&self, days: usize) -> Result<Vec<DailyAggregate>, IndexerError>;

    async fn daily_aggregate(&self, date: NaiveDate)
        -> Result<Option<DailyAggregate>, IndexerError>;

    /// Cumulative rollup as of the end of `date`, summed from stored events
    /// without loading them.
    async fn daily_totals(&self, date: NaiveDate) -> Result<DailyAggregate, IndexerError>;

    /// Dates of stored rollups on or after `date`, ascending.
    async fn daily_dates_from(&self, date: NaiveDate) -> Result<Vec<NaiveDate>, IndexerError>;

    /// Insert unless a notification with the same id exists. Returns `true` if inserted.
    async fn insert_notification_if_absent(
        &self,
        notification: &Notification,
    ) -> Result<bool, IndexerError>;

    async fn query_notifications(
        &self,
        query: &NotificationQuery,
    ) -> Result<Vec<Notification>, IndexerError>;

    /// Flip `read` on a notification. Returns `false` when it does not exist.
    async fn mark_notification_read(&self, id: &str) -> Result<bool, IndexerError>;
}

/// Storage handles shared by the indexer and the read side.
///
/// Backed by PostgreSQL when configured, otherwise by in-memory stores
/// (useful for local runs against a dev chain).
#[derive(Clone)]
pub struct Database {
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub projections: Arc<dyn ProjectionStore>,
}

impl Database {
    pub async fn new(settings: &Settings) -> anyhow::Result<Self> {
        match &settings.postgres {
            Some(pg) => {
                let postgres = PostgresClient::new(pg.clone(), settings.indexer.id.clone()).await?;

                // Run migrations
                postgres.migrate().await?;

                let postgres = Arc::new(postgres);
                info!("Using PostgreSQL storage");

                Ok(Self {
                    checkpoints: postgres.clone(),
                    projections: postgres,
                })
            },
            None => {
                warn!("No postgres section configured, using in-memory storage");
                Ok(Self::in_memory())
            },
        }
    }

    pub fn in_memory() -> Self {
        Self {
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            projections: Arc::new(MemoryProjectionStore::new()),
        }
    }
}
