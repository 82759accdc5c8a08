//! In-memory stores for tests and ephemeral indexers.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rustc_hash::FxHashMap;

use crate::{
    db::{
        models::{Checkpoint, DailyAggregate, EventId, Notification, RawEvent, UserAggregate},
        CheckpointStore, EventQuery, NotificationQuery, ProjectionStore, SortOrder,
    },
    error::IndexerError,
};

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, IndexerError> {
    m.lock()
        .map_err(|_| IndexerError::Storage("memory store lock poisoned".to_string()))
}

fn page<T>(items: impl Iterator<Item = T>, offset: usize, limit: Option<usize>) -> Vec<T> {
    items.skip(offset).take(limit.unwrap_or(usize::MAX)).collect()
}

// ─── Checkpoints ──────────────────────────────────────────────────────────────

/// Checkpoint store that keeps the highest saved block.
pub struct MemoryCheckpointStore {
    name: String,
    data: Mutex<Option<Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::named("stake-indexer")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: Mutex::new(None),
        }
    }
}

impl Default for MemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self) -> Result<Option<Checkpoint>, IndexerError> {
        Ok(lock(&self.data)?.clone())
    }

    async fn save(&self, block_number: u64) -> Result<(), IndexerError> {
        let mut data = lock(&self.data)?;
        match data.as_mut() {
            Some(cp) if cp.last_processed_block >= block_number => {},
            Some(cp) => {
                cp.last_processed_block = block_number;
                cp.updated_at = Utc::now();
            },
            None => *data = Some(Checkpoint::new(self.name.clone(), block_number)),
        }
        Ok(())
    }
}

// ─── Projections ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct Tables {
    events: BTreeMap<EventId, RawEvent>,
    users: FxHashMap<String, UserAggregate>,
    daily: BTreeMap<NaiveDate, DailyAggregate>,
    notifications: BTreeMap<String, Notification>,
}

/// Projection store holding every table in maps behind one lock.
#[derive(Default)]
pub struct MemoryProjectionStore {
    tables: Mutex<Tables>,
    #[cfg(test)]
    fail_writes: std::sync::atomic::AtomicBool,
}

impl MemoryProjectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored contract events.
    pub fn event_count(&self) -> usize {
        self.tables.lock().map(|t| t.events.len()).unwrap_or(0)
    }

    /// Number of stored notifications.
    pub fn notification_count(&self) -> usize {
        self.tables.lock().map(|t| t.notifications.len()).unwrap_or(0)
    }

    /// Make every subsequent write fail, to exercise projection error paths.
    #[cfg(test)]
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn check_writable(&self) -> Result<(), IndexerError> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(IndexerError::Storage("injected write failure".to_string()));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn check_writable(&self) -> Result<(), IndexerError> {
        Ok(())
    }
}

#[async_trait]
impl ProjectionStore for MemoryProjectionStore {
    async fn upsert_event(&self, event: &RawEvent) -> Result<(), IndexerError> {
        self.check_writable()?;
        let mut tables = lock(&self.tables)?;
        let observed_at = tables
            .events
            .get(&event.id())
            .map(|existing| existing.observed_at)
            .unwrap_or(event.observed_at);
        tables.events.insert(
            event.id(),
            RawEvent {
                observed_at,
                ..event.clone()
            },
        );
        Ok(())
    }

    async fn query_events(&self, query: &EventQuery) -> Result<Vec<RawEvent>, IndexerError> {
        let tables = lock(&self.tables)?;
        let mut events: Vec<RawEvent> =
            tables.events.values().filter(|e| query.matches(e)).cloned().collect();
        events.sort_by_key(|e| e.ordering_key());
        if query.order == SortOrder::Descending {
            events.reverse();
        }
        Ok(page(events.into_iter(), query.offset, query.limit))
    }

    async fn upsert_user_aggregate(&self, aggregate: &UserAggregate) -> Result<(), IndexerError> {
        self.check_writable()?;
        lock(&self.tables)?
            .users
            .insert(aggregate.wallet_id.clone(), aggregate.clone());
        Ok(())
    }

    async fn user_aggregate(&self, wallet: &str) -> Result<Option<UserAggregate>, IndexerError> {
        Ok(lock(&self.tables)?.users.get(wallet).cloned())
    }

    async fn upsert_daily_aggregate(
        &self,
        aggregate: &DailyAggregate,
    ) -> Result<(), IndexerError> {
        self.check_writable()?;
        lock(&self.tables)?
            .daily
            .insert(aggregate.date, aggregate.clone());
        Ok(())
    }

    async fn daily_aggregates(&self, days: usize) -> Result<Vec<DailyAggregate>, IndexerError> {
        let tables = lock(&self.tables)?;
        Ok(tables.daily.values().rev().take(days).cloned().collect())
    }

    async fn daily_aggregate(
        &self,
        date: NaiveDate,
    ) -> Result<Option<DailyAggregate>, IndexerError> {
        Ok(lock(&self.tables)?.daily.get(&date).cloned())
    }

    async fn daily_totals(&self, date: NaiveDate) -> Result<DailyAggregate, IndexerError> {
        let tables = lock(&self.tables)?;
        let upto: Vec<RawEvent> = tables
            .events
            .values()
            .filter(|e| e.observed_at.date_naive() <= date)
            .cloned()
            .collect();
        Ok(DailyAggregate::from_history(date, &upto))
    }

    async fn daily_dates_from(&self, date: NaiveDate) -> Result<Vec<NaiveDate>, IndexerError> {
        Ok(lock(&self.tables)?.daily.range(date..).map(|(d, _)| *d).collect())
    }

    async fn insert_notification_if_absent(
        &self,
        notification: &Notification,
    ) -> Result<bool, IndexerError> {
        self.check_writable()?;
        let mut tables = lock(&self.tables)?;
        if tables.notifications.contains_key(&notification.id) {
            return Ok(false);
        }
        tables
            .notifications
            .insert(notification.id.clone(), notification.clone());
        Ok(true)
    }

    async fn query_notifications(
        &self,
        query: &NotificationQuery,
    ) -> Result<Vec<Notification>, IndexerError> {
        let tables = lock(&self.tables)?;
        let mut found: Vec<Notification> = tables
            .notifications
            .values()
            .filter(|n| n.user_wallet == query.wallet && !(query.unread_only && n.read))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(page(found.into_iter(), query.offset, query.limit))
    }

    async fn mark_notification_read(&self, id: &str) -> Result<bool, IndexerError> {
        self.check_writable()?;
        let mut tables = lock(&self.tables)?;
        Ok(match tables.notifications.get_mut(id) {
            Some(n) => {
                n.read = true;
                true
            },
            None => false,
        })
    }
}
