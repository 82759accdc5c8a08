//! Projectors fold contract events into the read-models.
//!
//! Each event kind has one [`Projector`]. Applying an event:
//!
//! 1. upserts the [`RawEvent`] by identity
//! 2. rebuilds the wallet's [`UserAggregate`] from its full history
//! 3. rebuilds the [`DailyAggregate`](crate::db::models::DailyAggregate)
//!    for the event's UTC date and every later day already stored
//! 4. inserts the event's [`Notification`] unless it already exists
//!
//! Every step is an upsert or an insert-if-absent, so applying the same
//! event twice leaves the store exactly as applying it once.

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use rustc_hash::FxHashMap;

use crate::{
    db::{
        models::{EventKind, Notification, RawEvent, UserAggregate},
        EventQuery, ProjectionStore,
    },
    error::IndexerError,
};

mod reward;
mod stake;
mod transfer;

pub use reward::RewardClaimProjector;
pub use stake::StakeProjector;
pub use transfer::RewardTransferProjector;

#[async_trait]
pub trait Projector: Send + Sync {
    /// The event kind this projector handles.
    fn kind(&self) -> EventKind;

    async fn apply(&self, event: &RawEvent) -> Result<(), IndexerError>;
}

/// Steps shared by every projector. Store failures become
/// [`IndexerError::ProjectionWrite`] tagged with the event identity.
pub async fn project(store: &dyn ProjectionStore, event: &RawEvent) -> Result<(), IndexerError> {
    let fail = |e: IndexerError| IndexerError::ProjectionWrite {
        event_id: event.id().to_string(),
        reason: e.to_string(),
    };

    store.upsert_event(event).await.map_err(fail)?;

    let wallet = event.wallet();
    let history = store
        .query_events(&EventQuery::for_wallet(wallet))
        .await
        .map_err(fail)?;
    if let Some(aggregate) = UserAggregate::from_history(wallet, &history) {
        store.upsert_user_aggregate(&aggregate).await.map_err(fail)?;
    }

    // Rollups are cumulative, so every stored day from the event's onward moves.
    let date = event.observed_at.date_naive();
    let mut dates = store.daily_dates_from(date).await.map_err(fail)?;
    if dates.first() != Some(&date) {
        dates.insert(0, date);
    }
    for day in dates {
        let totals = store.daily_totals(day).await.map_err(fail)?;
        store.upsert_daily_aggregate(&totals).await.map_err(fail)?;
    }

    let notification = Notification::for_event(event);
    if !store
        .insert_notification_if_absent(&notification)
        .await
        .map_err(fail)?
    {
        debug!("Notification {} already sent", notification.id);
    }

    Ok(())
}

fn ensure_kind(expected: EventKind, event: &RawEvent) -> Result<(), IndexerError> {
    if event.kind() == expected {
        Ok(())
    } else {
        Err(IndexerError::ProjectionWrite {
            event_id: event.id().to_string(),
            reason: format!("{} projector received a {} event", expected, event.kind()),
        })
    }
}

/// Projectors keyed by the event kind they handle.
pub struct ProjectorRegistry {
    projectors: FxHashMap<EventKind, Vec<Arc<dyn Projector>>>,
}

impl ProjectorRegistry {
    pub fn new() -> Self {
        Self {
            projectors: FxHashMap::default(),
        }
    }

    /// One projector for every known kind, all writing to `store`.
    pub fn with_defaults(store: Arc<dyn ProjectionStore>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(StakeProjector::opened(store.clone())));
        registry.register(Arc::new(StakeProjector::closed(store.clone())));
        registry.register(Arc::new(RewardClaimProjector::new(store.clone())));
        registry.register(Arc::new(RewardTransferProjector::new(store)));
        registry
    }

    pub fn register(&mut self, projector: Arc<dyn Projector>) {
        self.projectors
            .entry(projector.kind())
            .or_default()
            .push(projector);
    }

    /// Apply `event` to every projector registered for its kind, in
    /// registration order. Stops at the first failure.
    pub async fn dispatch(&self, event: &RawEvent) -> Result<(), IndexerError> {
        match self.projectors.get(&event.kind()) {
            Some(projectors) => {
                for projector in projectors {
                    projector.apply(event).await?;
                }
            },
            None => debug!("No projector registered for {}", event.kind()),
        }
        Ok(())
    }
}

impl Default for ProjectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
