//! Read-side helpers over the projection store.

use chrono::NaiveDate;

use crate::{
    db::{
        models::{DailyAggregate, EventKind, Notification, RawEvent, UserAggregate},
        Database, EventQuery, NotificationQuery, SortOrder,
    },
    error::IndexerError,
};

pub const DEFAULT_STATS_DAYS: usize = 30;
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// A page over a wallet's history, newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: DEFAULT_HISTORY_LIMIT,
            offset: 0,
        }
    }
}

impl Database {
    pub async fn notifications(
        &self,
        wallet: &str,
        unread_only: bool,
    ) -> Result<Vec<Notification>, IndexerError> {
        self.projections
            .query_notifications(&NotificationQuery {
                wallet: wallet.to_lowercase(),
                unread_only,
                ..Default::default()
            })
            .await
    }

    pub async fn mark_notification_read(&self, id: &str) -> Result<bool, IndexerError> {
        self.projections.mark_notification_read(id).await
    }

    /// Most recent daily rollups, newest first. `None` means 30 days.
    pub async fn daily_stats(
        &self,
        days: Option<usize>,
    ) -> Result<Vec<DailyAggregate>, IndexerError> {
        self.projections
            .daily_aggregates(days.unwrap_or(DEFAULT_STATS_DAYS))
            .await
    }

    pub async fn daily_stats_on(
        &self,
        date: NaiveDate,
    ) -> Result<Option<DailyAggregate>, IndexerError> {
        self.projections.daily_aggregate(date).await
    }

    pub async fn user_summary(&self, wallet: &str) -> Result<Option<UserAggregate>, IndexerError> {
        self.projections.user_aggregate(&wallet.to_lowercase()).await
    }

    /// Stake opened and closed events for `wallet`.
    pub async fn stake_history(
        &self,
        wallet: &str,
        page: Page,
    ) -> Result<Vec<RawEvent>, IndexerError> {
        self.history(wallet, vec![EventKind::StakeOpened, EventKind::StakeClosed], page)
            .await
    }

    /// Reward claims for `wallet`.
    pub async fn reward_history(
        &self,
        wallet: &str,
        page: Page,
    ) -> Result<Vec<RawEvent>, IndexerError> {
        self.history(wallet, vec![EventKind::RewardClaimed], page).await
    }

    async fn history(
        &self,
        wallet: &str,
        kinds: Vec<EventKind>,
        page: Page,
    ) -> Result<Vec<RawEvent>, IndexerError> {
        self.projections
            .query_events(&EventQuery {
                kinds,
                order: SortOrder::Descending,
                limit: Some(page.limit),
                offset: page.offset,
                ..EventQuery::for_wallet(wallet.to_lowercase())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projectors::{
        project,
        test_support::{claimed, event, staked, unstaked, ETHER},
    };

    async fn seeded() -> Database {
        let db = Database::in_memory();
        let events = [
            event(staked("0xaa", ETHER), 10, 0),
            event(claimed("0xaa", ETHER / 10), 11, 0),
            event(unstaked("0xaa", ETHER / 2), 12, 1),
            event(staked("0xbb", ETHER), 13, 0),
        ];
        for e in &events {
            project(db.projections.as_ref(), e).await.unwrap();
        }
        db
    }

    #[tokio::test]
    async fn history_is_newest_first_and_paged() {
        let db = seeded().await;

        let stakes = db.stake_history("0xAA", Page::default()).await.unwrap();
        assert_eq!(
            stakes.iter().map(|e| e.block_number).collect::<Vec<_>>(),
            vec![12, 10]
        );

        let second = db
            .stake_history("0xaa", Page { limit: 1, offset: 1 })
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].block_number, 10);

        let rewards = db.reward_history("0xaa", Page::default()).await.unwrap();
        assert_eq!(rewards.len(), 1);
        assert_eq!(rewards[0].kind(), EventKind::RewardClaimed);
    }

    #[tokio::test]
    async fn notifications_can_be_marked_read() {
        let db = seeded().await;

        let all = db.notifications("0xaa", false).await.unwrap();
        assert_eq!(all.len(), 3);

        assert!(db.mark_notification_read(&all[0].id).await.unwrap());
        assert!(!db.mark_notification_read("0xmissing:0").await.unwrap());
        assert_eq!(db.notifications("0xaa", true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn summary_and_stats() {
        let db = seeded().await;

        let summary = db.user_summary("0xaa").await.unwrap().unwrap();
        assert_eq!(summary.stake_event_count, 2);
        assert!(db.user_summary("0xcc").await.unwrap().is_none());

        let stats = db.daily_stats(None).await.unwrap();
        assert!(!stats.is_empty());
        assert_eq!(stats[0].total_users, 2);
        let day = db.daily_stats_on(stats[0].date).await.unwrap();
        assert_eq!(day.as_ref(), Some(&stats[0]));
        let before = NaiveDate::from_ymd_opt(2025, 12, 31).unwrap();
        assert!(db.daily_stats_on(before).await.unwrap().is_none());
    }
}
