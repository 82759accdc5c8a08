use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use log::error;
use tokio_postgres::{types::ToSql, Row};

use crate::{
    db::{
        models::{
            Checkpoint, DailyAggregate, EventKind, EventPayload, Notification, NotificationKind,
            RawEvent, UserAggregate,
        },
        postgres::PostgresClient,
        CheckpointStore, EventQuery, NotificationQuery, ProjectionStore, SortOrder,
    },
    error::IndexerError,
    utils::parse_u256,
};

type Param = Box<dyn ToSql + Sync + Send>;

/// Sanitize a string for PostgreSQL by removing null bytes (0x00)
/// which are invalid in UTF-8 text columns
fn sanitize_string(s: &str) -> String {
    s.replace('\0', "")
}

fn to_i64(value: u64, what: &str) -> Result<i64, IndexerError> {
    i64::try_from(value).map_err(|_| IndexerError::Storage(format!("{what} {value} exceeds BIGINT")))
}

fn corrupt(what: &str, detail: impl std::fmt::Display) -> IndexerError {
    IndexerError::Storage(format!("corrupt {what} row: {detail}"))
}

// ==================== CHECKPOINTS ====================

#[async_trait]
impl CheckpointStore for PostgresClient {
    async fn load(&self) -> Result<Option<Checkpoint>, IndexerError> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT name, last_processed_block, description, updated_at
            FROM indexer.checkpoints
            WHERE name = $1
        "#;

        let row = client.query_opt(query, &[&self.checkpoint_name]).await?;

        row.map(|r| {
            let block: i64 = r.get("last_processed_block");
            Ok(Checkpoint {
                name: r.get("name"),
                last_processed_block: u64::try_from(block)
                    .map_err(|_| corrupt("checkpoint", block))?,
                description: r.get("description"),
                updated_at: r.get("updated_at"),
            })
        })
        .transpose()
    }

    /// Monotonic upsert: a lower block than the stored one is a no-op.
    async fn save(&self, block_number: u64) -> Result<(), IndexerError> {
        let checkpoint = Checkpoint::new(self.checkpoint_name.clone(), block_number);
        let client = self.pool.get().await?;
        let query = r#"
            INSERT INTO indexer.checkpoints (name, last_processed_block, description, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO UPDATE SET
                last_processed_block = EXCLUDED.last_processed_block,
                updated_at = EXCLUDED.updated_at
            WHERE indexer.checkpoints.last_processed_block < EXCLUDED.last_processed_block
        "#;

        client
            .execute(
                query,
                &[
                    &checkpoint.name,
                    &to_i64(block_number, "block")?,
                    &checkpoint.description,
                    &checkpoint.updated_at,
                ],
            )
            .await
            .map_err(|e| {
                error!("Failed to save checkpoint {} at {}: {:?}", checkpoint.name, block_number, e);
                e
            })?;

        Ok(())
    }
}

// ==================== PROJECTIONS ====================

#[async_trait]
impl ProjectionStore for PostgresClient {
    async fn upsert_event(&self, event: &RawEvent) -> Result<(), IndexerError> {
        let client = self.pool.get().await?;
        // observed_at is left untouched on conflict: the first observation wins.
        let query = r#"
            INSERT INTO indexer.contract_events (
                transaction_hash, log_index, event_name, contract_address,
                block_number, user_address, event_data, observed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (transaction_hash, log_index) DO UPDATE SET
                event_name = EXCLUDED.event_name,
                contract_address = EXCLUDED.contract_address,
                block_number = EXCLUDED.block_number,
                user_address = EXCLUDED.user_address,
                event_data = EXCLUDED.event_data
        "#;

        let event_data = serde_json::to_value(event.arguments())
            .map_err(|e| IndexerError::Storage(e.to_string()))?;

        client
            .execute(
                query,
                &[
                    &event.transaction_hash,
                    &to_i64(event.log_index, "log index")?,
                    &event.kind().as_str(),
                    &event.contract_address,
                    &to_i64(event.block_number, "block")?,
                    &sanitize_string(event.wallet()),
                    &event_data,
                    &event.observed_at,
                ],
            )
            .await
            .map_err(|e| {
                error!("Failed to upsert event {}: {:?}", event.id(), e);
                e
            })?;

        Ok(())
    }

    async fn query_events(&self, query: &EventQuery) -> Result<Vec<RawEvent>, IndexerError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<Param> = Vec::new();

        if let Some(wallet) = &query.wallet {
            params.push(Box::new(wallet.clone()));
            clauses.push(format!("user_address = ${}", params.len()));
        }
        if !query.kinds.is_empty() {
            let kinds: Vec<String> = query.kinds.iter().map(|k| k.as_str().to_string()).collect();
            params.push(Box::new(kinds));
            clauses.push(format!("event_name = ANY(${})", params.len()));
        }

        let direction = match query.order {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        };
        let mut sql = String::from(
            "SELECT transaction_hash, log_index, event_name, contract_address, \
             block_number, event_data, observed_at FROM indexer.contract_events",
        );
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY block_number {direction}, log_index {direction}"));
        if let Some(limit) = query.limit {
            params.push(Box::new(limit as i64));
            sql.push_str(&format!(" LIMIT ${}", params.len()));
        }
        if query.offset > 0 {
            params.push(Box::new(query.offset as i64));
            sql.push_str(&format!(" OFFSET ${}", params.len()));
        }

        let refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();

        let client = self.pool.get().await?;
        let rows = client.query(&sql, &refs).await?;
        rows.iter().map(row_to_event).collect()
    }

    async fn upsert_user_aggregate(&self, aggregate: &UserAggregate) -> Result<(), IndexerError> {
        let client = self.pool.get().await?;
        let query = r#"
            INSERT INTO indexer.users (
                wallet_address, total_staked, total_rewards_earned, stake_count,
                last_activity_at, updated_at
            ) VALUES ($1, $2::text::numeric, $3::text::numeric, $4, $5, NOW())
            ON CONFLICT (wallet_address) DO UPDATE SET
                total_staked = EXCLUDED.total_staked,
                total_rewards_earned = EXCLUDED.total_rewards_earned,
                stake_count = EXCLUDED.stake_count,
                last_activity_at = EXCLUDED.last_activity_at,
                updated_at = NOW()
        "#;

        client
            .execute(
                query,
                &[
                    &aggregate.wallet_id,
                    &aggregate.total_staked.to_string(),
                    &aggregate.total_rewards_earned.to_string(),
                    &to_i64(aggregate.stake_event_count, "stake count")?,
                    &aggregate.last_activity_at,
                ],
            )
            .await
            .map_err(|e| {
                error!("Failed to upsert user aggregate {}: {:?}", aggregate.wallet_id, e);
                e
            })?;

        Ok(())
    }

    async fn user_aggregate(&self, wallet: &str) -> Result<Option<UserAggregate>, IndexerError> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT wallet_address, total_staked::text AS total_staked,
                   total_rewards_earned::text AS total_rewards_earned,
                   stake_count, last_activity_at
            FROM indexer.users
            WHERE wallet_address = $1
        "#;

        let row = client.query_opt(query, &[&wallet]).await?;
        row.as_ref().map(row_to_user).transpose()
    }

    async fn upsert_daily_aggregate(
        &self,
        aggregate: &DailyAggregate,
    ) -> Result<(), IndexerError> {
        let client = self.pool.get().await?;
        let query = r#"
            INSERT INTO indexer.daily_stats (
                date, total_staked, total_users, total_rewards_distributed,
                average_stake_amount, updated_at
            ) VALUES ($1, $2::text::numeric, $3, $4::text::numeric, $5::text::numeric, NOW())
            ON CONFLICT (date) DO UPDATE SET
                total_staked = EXCLUDED.total_staked,
                total_users = EXCLUDED.total_users,
                total_rewards_distributed = EXCLUDED.total_rewards_distributed,
                average_stake_amount = EXCLUDED.average_stake_amount,
                updated_at = NOW()
        "#;

        client
            .execute(
                query,
                &[
                    &aggregate.date,
                    &aggregate.total_staked.to_string(),
                    &to_i64(aggregate.total_users, "user count")?,
                    &aggregate.total_rewards_distributed.to_string(),
                    &aggregate.average_stake_amount.to_string(),
                ],
            )
            .await
            .map_err(|e| {
                error!("Failed to upsert daily aggregate {}: {:?}", aggregate.date, e);
                e
            })?;

        Ok(())
    }

    async fn daily_aggregates(&self, days: usize) -> Result<Vec<DailyAggregate>, IndexerError> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT date, total_staked::text AS total_staked, total_users,
                   total_rewards_distributed::text AS total_rewards_distributed,
                   average_stake_amount::text AS average_stake_amount
            FROM indexer.daily_stats
            ORDER BY date DESC
            LIMIT $1
        "#;

        let rows = client.query(query, &[&(days as i64)]).await?;
        rows.iter().map(row_to_daily).collect()
    }

    async fn daily_aggregate(
        &self,
        date: NaiveDate,
    ) -> Result<Option<DailyAggregate>, IndexerError> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT date, total_staked::text AS total_staked, total_users,
                   total_rewards_distributed::text AS total_rewards_distributed,
                   average_stake_amount::text AS average_stake_amount
            FROM indexer.daily_stats
            WHERE date = $1
        "#;

        let row = client.query_opt(query, &[&date]).await?;
        row.as_ref().map(row_to_daily).transpose()
    }

    async fn daily_totals(&self, date: NaiveDate) -> Result<DailyAggregate, IndexerError> {
        let next_day = date
            .succ_opt()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|d| d.and_utc())
            .ok_or_else(|| IndexerError::Storage(format!("no day after {date}")))?;

        let client = self.pool.get().await?;
        let query = r#"
            WITH upto AS (
                SELECT user_address, event_name, (event_data->>'amount')::numeric AS amount
                FROM indexer.contract_events
                WHERE observed_at < $1
                  AND event_name IN ($2, $3, $4)
            ),
            stakes AS (
                SELECT user_address,
                       GREATEST(
                           COALESCE(SUM(amount) FILTER (WHERE event_name = $2), 0)
                         - COALESCE(SUM(amount) FILTER (WHERE event_name = $3), 0),
                           0
                       ) AS net
                FROM upto
                WHERE event_name IN ($2, $3)
                GROUP BY user_address
            )
            SELECT
                (SELECT COALESCE(SUM(net), 0) FROM stakes)::text AS total_staked,
                (SELECT COUNT(*) FROM stakes) AS total_users,
                (SELECT COALESCE(SUM(amount), 0) FROM upto WHERE event_name = $4)::text
                    AS total_rewards_distributed
        "#;

        let row = client
            .query_one(
                query,
                &[
                    &next_day,
                    &EventKind::StakeOpened.as_str(),
                    &EventKind::StakeClosed.as_str(),
                    &EventKind::RewardClaimed.as_str(),
                ],
            )
            .await?;

        Ok(DailyAggregate::from_totals(
            date,
            numeric(&row, "total_staked")?,
            unsigned(&row, "total_users")?,
            numeric(&row, "total_rewards_distributed")?,
        ))
    }

    async fn daily_dates_from(&self, date: NaiveDate) -> Result<Vec<NaiveDate>, IndexerError> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT date FROM indexer.daily_stats
            WHERE date >= $1
            ORDER BY date
        "#;

        let rows = client.query(query, &[&date]).await?;
        Ok(rows.iter().map(|r| r.get("date")).collect())
    }

    async fn insert_notification_if_absent(
        &self,
        notification: &Notification,
    ) -> Result<bool, IndexerError> {
        let client = self.pool.get().await?;
        let query = r#"
            INSERT INTO indexer.notifications (
                id, user_wallet, title, message, kind, read, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            ON CONFLICT (id) DO NOTHING
        "#;

        let inserted = client
            .execute(
                query,
                &[
                    &notification.id,
                    &notification.user_wallet,
                    &sanitize_string(&notification.title),
                    &sanitize_string(&notification.message),
                    &notification.kind.as_str(),
                    &notification.read,
                    &notification.created_at,
                ],
            )
            .await
            .map_err(|e| {
                error!("Failed to insert notification {}: {:?}", notification.id, e);
                e
            })?;

        Ok(inserted == 1)
    }

    async fn query_notifications(
        &self,
        query: &NotificationQuery,
    ) -> Result<Vec<Notification>, IndexerError> {
        let client = self.pool.get().await?;
        let sql = r#"
            SELECT id, user_wallet, title, message, kind, read, created_at
            FROM indexer.notifications
            WHERE user_wallet = $1 AND (NOT $2 OR read = FALSE)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
        "#;

        let limit = query.limit.map_or(i64::MAX, |l| l as i64);
        let rows = client
            .query(
                sql,
                &[&query.wallet, &query.unread_only, &limit, &(query.offset as i64)],
            )
            .await?;
        rows.iter().map(row_to_notification).collect()
    }

    async fn mark_notification_read(&self, id: &str) -> Result<bool, IndexerError> {
        let client = self.pool.get().await?;
        let query = r#"
            UPDATE indexer.notifications
            SET read = TRUE, updated_at = NOW()
            WHERE id = $1
        "#;

        Ok(client.execute(query, &[&id]).await? == 1)
    }
}

// ==================== HELPER FUNCTIONS ====================

fn numeric(row: &Row, col: &str) -> Result<alloy::primitives::U256, IndexerError> {
    let text: String = row.get(col);
    parse_u256(&text).ok_or_else(|| corrupt(col, text))
}

fn unsigned(row: &Row, col: &str) -> Result<u64, IndexerError> {
    let value: i64 = row.get(col);
    u64::try_from(value).map_err(|_| corrupt(col, value))
}

fn row_to_event(row: &Row) -> Result<RawEvent, IndexerError> {
    let name: String = row.get("event_name");
    let kind = EventKind::parse(&name).ok_or_else(|| corrupt("event", &name))?;
    let data: serde_json::Value = row.get("event_data");
    let args: BTreeMap<String, String> =
        serde_json::from_value(data).map_err(|e| corrupt("event", e))?;
    let payload =
        EventPayload::from_arguments(kind, &args).ok_or_else(|| corrupt("event", &name))?;
    let observed_at: DateTime<Utc> = row.get("observed_at");

    Ok(RawEvent {
        contract_address: row.get("contract_address"),
        payload,
        transaction_hash: row.get("transaction_hash"),
        block_number: unsigned(row, "block_number")?,
        log_index: unsigned(row, "log_index")?,
        observed_at,
    })
}

fn row_to_user(row: &Row) -> Result<UserAggregate, IndexerError> {
    Ok(UserAggregate {
        wallet_id: row.get("wallet_address"),
        total_staked: numeric(row, "total_staked")?,
        total_rewards_earned: numeric(row, "total_rewards_earned")?,
        stake_event_count: unsigned(row, "stake_count")?,
        last_activity_at: row.get("last_activity_at"),
    })
}

fn row_to_daily(row: &Row) -> Result<DailyAggregate, IndexerError> {
    Ok(DailyAggregate {
        date: row.get("date"),
        total_staked: numeric(row, "total_staked")?,
        total_users: unsigned(row, "total_users")?,
        total_rewards_distributed: numeric(row, "total_rewards_distributed")?,
        average_stake_amount: numeric(row, "average_stake_amount")?,
    })
}

fn row_to_notification(row: &Row) -> Result<Notification, IndexerError> {
    let kind: String = row.get("kind");
    Ok(Notification {
        id: row.get("id"),
        user_wallet: row.get("user_wallet"),
        title: row.get("title"),
        message: row.get("message"),
        kind: NotificationKind::parse(&kind).ok_or_else(|| corrupt("notification", kind))?,
        read: row.get("read"),
        created_at: row.get("created_at"),
    })
}
