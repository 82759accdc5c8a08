use std::time::Duration;

use anyhow::Context;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use log::{info, warn};
use tokio_postgres::NoTls;

use crate::config::PostgresSettings;

/// Schema applied by [`PostgresClient::migrate`]. Every statement is idempotent.
const SCHEMA: &str = include_str!("../../../schema/postgres.sql");

const CONNECT_ATTEMPTS: u32 = 3;

/// Split SQL into statements, respecting `$$` dollar-quoted bodies.
fn split_sql_statements(sql: &str) -> Vec<&str> {
    let mut statements = Vec::new();
    let mut start = 0;
    let mut in_dollar_quote = false;
    let bytes = sql.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'$') {
            in_dollar_quote = !in_dollar_quote;
            i += 2;
            continue;
        }

        if bytes[i] == b';' && !in_dollar_quote {
            let stmt = &sql[start..i];
            if !stmt.trim().is_empty() {
                statements.push(stmt);
            }
            start = i + 1;
        }
        i += 1;
    }

    let rest = &sql[start..];
    if !rest.trim().is_empty() {
        statements.push(rest);
    }

    statements
}

/// PostgreSQL client with connection pooling.
///
/// Implements both [`CheckpointStore`](crate::db::CheckpointStore) and
/// [`ProjectionStore`](crate::db::ProjectionStore) over the `indexer` schema.
#[derive(Clone)]
pub struct PostgresClient {
    pub pool: Pool,
    /// Row key in `indexer.checkpoints`.
    pub checkpoint_name: String,
}

impl PostgresClient {
    pub async fn new(settings: PostgresSettings, checkpoint_name: String) -> anyhow::Result<Self> {
        info!(
            "Connecting to PostgreSQL at {}:{}/{}",
            settings.host, settings.port, settings.database
        );

        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&settings.host)
            .port(settings.port)
            .user(&settings.user)
            .password(&settings.password)
            .dbname(&settings.database);

        let mgr = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(mgr)
            .max_size(settings.pool_size)
            .build()
            .context("Failed to create PostgreSQL connection pool")?;

        let mut attempt = 1;
        loop {
            match pool.get().await {
                Ok(_conn) => break,
                Err(e) if attempt < CONNECT_ATTEMPTS => {
                    let delay = Duration::from_millis(100 * 2_u64.pow(attempt));
                    warn!(
                        "Failed to connect to PostgreSQL (attempt {}/{}): {}, retrying in {:?}",
                        attempt, CONNECT_ATTEMPTS, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(e) => {
                    return Err(anyhow::anyhow!(
                        "Failed to connect to PostgreSQL after {} attempts: {}",
                        CONNECT_ATTEMPTS,
                        e
                    ))
                },
            }
        }

        info!("Successfully connected to PostgreSQL");
        Ok(Self {
            pool,
            checkpoint_name,
        })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        info!("Running PostgreSQL migrations");
        let client = self.pool.get().await?;

        for stmt in split_sql_statements(SCHEMA) {
            let stmt = stmt.trim();
            client
                .execute(stmt, &[])
                .await
                .with_context(|| format!("Failed to execute migration statement: {}", stmt))?;
        }

        info!("PostgreSQL migrations completed successfully");
        Ok(())
    }
}
