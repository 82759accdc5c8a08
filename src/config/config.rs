use config::{Config, ConfigError, File};
use serde::Deserialize;

/// PostgreSQL database connection configuration.
///
/// Used for storing:
/// - The sync checkpoint
/// - Raw contract events
/// - User and daily aggregates
/// - Notifications
#[derive(Debug, Deserialize, Clone)]
pub struct PostgresSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_pool_size() -> usize {
    16
}

/// Chain indexer configuration.
///
/// `watched_contracts` lists every contract whose logs are fetched. The first
/// entry is the stake contract, followed by its reward token. A token
/// `Transfer` is only indexed when the stake contract sends it.
#[derive(Debug, Deserialize, Clone)]
pub struct IndexerSettings {
    /// Checkpoint key, so several indexers can share one store.
    #[serde(default = "default_indexer_id")]
    pub id: String,
    pub rpc_endpoint: String,
    #[serde(default)]
    pub watched_contracts: Vec<String>,
    #[serde(default = "default_batch_size_blocks")]
    pub batch_size_blocks: u64,
    #[serde(default = "default_reconciliation_interval")]
    pub reconciliation_interval_seconds: u64,
    #[serde(default = "default_reconciliation_gap_threshold")]
    pub reconciliation_gap_threshold_blocks: u64,
    /// Live subscription poll interval.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_milliseconds: u64,
    /// Upper bound for a single RPC call.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Attempts for checkpoint load and chain height during initialization.
    #[serde(default = "default_init_max_retries")]
    pub init_max_retries: u32,
    /// In-place retries for a failed batch before it is parked.
    #[serde(default = "default_batch_max_retries")]
    pub batch_max_retries: u32,
    /// Base delay for exponential backoff.
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_milliseconds: u64,
    /// Capacity of the live subscription channel.
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
}

fn default_indexer_id() -> String {
    "stake-indexer".to_string()
}

fn default_batch_size_blocks() -> u64 {
    1_000
}

fn default_reconciliation_interval() -> u64 {
    300
}

fn default_reconciliation_gap_threshold() -> u64 {
    10
}

fn default_poll_interval() -> u64 {
    2_000
}

fn default_request_timeout() -> u64 {
    30
}

fn default_init_max_retries() -> u32 {
    5
}

fn default_batch_max_retries() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    200
}

fn default_inbox_capacity() -> usize {
    1_024
}

impl IndexerSettings {
    /// Settings with every optional field at its default.
    pub fn with_endpoint(rpc_endpoint: impl Into<String>, watched_contracts: Vec<String>) -> Self {
        Self {
            id: default_indexer_id(),
            rpc_endpoint: rpc_endpoint.into(),
            watched_contracts,
            batch_size_blocks: default_batch_size_blocks(),
            reconciliation_interval_seconds: default_reconciliation_interval(),
            reconciliation_gap_threshold_blocks: default_reconciliation_gap_threshold(),
            poll_interval_milliseconds: default_poll_interval(),
            request_timeout_seconds: default_request_timeout(),
            init_max_retries: default_init_max_retries(),
            batch_max_retries: default_batch_max_retries(),
            retry_base_delay_milliseconds: default_retry_base_delay(),
            inbox_capacity: default_inbox_capacity(),
        }
    }
}

/// Root application configuration.
///
/// Loaded from `config.yaml` at startup. Without a `postgres` section the
/// indexer runs against in-memory stores.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub postgres: Option<PostgresSettings>,
    pub indexer: IndexerSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name("config"))
            .build()?;

        let settings: Settings = s.try_deserialize()?;

        Ok(settings)
    }
}
