pub mod abis;
pub mod chain;
pub mod config;
pub mod db;
pub mod error;
pub mod projectors;
pub mod utils;
pub mod worker;

pub use chain::{ChainClient, RpcChainClient};
pub use config::Settings;
pub use db::Database;
pub use error::IndexerError;
pub use worker::{IndexerHandle, IndexerState, IndexerStatus};
