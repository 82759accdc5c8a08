#[allow(clippy::module_inception)]
mod config;

pub use self::config::{IndexerSettings, PostgresSettings, Settings};
