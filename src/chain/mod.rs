//! Access to the EVM node.
//!
//! [`ChainClient`] is the seam the indexer is written against.
//! [`RpcChainClient`] implements it over an alloy HTTP provider.

mod client;
mod poller;
#[cfg(test)]
pub(crate) mod mock;
mod rpc;

pub use client::{ChainClient, ChainEvent, LogFilter, RawLogEntry, SubscriptionHandle};
pub use rpc::RpcChainClient;
