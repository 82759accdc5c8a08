use std::{fmt::Display, future::Future, sync::Arc, time::Duration};

use alloy::{
    providers::{DynProvider, Provider, ProviderBuilder},
    rpc::types::Filter,
};
use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    chain::{poller::Poller, ChainClient, ChainEvent, LogFilter, RawLogEntry, SubscriptionHandle},
    config::IndexerSettings,
    error::IndexerError,
};

/// Substrings nodes use when refusing an `eth_getLogs` range.
const RANGE_ERROR_HINTS: [&str; 7] = [
    "more than",
    "block range",
    "range too",
    "limit exceeded",
    "too large",
    "too many",
    "-32005",
];

fn is_range_error(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    RANGE_ERROR_HINTS.iter().any(|hint| msg.contains(hint))
}

/// [`ChainClient`] over an alloy HTTP provider.
///
/// Live delivery polls `eth_blockNumber` and `eth_getLogs` on an interval.
#[derive(Clone)]
pub struct RpcChainClient {
    provider: DynProvider,
    request_timeout: Duration,
    poll_interval: Duration,
    /// Widest range one live poll fetches.
    max_poll_blocks: u64,
}

impl RpcChainClient {
    pub fn new(settings: &IndexerSettings) -> Result<Self, IndexerError> {
        let url = Url::parse(&settings.rpc_endpoint).map_err(|e| {
            IndexerError::Config(format!("invalid rpc_endpoint {}: {}", settings.rpc_endpoint, e))
        })?;

        let provider = DynProvider::new(ProviderBuilder::new().connect_http(url));

        Ok(Self {
            provider,
            request_timeout: Duration::from_secs(settings.request_timeout_seconds),
            poll_interval: Duration::from_millis(settings.poll_interval_milliseconds),
            max_poll_blocks: settings.batch_size_blocks,
        })
    }

    async fn timed<T, E: Display>(
        &self,
        what: &str,
        call: impl Future<Output = Result<T, E>>,
    ) -> Result<Result<T, E>, IndexerError> {
        tokio::time::timeout(self.request_timeout, call)
            .await
            .map_err(|_| {
                IndexerError::Connection(format!(
                    "{} timed out after {:?}",
                    what, self.request_timeout
                ))
            })
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn current_height(&self) -> Result<u64, IndexerError> {
        self.timed("eth_blockNumber", self.provider.get_block_number())
            .await?
            .map_err(|e| IndexerError::Connection(format!("eth_blockNumber: {}", e)))
    }

    async fn logs_in_range(
        &self,
        from: u64,
        to: u64,
        filter: &LogFilter,
    ) -> Result<Vec<RawLogEntry>, IndexerError> {
        let query = Filter::new()
            .address(filter.addresses.clone())
            .event_signature(filter.topics.clone())
            .from_block(from)
            .to_block(to);

        match self.timed("eth_getLogs", self.provider.get_logs(&query)).await? {
            Ok(logs) => Ok(logs.into_iter().map(RawLogEntry::from).collect()),
            Err(e) if is_range_error(&e.to_string()) => {
                debug!("eth_getLogs {}..={} refused: {}", from, to, e);
                Err(IndexerError::RangeTooLarge { from, to })
            },
            Err(e) => Err(IndexerError::Connection(format!(
                "eth_getLogs {}..={}: {}",
                from, to, e
            ))),
        }
    }

    async fn subscribe(
        &self,
        filter: &LogFilter,
        sink: mpsc::Sender<ChainEvent>,
    ) -> Result<SubscriptionHandle, IndexerError> {
        let last_seen = match filter.from_block {
            Some(block) => block.saturating_sub(1),
            None => self.current_height().await?,
        };

        let token = CancellationToken::new();
        let poller = Poller::new(
            Arc::new(self.clone()),
            filter.clone(),
            sink,
            token.clone(),
            self.poll_interval,
            self.max_poll_blocks,
            last_seen,
        );
        tokio::spawn(poller.run());

        info!(
            "[LIVE] Subscribed to {} contracts after block {}, polling every {:?}",
            filter.addresses.len(),
            last_seen,
            self.poll_interval
        );
        Ok(SubscriptionHandle::new(token))
    }
}
