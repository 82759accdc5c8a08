use alloy::{
    primitives::{Address, Bytes, LogData, B256},
    rpc::types::Log,
};
use async_trait::async_trait;
use log::debug;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::IndexerError;

/// A log as reported by the node, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLogEntry {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub transaction_hash: Option<B256>,
    pub block_number: Option<u64>,
    pub log_index: Option<u64>,
    /// Seconds since the epoch, when the node includes it.
    pub block_timestamp: Option<u64>,
}

impl RawLogEntry {
    pub fn topic0(&self) -> Option<&B256> {
        self.topics.first()
    }

    pub fn log_data(&self) -> LogData {
        LogData::new_unchecked(self.topics.clone(), self.data.clone())
    }
}

impl From<Log> for RawLogEntry {
    fn from(log: Log) -> Self {
        Self {
            address: log.inner.address,
            topics: log.inner.data.topics().to_vec(),
            data: log.inner.data.data.clone(),
            transaction_hash: log.transaction_hash,
            block_number: log.block_number,
            log_index: log.log_index,
            block_timestamp: log.block_timestamp,
        }
    }
}

/// Which logs to fetch: emitted by any of `addresses` with topic0 in `topics`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub addresses: Vec<Address>,
    pub topics: Vec<B256>,
    /// First block a subscription covers. `None` starts at the current head.
    pub from_block: Option<u64>,
}

impl LogFilter {
    pub fn starting_at(&self, block: u64) -> Self {
        Self {
            from_block: Some(block),
            ..self.clone()
        }
    }
}

/// Message pushed by a live subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    Log(RawLogEntry),
    /// Every log up to and including block `n` has already been pushed.
    NewBlock(u64),
}

/// Owns a live subscription's task through its cancellation token.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    token: CancellationToken,
}

impl SubscriptionHandle {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Latest block number known to the node.
    async fn current_height(&self) -> Result<u64, IndexerError>;

    /// Logs in `[from, to]` matching `filter`, in node order.
    ///
    /// Fails with [`IndexerError::RangeTooLarge`] when the node refuses the
    /// range; the caller is expected to split it.
    async fn logs_in_range(
        &self,
        from: u64,
        to: u64,
        filter: &LogFilter,
    ) -> Result<Vec<RawLogEntry>, IndexerError>;

    /// Logs in `[from, to]`, halving any sub-range the node refuses until it
    /// is accepted or down to a single block. Results keep block order.
    async fn fetch_logs(
        &self,
        from: u64,
        to: u64,
        filter: &LogFilter,
    ) -> Result<Vec<RawLogEntry>, IndexerError> {
        let mut todo = vec![(from, to)];
        let mut logs = Vec::new();

        while let Some((lo, hi)) = todo.pop() {
            match self.logs_in_range(lo, hi, filter).await {
                Ok(found) => logs.extend(found),
                Err(IndexerError::RangeTooLarge { .. }) if hi > lo => {
                    let mid = lo + (hi - lo) / 2;
                    debug!("Range {}..={} too large, splitting at {}", lo, hi, mid);
                    // Lower half is popped first.
                    todo.push((mid + 1, hi));
                    todo.push((lo, mid));
                },
                Err(e) => return Err(e),
            }
        }
        Ok(logs)
    }

    /// Start pushing [`ChainEvent`]s into `sink`.
    ///
    /// Logs may be delivered again if they were already fetched through
    /// [`logs_in_range`](Self::logs_in_range).
    async fn subscribe(
        &self,
        filter: &LogFilter,
        sink: mpsc::Sender<ChainEvent>,
    ) -> Result<SubscriptionHandle, IndexerError>;

    /// Stop a subscription. Safe to call more than once.
    fn unsubscribe(&self, handle: &SubscriptionHandle) {
        handle.cancel();
    }
}
