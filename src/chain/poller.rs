//! Interval polling behind a live subscription.

use std::{sync::Arc, time::Duration};

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    chain::{ChainClient, ChainEvent, LogFilter},
    error::IndexerError,
};

/// Pushes the logs of every new block, then `NewBlock`, into a sink.
///
/// A node that fell far behind is caught up in steps of at most `max_blocks`.
/// `last_seen` only moves once a step's logs have all been pushed, so a failed
/// fetch is asked for again on the next tick.
pub(crate) struct Poller<C: ?Sized> {
    client: Arc<C>,
    filter: LogFilter,
    sink: mpsc::Sender<ChainEvent>,
    token: CancellationToken,
    every: Duration,
    max_blocks: u64,
    last_seen: u64,
}

impl<C: ChainClient + ?Sized> Poller<C> {
    pub(crate) fn new(
        client: Arc<C>,
        filter: LogFilter,
        sink: mpsc::Sender<ChainEvent>,
        token: CancellationToken,
        every: Duration,
        max_blocks: u64,
        last_seen: u64,
    ) -> Self {
        Self {
            client,
            filter,
            sink,
            token,
            every,
            max_blocks: max_blocks.max(1),
            last_seen,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        'poll: loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => {},
            }

            let height = match self.client.current_height().await {
                Ok(h) => h,
                Err(e) => {
                    warn!("[LIVE] Failed to poll block number: {}", e);
                    continue;
                },
            };

            while self.last_seen < height {
                if self.token.is_cancelled() {
                    break 'poll;
                }
                match self.step(height).await {
                    Ok(true) => {},
                    Ok(false) => return,
                    Err(e) => {
                        warn!(
                            "[LIVE] Failed to fetch logs after block {}: {}",
                            self.last_seen, e
                        );
                        break;
                    },
                }
            }
        }
        info!("[LIVE] Subscription closed at block {}", self.last_seen);
    }

    /// Deliver the next capped range. `Ok(false)` once the sink or the token
    /// is gone.
    async fn step(&mut self, height: u64) -> Result<bool, IndexerError> {
        let from = self.last_seen + 1;
        let to = height.min(self.last_seen.saturating_add(self.max_blocks));
        let logs = self.client.fetch_logs(from, to, &self.filter).await?;

        debug!("[LIVE] Blocks {}..={}: {} logs", from, to, logs.len());

        let events = logs
            .into_iter()
            .map(ChainEvent::Log)
            .chain(std::iter::once(ChainEvent::NewBlock(to)));
        for event in events {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return Ok(false),
                sent = self.sink.send(event) => {
                    if sent.is_err() {
                        return Ok(false);
                    }
                },
            }
        }
        self.last_seen = to;
        Ok(true)
    }
}
