//! The indexing state machine.
//!
//! A single [`Indexer`] task owns every piece of mutable indexing state. The
//! live subscription and the reconciliation timer never touch it directly:
//! they only push messages into channels the worker drains.
//!
//! ```text
//! Stopped -> Initializing -> Backfilling -> Live <-> Reconciling
//!                 |                           |
//!                 +---------> Stopped <-------+
//! ```

use std::{collections::VecDeque, fmt, sync::Arc, time::Duration};

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    chain::{ChainClient, ChainEvent, RawLogEntry, SubscriptionHandle},
    config::IndexerSettings,
    db::{models::RawEvent, CheckpointStore},
    error::IndexerError,
    projectors::ProjectorRegistry,
    utils::Backoff,
    worker::normalizer::Normalizer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexerState {
    Stopped,
    Initializing,
    Backfilling,
    Live,
    Reconciling,
}

impl IndexerState {
    /// Log prefix for work done in this state.
    fn tag(&self) -> &'static str {
        match self {
            Self::Stopped => "[STOPPED]",
            Self::Initializing => "[INIT]",
            Self::Backfilling => "[BACKFILL]",
            Self::Live => "[LIVE]",
            Self::Reconciling => "[RECONCILE]",
        }
    }
}

/// Snapshot published after every state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexerStatus {
    pub is_listening: bool,
    pub state: IndexerState,
    pub last_processed_block: u64,
    pub current_block: u64,
    pub watched_contracts: Vec<String>,
    /// Failed ranges waiting for the next reconciliation pass.
    pub pending_ranges: usize,
}

impl IndexerStatus {
    pub fn stopped(watched_contracts: Vec<String>) -> Self {
        Self {
            is_listening: false,
            state: IndexerState::Stopped,
            last_processed_block: 0,
            current_block: 0,
            watched_contracts,
            pending_ranges: 0,
        }
    }
}

/// Inclusive block range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

impl BlockRange {
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.from, self.to)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Done,
    Cancelled,
}

pub struct Indexer {
    settings: IndexerSettings,
    chain: Arc<dyn ChainClient>,
    checkpoints: Arc<dyn CheckpointStore>,
    registry: Arc<ProjectorRegistry>,
    normalizer: Normalizer,
    status: Arc<watch::Sender<IndexerStatus>>,
    tick_sender: mpsc::Sender<()>,
    ticks: Option<mpsc::Receiver<()>>,

    state: IndexerState,
    /// Durable checkpoint. Never past the first parked block.
    last_processed_block: u64,
    /// Highest block whose logs were dispatched or parked.
    scanned_through: u64,
    current_block: u64,
    pending: VecDeque<BlockRange>,
}

/// Outcome of one fetched batch.
#[derive(Debug, Default)]
struct BatchReport {
    events: usize,
    /// Blocks holding an event some projector rejected.
    failed_blocks: Vec<u64>,
}

impl Indexer {
    pub fn new(
        settings: IndexerSettings,
        chain: Arc<dyn ChainClient>,
        checkpoints: Arc<dyn CheckpointStore>,
        registry: Arc<ProjectorRegistry>,
        status: Arc<watch::Sender<IndexerStatus>>,
    ) -> Result<Self, IndexerError> {
        let normalizer = Normalizer::new(&settings.watched_contracts)?;
        // A tick already queued covers any that arrive while it waits.
        let (tick_sender, ticks) = mpsc::channel(1);

        Ok(Self {
            settings,
            chain,
            checkpoints,
            registry,
            normalizer,
            status,
            tick_sender,
            ticks: Some(ticks),
            state: IndexerState::Stopped,
            last_processed_block: 0,
            scanned_through: 0,
            current_block: 0,
            pending: VecDeque::new(),
        })
    }

    /// Sender that requests a reconciliation pass, as the timer does.
    pub fn reconcile_trigger(&self) -> mpsc::Sender<()> {
        self.tick_sender.clone()
    }

    /// Drive the state machine until `cancel` fires or a fatal error occurs.
    /// Always ends in [`IndexerState::Stopped`].
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), IndexerError> {
        let result = self.run_until_stopped(&cancel).await;

        self.set_state(IndexerState::Stopped);
        match &result {
            Ok(()) => info!("Indexer stopped at block {}", self.last_processed_block),
            Err(e) => error!("Indexer stopped on fatal error: {}", e),
        }
        if !self.pending.is_empty() {
            let ranges: Vec<String> = self.pending.iter().map(|r| r.to_string()).collect();
            warn!(
                "Stopping with {} unprocessed block range(s): {}",
                ranges.len(),
                ranges.join(", ")
            );
        }
        result
    }

    async fn run_until_stopped(&mut self, cancel: &CancellationToken) -> Result<(), IndexerError> {
        self.set_state(IndexerState::Initializing);
        if self.initialize(cancel).await? == Progress::Cancelled {
            return Ok(());
        }

        let target = self.current_block;
        if target > self.scanned_through {
            self.set_state(IndexerState::Backfilling);
            let range = BlockRange::new(self.scanned_through + 1, target);
            info!("[BACKFILL] Processing blocks {}", range);
            if self.process_range(range, cancel).await? == Progress::Cancelled {
                return Ok(());
            }
            info!("[BACKFILL] Complete at block {}", self.scanned_through);
        }

        self.live(cancel).await
    }

    fn base_delay(&self) -> Duration {
        Duration::from_millis(self.settings.retry_base_delay_milliseconds)
    }

    // ─── Initializing ─────────────────────────────────────────────────────────

    async fn initialize(&mut self, cancel: &CancellationToken) -> Result<Progress, IndexerError> {
        let backoff = Backoff::new(self.settings.init_max_retries, self.base_delay());

        let checkpoints = &self.checkpoints;
        let Some(loaded) = backoff
            .run("[INIT] Checkpoint load", cancel, move || checkpoints.load())
            .await
        else {
            return Ok(Progress::Cancelled);
        };
        let loaded = loaded?;

        let chain = &self.chain;
        let Some(height) = backoff
            .run("[INIT] Chain height", cancel, move || chain.current_height())
            .await
        else {
            return Ok(Progress::Cancelled);
        };
        let height = height?;
        self.current_block = height;

        match loaded {
            Some(checkpoint) => {
                info!(
                    "[INIT] Resuming '{}' after block {} (chain at {})",
                    checkpoint.name, checkpoint.last_processed_block, height
                );
                self.last_processed_block = checkpoint.last_processed_block;
                self.scanned_through = checkpoint.last_processed_block;
                self.publish();
            },
            None => {
                info!("[INIT] No checkpoint found, starting at current block {}", height);
                if self.save_checkpoint(height, backoff, cancel).await? == Progress::Cancelled {
                    return Ok(Progress::Cancelled);
                }
                self.scanned_through = height;
                self.publish();
            },
        }
        Ok(Progress::Done)
    }

    // ─── Batches ──────────────────────────────────────────────────────────────

    /// Process `range` in fixed-size batches, advancing the checkpoint after
    /// each one. Batches that keep failing are parked for reconciliation and
    /// hold the checkpoint below them.
    async fn process_range(
        &mut self,
        range: BlockRange,
        cancel: &CancellationToken,
    ) -> Result<Progress, IndexerError> {
        let batch_size = self.settings.batch_size_blocks.max(1);
        let tag = self.state.tag();
        let mut start = range.from;

        while start <= range.to {
            if cancel.is_cancelled() {
                return Ok(Progress::Cancelled);
            }
            let batch = BlockRange::new(start, start.saturating_add(batch_size - 1).min(range.to));

            match self.run_batch(batch, cancel).await {
                None => return Ok(Progress::Cancelled),
                Some(Ok(report)) => {
                    info!("{} Processed blocks {} ({} events)", tag, batch, report.events);
                    self.park_failed(&report);
                },
                Some(Err(e)) => {
                    error!("{} Blocks {} failed: {}", tag, batch, e);
                    self.park(batch);
                },
            }

            let backoff = Backoff::new(self.settings.batch_max_retries, self.base_delay());
            if self.persist(batch.to, backoff, cancel).await? == Progress::Cancelled {
                return Ok(Progress::Cancelled);
            }

            match batch.to.checked_add(1) {
                Some(next) => start = next,
                None => break,
            }
        }
        Ok(Progress::Done)
    }

    /// One batch with in-place retries of the fetch. `None` when cancelled.
    async fn run_batch(
        &self,
        batch: BlockRange,
        cancel: &CancellationToken,
    ) -> Option<Result<BatchReport, IndexerError>> {
        let backoff = Backoff::new(self.settings.batch_max_retries, self.base_delay());
        let what = format!("{} Blocks {}", self.state.tag(), batch);
        let this = self;
        backoff
            .run(&what, cancel, move || this.try_batch(batch))
            .await
    }

    /// Fetch and dispatch `batch`. A rejected event is reported by block and
    /// does not stop the events after it.
    async fn try_batch(&self, batch: BlockRange) -> Result<BatchReport, IndexerError> {
        let filter = self.normalizer.filter();
        let logs = self.chain.fetch_logs(batch.from, batch.to, &filter).await?;
        let events = self.normalize_batch(&logs);

        let mut report = BatchReport::default();
        for event in &events {
            match self.registry.dispatch(event).await {
                Ok(()) => report.events += 1,
                Err(e) => {
                    error!(
                        "{} Failed to project {}: {}",
                        self.state.tag(),
                        event.id(),
                        e
                    );
                    if report.failed_blocks.last() != Some(&event.block_number) {
                        report.failed_blocks.push(event.block_number);
                    }
                },
            }
        }
        Ok(report)
    }

    /// Normalize, drop unknown shapes and order by `(block_number, log_index)`.
    fn normalize_batch(&self, logs: &[RawLogEntry]) -> Vec<RawEvent> {
        let mut events: Vec<RawEvent> = logs
            .iter()
            .filter_map(|log| match self.normalizer.normalize(log) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!("{} Skipping log: {}", self.state.tag(), e);
                    None
                },
            })
            .collect();

        events.sort_by_key(|e| e.ordering_key());
        events.dedup_by(|a, b| a.id() == b.id());
        events
    }

    fn park(&mut self, range: BlockRange) {
        if !self.pending.contains(&range) {
            warn!("Parking blocks {} for the next reconciliation pass", range);
            self.pending.push_back(range);
            self.publish();
        }
    }

    fn park_failed(&mut self, report: &BatchReport) {
        for &block in &report.failed_blocks {
            self.park(BlockRange::new(block, block));
        }
    }

    /// Highest block that can be saved: everything scanned, stopping short of
    /// the lowest parked range.
    fn safe_checkpoint(&self) -> u64 {
        match self.pending.iter().map(|r| r.from).min() {
            Some(from) => self.scanned_through.min(from.saturating_sub(1)),
            None => self.scanned_through,
        }
    }

    /// Mark every block up to `block` as scanned and save the checkpoint if
    /// it can move.
    async fn persist(
        &mut self,
        block: u64,
        backoff: Backoff,
        cancel: &CancellationToken,
    ) -> Result<Progress, IndexerError> {
        self.scanned_through = self.scanned_through.max(block);
        self.current_block = self.current_block.max(block);

        let safe = self.safe_checkpoint();
        if safe > self.last_processed_block {
            if self.save_checkpoint(safe, backoff, cancel).await? == Progress::Cancelled {
                return Ok(Progress::Cancelled);
            }
        } else if safe < self.scanned_through {
            debug!(
                "Checkpoint held at {} by parked blocks, scanned through {}",
                self.last_processed_block, self.scanned_through
            );
        }
        self.publish();
        Ok(Progress::Done)
    }

    async fn save_checkpoint(
        &mut self,
        block: u64,
        backoff: Backoff,
        cancel: &CancellationToken,
    ) -> Result<Progress, IndexerError> {
        let checkpoints = &self.checkpoints;
        match backoff
            .run("Checkpoint save", cancel, move || checkpoints.save(block))
            .await
        {
            None => return Ok(Progress::Cancelled),
            Some(result) => result?,
        }
        self.last_processed_block = self.last_processed_block.max(block);
        Ok(Progress::Done)
    }

    // ─── Live ─────────────────────────────────────────────────────────────────

    async fn live(&mut self, cancel: &CancellationToken) -> Result<(), IndexerError> {
        let Some(mut ticks) = self.ticks.take() else {
            return Err(IndexerError::Config("indexer inbox already consumed".to_string()));
        };

        let (mut subscription, mut inbox) = match self.subscribe(cancel).await {
            None => return Ok(()),
            Some(subscribed) => subscribed?,
        };
        self.set_state(IndexerState::Live);
        let timer = self.spawn_timer(cancel.child_token());

        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                Some(()) = ticks.recv() => match self.reconcile(cancel).await {
                    Ok(Progress::Done) => {},
                    Ok(Progress::Cancelled) => break Ok(()),
                    Err(e) => break Err(e),
                },
                event = inbox.recv() => match event {
                    Some(ChainEvent::Log(log)) => self.apply_live(&log, cancel).await,
                    Some(ChainEvent::NewBlock(block)) => {
                        if let Err(e) = self.advance_live(block, cancel).await {
                            break Err(e);
                        }
                    },
                    None => {
                        warn!(
                            "[LIVE] Subscription closed, resubscribing after block {}",
                            self.scanned_through
                        );
                        self.chain.unsubscribe(&subscription);
                        match self.subscribe(cancel).await {
                            None => break Ok(()),
                            Some(Err(e)) => break Err(e),
                            Some(Ok((handle, rx))) => {
                                subscription = handle;
                                inbox = rx;
                            },
                        }
                    },
                },
            }
        };

        self.chain.unsubscribe(&subscription);
        timer.cancel();
        result
    }

    async fn subscribe(
        &self,
        cancel: &CancellationToken,
    ) -> Option<Result<(SubscriptionHandle, mpsc::Receiver<ChainEvent>), IndexerError>> {
        let backoff = Backoff::new(self.settings.init_max_retries, self.base_delay());
        let filter = self.normalizer.filter().starting_at(self.scanned_through + 1);
        let capacity = self.settings.inbox_capacity.max(1);
        let chain = &self.chain;
        let filter = &filter;

        let subscribed = backoff
            .run("[LIVE] Subscribe", cancel, move || {
                let (sink, inbox) = mpsc::channel(capacity);
                async move { chain.subscribe(filter, sink).await.map(|handle| (handle, inbox)) }
            })
            .await;

        if let Some(Ok(_)) = &subscribed {
            info!(
                "[LIVE] Listening for events after block {}",
                self.scanned_through
            );
        }
        subscribed
    }

    fn spawn_timer(&self, token: CancellationToken) -> CancellationToken {
        let every = Duration::from_secs(self.settings.reconciliation_interval_seconds.max(1));
        let ticks = self.tick_sender.clone();
        let guard = token.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        // Full means a tick is already waiting.
                        let _ = ticks.try_send(());
                    },
                }
            }
        });
        guard
    }

    async fn apply_live(&mut self, log: &RawLogEntry, cancel: &CancellationToken) {
        let event = match self.normalizer.normalize(log) {
            Ok(event) => event,
            Err(e) => {
                warn!("[LIVE] Skipping log: {}", e);
                return;
            },
        };

        let applied = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            applied = self.registry.dispatch(&event) => applied,
        };
        if let Err(e) = applied {
            error!("[LIVE] Failed to project {}: {}", event.id(), e);
            self.park(BlockRange::new(event.block_number, event.block_number));
        }
    }

    /// Every log up to `block` has been dispatched; move the checkpoint.
    async fn advance_live(
        &mut self,
        block: u64,
        cancel: &CancellationToken,
    ) -> Result<(), IndexerError> {
        if block <= self.scanned_through {
            debug!(
                "[LIVE] Block {} already scanned (through {})",
                block, self.scanned_through
            );
            return Ok(());
        }
        let backoff = Backoff::new(self.settings.batch_max_retries, self.base_delay());
        self.persist(block, backoff, cancel).await?;
        debug!(
            "[LIVE] Scanned through block {}, checkpoint at {}",
            block, self.last_processed_block
        );
        Ok(())
    }

    // ─── Reconciling ──────────────────────────────────────────────────────────

    async fn reconcile(&mut self, cancel: &CancellationToken) -> Result<Progress, IndexerError> {
        let height = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Progress::Cancelled),
            height = self.chain.current_height() => height,
        };
        let height = match height {
            Ok(h) => h,
            Err(e) => {
                warn!("[RECONCILE] Could not read chain height: {}", e);
                return Ok(Progress::Done);
            },
        };
        self.current_block = self.current_block.max(height);
        self.publish();

        let gap = height.saturating_sub(self.scanned_through);
        let threshold = self.settings.reconciliation_gap_threshold_blocks;
        if self.pending.is_empty() && gap <= threshold {
            debug!(
                "[RECONCILE] {} blocks behind, within threshold {}",
                gap, threshold
            );
            return Ok(Progress::Done);
        }

        self.set_state(IndexerState::Reconciling);

        let mut parked = std::mem::take(&mut self.pending);
        while let Some(range) = parked.pop_front() {
            match self.run_batch(range, cancel).await {
                None => {
                    parked.push_front(range);
                    self.pending.extend(parked);
                    return Ok(Progress::Cancelled);
                },
                Some(Ok(report)) if report.failed_blocks.is_empty() => {
                    info!("[RECONCILE] Recovered blocks {} ({} events)", range, report.events)
                },
                Some(Ok(report)) => {
                    warn!(
                        "[RECONCILE] Blocks {} still have {} failing block(s)",
                        range,
                        report.failed_blocks.len()
                    );
                    self.park_failed(&report);
                },
                Some(Err(e)) => {
                    warn!("[RECONCILE] Blocks {} still failing: {}", range, e);
                    self.pending.push_back(range);
                },
            }
        }
        let backoff = Backoff::new(self.settings.batch_max_retries, self.base_delay());
        if self.persist(self.scanned_through, backoff, cancel).await? == Progress::Cancelled {
            return Ok(Progress::Cancelled);
        }

        if gap > threshold {
            let range = BlockRange::new(self.scanned_through + 1, height);
            info!(
                "[RECONCILE] {} blocks behind (threshold {}), processing {}",
                gap, threshold, range
            );
            if self.process_range(range, cancel).await? == Progress::Cancelled {
                return Ok(Progress::Cancelled);
            }
        }

        self.set_state(IndexerState::Live);
        Ok(Progress::Done)
    }

    // ─── Status ───────────────────────────────────────────────────────────────

    fn set_state(&mut self, state: IndexerState) {
        if self.state != state {
            debug!("Indexer state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
        self.publish();
    }

    fn publish(&self) {
        self.status.send_replace(IndexerStatus {
            is_listening: self.state != IndexerState::Stopped,
            state: self.state,
            last_processed_block: self.last_processed_block,
            current_block: self.current_block,
            watched_contracts: self.normalizer.watched_contracts(),
            pending_ranges: self.pending.len(),
        });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain::mock::{self, MockChain, ETHER, REWARD_TOKEN, STAKE_CONTRACT};
    use crate::db::{
        models::EventKind, EventQuery, MemoryCheckpointStore, MemoryProjectionStore,
        ProjectionStore,
    };
    use crate::projectors::Projector;
    use crate::utils::hex_encode;
    use alloy::primitives::U256;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::task::JoinHandle;

    pub(crate) fn test_settings() -> IndexerSettings {
        let mut settings = IndexerSettings::with_endpoint(
            "http://127.0.0.1:8545",
            vec![
                hex_encode(STAKE_CONTRACT.as_slice()),
                hex_encode(REWARD_TOKEN.as_slice()),
            ],
        );
        settings.reconciliation_interval_seconds = 3_600;
        settings.retry_base_delay_milliseconds = 1;
        settings.init_max_retries = 2;
        settings.batch_max_retries = 2;
        settings
    }

    struct Harness {
        chain: Arc<MockChain>,
        checkpoints: Arc<MemoryCheckpointStore>,
        store: Arc<MemoryProjectionStore>,
        status: watch::Receiver<IndexerStatus>,
        _publisher: Arc<watch::Sender<IndexerStatus>>,
        trigger: mpsc::Sender<()>,
        cancel: CancellationToken,
        task: JoinHandle<Result<(), IndexerError>>,
    }

    impl Harness {
        async fn start(
            chain: Arc<MockChain>,
            checkpoints: Arc<MemoryCheckpointStore>,
            store: Arc<MemoryProjectionStore>,
            registry: Option<ProjectorRegistry>,
            settings: IndexerSettings,
        ) -> Self {
            let registry =
                Arc::new(registry.unwrap_or_else(|| ProjectorRegistry::with_defaults(store.clone())));
            let status = Arc::new(watch::channel(IndexerStatus::stopped(vec![])).0);
            let indexer = Indexer::new(
                settings,
                chain.clone(),
                checkpoints.clone(),
                registry,
                status.clone(),
            )
            .unwrap();
            let trigger = indexer.reconcile_trigger();
            let cancel = CancellationToken::new();
            let task = tokio::spawn(indexer.run(cancel.clone()));

            Self {
                chain,
                checkpoints,
                store,
                status: status.subscribe(),
                _publisher: status,
                trigger,
                cancel,
                task,
            }
        }

        async fn fresh(chain: MockChain, checkpoint: Option<u64>) -> Self {
            let checkpoints = Arc::new(MemoryCheckpointStore::new());
            if let Some(block) = checkpoint {
                checkpoints.save(block).await.unwrap();
            }
            Self::start(
                Arc::new(chain),
                checkpoints,
                Arc::new(MemoryProjectionStore::new()),
                None,
                test_settings(),
            )
            .await
        }

        async fn wait_for(&mut self, mut f: impl FnMut(&IndexerStatus) -> bool) -> IndexerStatus {
            tokio::time::timeout(Duration::from_secs(5), self.status.wait_for(|s| f(s)))
                .await
                .expect("timed out waiting for status")
                .expect("status channel closed")
                .clone()
        }

        async fn live_at(&mut self, block: u64) -> IndexerStatus {
            self.wait_for(|s| s.state == IndexerState::Live && s.last_processed_block == block)
                .await
        }

        async fn stop(self) -> Result<(), IndexerError> {
            self.cancel.cancel();
            self.task.await.unwrap()
        }

        async fn checkpoint(&self) -> u64 {
            self.checkpoints
                .load()
                .await
                .unwrap()
                .map(|c| c.last_processed_block)
                .unwrap_or_default()
        }
    }

    async fn eventually(mut f: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !f() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition never held");
    }

    fn user(byte: u8) -> String {
        hex_encode(mock::wallet(byte).as_slice())
    }

    #[tokio::test]
    async fn first_run_starts_at_chain_height() {
        let mut h = Harness::fresh(MockChain::new(500), None).await;
        let status = h.live_at(500).await;

        assert!(status.is_listening);
        assert_eq!(status.current_block, 500);
        assert_eq!(status.watched_contracts.len(), 2);
        assert_eq!(h.checkpoint().await, 500);
        assert!(h.chain.calls().is_empty());
        assert_eq!(h.chain.subscribed_from(), Some(501));
        h.stop().await.unwrap();
    }

    #[tokio::test]
    async fn scenario_a_backfill_sums_stakes() {
        let chain = MockChain::new(110);
        chain.push_log(mock::staked(mock::wallet(0xa), ETHER, 100, 0));
        chain.push_log(mock::staked(mock::wallet(0xa), ETHER / 2, 105, 2));

        let mut h = Harness::fresh(chain, Some(90)).await;
        h.live_at(110).await;

        let agg = h.store.user_aggregate(&user(0xa)).await.unwrap().unwrap();
        assert_eq!(agg.total_staked, U256::from(ETHER + ETHER / 2));
        assert_eq!(agg.total_staked_ether(), "1.5".parse::<bigdecimal::BigDecimal>().unwrap());
        assert_eq!(agg.stake_event_count, 2);
        assert_eq!(h.chain.calls(), vec![(91, 110)]);
        h.stop().await.unwrap();
    }

    #[tokio::test]
    async fn scenario_b_small_gap_waits_for_live_blocks() {
        let mut h = Harness::fresh(MockChain::new(95), Some(90)).await;
        h.live_at(95).await;
        let calls_before = h.chain.calls();

        h.chain.set_height(100);
        h.trigger.send(()).await.unwrap();
        let status = h.wait_for(|s| s.current_block == 100).await;
        assert_eq!(status.last_processed_block, 95);
        assert_eq!(status.state, IndexerState::Live);
        assert_eq!(h.chain.calls(), calls_before);

        assert!(h.chain.emit(ChainEvent::NewBlock(100)).await);
        h.live_at(100).await;
        assert_eq!(h.checkpoint().await, 100);
        h.stop().await.unwrap();
    }

    #[tokio::test]
    async fn scenario_c_reconcile_covers_gap_once() {
        let mut h = Harness::fresh(MockChain::new(90), Some(90)).await;
        h.live_at(90).await;

        let seen_live = mock::staked(mock::wallet(0xc), ETHER, 100, 0);
        assert!(h.chain.emit(ChainEvent::Log(seen_live.clone())).await);
        let store = h.store.clone();
        eventually(|| store.event_count() == 1).await;

        h.chain.push_log(seen_live);
        h.chain.push_log(mock::claimed(mock::wallet(0xc), ETHER / 10, 110, 1));
        h.chain.set_height(120);
        h.trigger.send(()).await.unwrap();
        h.wait_for(|s| s.state == IndexerState::Live && s.last_processed_block == 120)
            .await;

        assert_eq!(h.chain.calls(), vec![(91, 120)]);
        assert_eq!(h.store.event_count(), 2);
        assert_eq!(h.store.notification_count(), 2);
        assert_eq!(h.checkpoint().await, 120);
        h.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_mid_backfill_keeps_completed_batches() {
        let chain = MockChain::new(3_000);
        let gate = chain.gate_range(2_001);
        let mut h = Harness::fresh(chain, Some(0)).await;

        tokio::time::timeout(Duration::from_secs(5), gate.entered.notified())
            .await
            .unwrap();
        h.wait_for(|s| s.last_processed_block == 2_000).await;
        h.cancel.cancel();

        let status = h.wait_for(|s| s.state == IndexerState::Stopped).await;
        assert!(!status.is_listening);
        assert_eq!(status.last_processed_block, 2_000);
        assert_eq!(h.checkpoint().await, 2_000);
        assert_eq!(h.chain.calls(), vec![(1, 1_000), (1_001, 2_000), (2_001, 3_000)]);
        assert!(h.task.await.unwrap().is_ok());
    }

    struct Recorder(Arc<Mutex<Vec<(u64, u64)>>>);

    #[async_trait]
    impl Projector for Recorder {
        fn kind(&self) -> EventKind {
            EventKind::StakeOpened
        }

        async fn apply(&self, event: &RawEvent) -> Result<(), IndexerError> {
            self.0.lock().unwrap().push(event.ordering_key());
            Ok(())
        }
    }

    #[tokio::test]
    async fn batches_dispatch_in_block_and_log_order() {
        let chain = MockChain::new(200);
        chain.push_log(mock::staked(mock::wallet(1), 1, 150, 0));
        chain.push_log(mock::staked(mock::wallet(2), 1, 120, 7));
        chain.push_log(mock::staked(mock::wallet(3), 1, 120, 2));
        // Same (tx, log index) twice in one response.
        chain.push_log(mock::staked(mock::wallet(3), 1, 120, 2));

        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        checkpoints.save(100).await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ProjectorRegistry::new();
        registry.register(Arc::new(Recorder(seen.clone())));

        let mut h = Harness::start(
            Arc::new(chain),
            checkpoints,
            Arc::new(MemoryProjectionStore::new()),
            Some(registry),
            test_settings(),
        )
        .await;
        h.live_at(200).await;

        assert_eq!(*seen.lock().unwrap(), vec![(120, 2), (120, 7), (150, 0)]);
        h.stop().await.unwrap();
    }

    #[tokio::test]
    async fn redelivery_through_live_is_harmless() {
        let logs = [
            mock::staked(mock::wallet(0xd), 2 * ETHER, 40, 0),
            mock::unstaked(mock::wallet(0xd), ETHER, 45, 1),
            mock::claimed(mock::wallet(0xd), ETHER / 4, 46, 0),
        ];
        let chain = MockChain::new(50);
        for log in &logs {
            chain.push_log(log.clone());
        }

        let mut h = Harness::fresh(chain, Some(30)).await;
        h.live_at(50).await;
        let once = h.store.user_aggregate(&user(0xd)).await.unwrap();

        for log in &logs {
            assert!(h.chain.emit(ChainEvent::Log(log.clone())).await);
        }
        assert!(h.chain.emit(ChainEvent::NewBlock(50)).await);
        assert!(h.chain.emit(ChainEvent::NewBlock(51)).await);
        h.live_at(51).await;

        assert_eq!(h.store.user_aggregate(&user(0xd)).await.unwrap(), once);
        assert_eq!(h.store.event_count(), 3);
        assert_eq!(h.store.notification_count(), 3);
        h.stop().await.unwrap();
    }

    #[tokio::test]
    async fn checkpoint_survives_restart_without_regressing() {
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        checkpoints.save(100).await.unwrap();
        let store = Arc::new(MemoryProjectionStore::new());

        let mut h = Harness::start(
            Arc::new(MockChain::new(120)),
            checkpoints.clone(),
            store.clone(),
            None,
            test_settings(),
        )
        .await;
        h.live_at(120).await;
        h.stop().await.unwrap();

        // Restart against a node that lags behind the stored checkpoint.
        let mut h = Harness::start(
            Arc::new(MockChain::new(110)),
            checkpoints.clone(),
            store,
            None,
            test_settings(),
        )
        .await;
        let status = h.live_at(120).await;
        assert_eq!(status.current_block, 110);
        assert!(h.chain.calls().is_empty());

        assert!(h.chain.emit(ChainEvent::NewBlock(115)).await);
        assert!(h.chain.emit(ChainEvent::NewBlock(121)).await);
        h.live_at(121).await;
        assert_eq!(h.checkpoint().await, 121);
        h.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_logs_do_not_abort_the_batch() {
        let chain = MockChain::new(20);
        chain.push_log(mock::transfer(mock::wallet(1), mock::wallet(2), 5, 11, 0));
        let mut odd = mock::staked(mock::wallet(3), 1, 12, 0);
        odd.topics[0] = alloy::primitives::B256::repeat_byte(0x42);
        chain.push_log(odd);
        chain.push_log(mock::staked(mock::wallet(4), ETHER, 13, 0));

        let mut h = Harness::fresh(chain, Some(10)).await;
        h.live_at(20).await;

        assert_eq!(h.store.event_count(), 1);
        assert_eq!(
            h.store
                .query_events(&EventQuery::for_wallet(user(4)))
                .await
                .unwrap()
                .len(),
            1
        );
        h.stop().await.unwrap();
    }

    #[tokio::test]
    async fn oversized_ranges_are_halved() {
        let chain = MockChain::new(1_000);
        chain.set_max_range(300);
        chain.push_log(mock::staked(mock::wallet(5), ETHER, 10, 0));
        chain.push_log(mock::staked(mock::wallet(5), ETHER, 990, 0));

        let mut h = Harness::fresh(chain, Some(0)).await;
        h.live_at(1_000).await;

        let calls = h.chain.calls();
        assert_eq!(calls[0], (1, 1_000));
        let served: Vec<_> = calls.into_iter().filter(|(f, t)| t - f + 1 <= 300).collect();
        assert_eq!(served.first(), Some(&(1, 250)));
        assert_eq!(served.last(), Some(&(751, 1_000)));
        assert_eq!(h.store.event_count(), 2);
        h.stop().await.unwrap();
    }

    #[tokio::test]
    async fn failed_batch_holds_checkpoint_until_recovered() {
        let chain = MockChain::new(100);
        chain.push_log(mock::staked(mock::wallet(6), ETHER, 95, 0));
        // Two in-place attempts with batch_max_retries = 2.
        chain.fail_range(91, 2);

        let mut h = Harness::fresh(chain, Some(90)).await;
        let status = h.wait_for(|s| s.state == IndexerState::Live).await;
        assert_eq!(status.pending_ranges, 1);
        assert_eq!(status.last_processed_block, 90);
        assert_eq!(h.checkpoint().await, 90);
        assert_eq!(h.store.event_count(), 0);
        assert_eq!(h.chain.subscribed_from(), Some(101));

        // Live progress past the parked range is not saved either.
        assert!(h.chain.emit(ChainEvent::NewBlock(105)).await);
        let status = h.wait_for(|s| s.current_block == 105).await;
        assert_eq!(status.last_processed_block, 90);
        assert_eq!(h.checkpoint().await, 90);

        h.trigger.send(()).await.unwrap();
        h.wait_for(|s| s.pending_ranges == 0 && s.state == IndexerState::Live)
            .await;
        assert_eq!(h.store.event_count(), 1);
        assert_eq!(h.chain.calls(), vec![(91, 100), (91, 100), (91, 100)]);
        assert_eq!(h.checkpoint().await, 105);
        h.stop().await.unwrap();
    }

    #[tokio::test]
    async fn parked_range_is_reprocessed_after_restart() {
        let chain = MockChain::new(100);
        chain.push_log(mock::staked(mock::wallet(6), ETHER, 95, 0));
        chain.fail_range(91, 2);
        let chain = Arc::new(chain);
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        checkpoints.save(90).await.unwrap();
        let store = Arc::new(MemoryProjectionStore::new());

        let mut h = Harness::start(
            chain.clone(),
            checkpoints.clone(),
            store.clone(),
            None,
            test_settings(),
        )
        .await;
        h.wait_for(|s| s.state == IndexerState::Live && s.pending_ranges == 1)
            .await;
        h.stop().await.unwrap();
        assert_eq!(store.event_count(), 0);

        let mut h = Harness::start(chain, checkpoints, store, None, test_settings()).await;
        h.live_at(100).await;
        assert_eq!(h.store.event_count(), 1);
        assert_eq!(h.checkpoint().await, 100);
        h.stop().await.unwrap();
    }

    /// Rejects stakes at one block a fixed number of times.
    struct Flaky {
        seen: Arc<Mutex<Vec<(u64, u64)>>>,
        block: u64,
        failures: Mutex<u32>,
    }

    #[async_trait]
    impl Projector for Flaky {
        fn kind(&self) -> EventKind {
            EventKind::StakeOpened
        }

        async fn apply(&self, event: &RawEvent) -> Result<(), IndexerError> {
            if event.block_number == self.block {
                let mut left = self.failures.lock().unwrap();
                if *left > 0 {
                    *left -= 1;
                    return Err(IndexerError::ProjectionWrite {
                        event_id: event.id().to_string(),
                        reason: "constraint violated".into(),
                    });
                }
            }
            self.seen.lock().unwrap().push(event.ordering_key());
            Ok(())
        }
    }

    #[tokio::test]
    async fn rejected_event_does_not_block_the_rest_of_its_batch() {
        let chain = MockChain::new(200);
        chain.push_log(mock::staked(mock::wallet(1), 1, 110, 0));
        chain.push_log(mock::staked(mock::wallet(2), 1, 120, 0));
        chain.push_log(mock::staked(mock::wallet(3), 1, 150, 0));

        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        checkpoints.save(100).await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ProjectorRegistry::new();
        registry.register(Arc::new(Flaky {
            seen: seen.clone(),
            block: 120,
            failures: Mutex::new(1),
        }));

        let mut h = Harness::start(
            Arc::new(chain),
            checkpoints,
            Arc::new(MemoryProjectionStore::new()),
            Some(registry),
            test_settings(),
        )
        .await;
        let status = h.wait_for(|s| s.state == IndexerState::Live).await;
        assert_eq!(*seen.lock().unwrap(), vec![(110, 0), (150, 0)]);
        assert_eq!(status.pending_ranges, 1);
        assert_eq!(status.last_processed_block, 119);
        assert_eq!(h.checkpoint().await, 119);

        h.trigger.send(()).await.unwrap();
        h.wait_for(|s| s.pending_ranges == 0 && s.last_processed_block == 200)
            .await;
        assert_eq!(*seen.lock().unwrap(), vec![(110, 0), (150, 0), (120, 0)]);
        assert_eq!(h.chain.calls(), vec![(101, 200), (120, 120)]);
        assert_eq!(h.checkpoint().await, 200);
        h.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_node_is_fatal_during_init() {
        let chain = MockChain::new(10);
        chain.fail_height(5);
        let mut h = Harness::fresh(chain, None).await;

        let status = h.wait_for(|s| s.state == IndexerState::Stopped && s.current_block == 0)
            .await;
        assert!(!status.is_listening);
        assert!(matches!(
            h.task.await.unwrap(),
            Err(IndexerError::Connection(_))
        ));
    }
}
