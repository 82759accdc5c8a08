use std::{sync::Arc, time::Duration};

use log::{error, info, warn};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    chain::ChainClient,
    config::IndexerSettings,
    error::IndexerError,
    projectors::ProjectorRegistry,
    worker::{Indexer, IndexerState, IndexerStatus},
    Database,
};

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Represents a running indexer task
struct RunningIndexer {
    handle: JoinHandle<Result<(), IndexerError>>,
    cancel_token: CancellationToken,
}

/// Starts, stops and reports on a single [`Indexer`].
///
/// `start` and `stop` are idempotent. `status` never touches the network.
pub struct IndexerHandle {
    settings: IndexerSettings,
    chain: Arc<dyn ChainClient>,
    db: Database,
    status: Arc<watch::Sender<IndexerStatus>>,
    running: Mutex<Option<RunningIndexer>>,
}

impl IndexerHandle {
    pub fn new(settings: IndexerSettings, chain: Arc<dyn ChainClient>, db: Database) -> Self {
        let (status, _) = watch::channel(IndexerStatus::stopped(
            settings
                .watched_contracts
                .iter()
                .map(|c| c.to_lowercase())
                .collect(),
        ));

        Self {
            settings,
            chain,
            db,
            status: Arc::new(status),
            running: Mutex::new(None),
        }
    }

    /// Spawn the indexer. No-op while a previous run is still alive.
    pub async fn start(&self) -> Result<(), IndexerError> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            if !current.handle.is_finished() {
                warn!("Indexer '{}' is already running, skipping", self.settings.id);
                return Ok(());
            }
        }

        let registry = Arc::new(ProjectorRegistry::with_defaults(self.db.projections.clone()));
        let indexer = Indexer::new(
            self.settings.clone(),
            self.chain.clone(),
            self.db.checkpoints.clone(),
            registry,
            self.status.clone(),
        )?;

        let cancel_token = CancellationToken::new();
        let worker_token = cancel_token.clone();
        let id = self.settings.id.clone();

        let handle = tokio::spawn(async move {
            let result = indexer.run(worker_token).await;
            if let Err(e) = &result {
                error!("Indexer '{}' failed: {}", id, e);
            }
            result
        });

        *running = Some(RunningIndexer {
            handle,
            cancel_token,
        });
        info!(
            "Indexer '{}' started for {} contract(s)",
            self.settings.id,
            self.settings.watched_contracts.len()
        );
        Ok(())
    }

    /// Cancel the indexer and wait for it to wind down. No-op when stopped.
    ///
    /// Returns the run's fatal error, if it ended on one.
    pub async fn stop(&self) -> Result<(), IndexerError> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };

        info!("Stopping indexer '{}'", self.settings.id);
        running.cancel_token.cancel();

        let abort = running.handle.abort_handle();
        match tokio::time::timeout(STOP_TIMEOUT, running.handle).await {
            Ok(Ok(result)) => {
                info!("Indexer '{}' stopped gracefully", self.settings.id);
                result
            },
            Ok(Err(e)) => {
                error!("Indexer '{}' task panicked: {}", self.settings.id, e);
                self.publish_stopped();
                Ok(())
            },
            Err(_) => {
                warn!(
                    "Indexer '{}' did not stop within {:?}, aborting",
                    self.settings.id, STOP_TIMEOUT
                );
                abort.abort();
                self.publish_stopped();
                Ok(())
            },
        }
    }

    pub fn status(&self) -> IndexerStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<IndexerStatus> {
        self.status.subscribe()
    }

    fn publish_stopped(&self) {
        self.status.send_modify(|status| {
            status.is_listening = false;
            status.state = IndexerState::Stopped;
        });
    }
}
