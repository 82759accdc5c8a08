use std::sync::Arc;

use anyhow::Context;
use jemallocator::Jemalloc;
use log::{info, LevelFilter};
use simple_logger::SimpleLogger;

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use stake_indexer::{Database, IndexerHandle, RpcChainClient, Settings};

#[tokio::main()]
async fn main() -> anyhow::Result<()> {
    SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .init()
        .context("Failed to initialize logger")?;

    // Load configuration
    let settings =
        Settings::new().context("Failed to load config.yaml. Please ensure it exists and is valid")?;

    let db = Database::new(&settings)
        .await
        .context("Failed to initialize database connection")?;

    let chain = RpcChainClient::new(&settings.indexer)
        .context("Failed to build chain client. Check rpc_endpoint")?;

    let indexer = IndexerHandle::new(settings.indexer.clone(), Arc::new(chain), db);
    indexer.start().await.context("Failed to start indexer")?;

    #[cfg(unix)]
    let mut sigterm_stream = {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?
    };

    info!("Indexer running. Press Ctrl+C to stop.");

    #[cfg(unix)]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal (Ctrl+C), exiting gracefully...");
            },
            _ = sigterm_stream.recv() => {
                info!("Received SIGTERM, exiting gracefully...");
            },
        };
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal (Ctrl+C), exiting gracefully...");
            },
        };
    }

    let stopped = indexer.stop().await;
    let status = indexer.status();
    info!(
        "Stopped at block {} (chain at {}, {} range(s) pending)",
        status.last_processed_block, status.current_block, status.pending_ranges
    );
    stopped.context("Indexer ended with an error")?;
    Ok(())
}
