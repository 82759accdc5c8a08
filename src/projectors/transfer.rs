use std::sync::Arc;

use async_trait::async_trait;
use log::info;

use crate::{
    db::{models::EventKind, models::RawEvent, ProjectionStore},
    error::IndexerError,
    projectors::{ensure_kind, project, Projector},
    utils::format_ether,
};

/// Projects reward token payouts sent by a watched contract.
///
/// The payout is recorded and notified, and refreshes the recipient's last
/// activity, but never adds to `total_rewards_earned`.
pub struct RewardTransferProjector {
    store: Arc<dyn ProjectionStore>,
}

impl RewardTransferProjector {
    pub fn new(store: Arc<dyn ProjectionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Projector for RewardTransferProjector {
    fn kind(&self) -> EventKind {
        EventKind::TokenTransferred
    }

    async fn apply(&self, event: &RawEvent) -> Result<(), IndexerError> {
        ensure_kind(self.kind(), event)?;
        project(self.store.as_ref(), event).await?;
        info!(
            "{} MNT distributed to {} at block {}",
            format_ether(event.payload.amount()),
            event.wallet(),
            event.block_number
        );
        Ok(())
    }
}
