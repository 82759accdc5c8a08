use std::sync::Arc;

use async_trait::async_trait;
use log::info;

use crate::{
    db::{models::EventKind, models::RawEvent, ProjectionStore},
    error::IndexerError,
    projectors::{ensure_kind, project, Projector},
    utils::format_ether,
};

/// Projects `RewardsClaimed`: the only kind counted in `total_rewards_earned`.
pub struct RewardClaimProjector {
    store: Arc<dyn ProjectionStore>,
}

impl RewardClaimProjector {
    pub fn new(store: Arc<dyn ProjectionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Projector for RewardClaimProjector {
    fn kind(&self) -> EventKind {
        EventKind::RewardClaimed
    }

    async fn apply(&self, event: &RawEvent) -> Result<(), IndexerError> {
        ensure_kind(self.kind(), event)?;
        project(self.store.as_ref(), event).await?;
        info!(
            "{} claimed {} MNT at block {}",
            event.wallet(),
            format_ether(event.payload.amount()),
            event.block_number
        );
        Ok(())
    }
}
