use std::sync::Arc;

use async_trait::async_trait;
use log::info;

use crate::{
    db::{models::EventKind, models::RawEvent, ProjectionStore},
    error::IndexerError,
    projectors::{ensure_kind, project, Projector},
    utils::format_ether,
};

/// Projects stake opened and stake closed events. One instance per kind.
pub struct StakeProjector {
    kind: EventKind,
    store: Arc<dyn ProjectionStore>,
}

impl StakeProjector {
    pub fn opened(store: Arc<dyn ProjectionStore>) -> Self {
        Self {
            kind: EventKind::StakeOpened,
            store,
        }
    }

    pub fn closed(store: Arc<dyn ProjectionStore>) -> Self {
        Self {
            kind: EventKind::StakeClosed,
            store,
        }
    }
}

#[async_trait]
impl Projector for StakeProjector {
    fn kind(&self) -> EventKind {
        self.kind
    }

    async fn apply(&self, event: &RawEvent) -> Result<(), IndexerError> {
        ensure_kind(self.kind, event)?;
        project(self.store.as_ref(), event).await?;

        let verb = if self.kind == EventKind::StakeOpened {
            "staked"
        } else {
            "unstaked"
        };
        info!(
            "{} {} {} ETH at block {}",
            event.wallet(),
            verb,
            format_ether(event.payload.amount()),
            event.block_number
        );
        Ok(())
    }
}
