use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    db::models::{EventPayload, RawEvent},
    utils::format_ether,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Success,
    Info,
    Warning,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Info => "info",
            Self::Warning => "warning",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            _ => None,
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-facing notification (PostgreSQL)
///
/// Primary Key: id (the triggering event identity, `<tx_hash>:<log_index>`)
///
/// Written once by the projectors; only `read` changes afterwards, and only
/// through an external actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_wallet: String,
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// The notification announcing `event` to its wallet.
    pub fn for_event(event: &RawEvent) -> Self {
        let (title, message, kind) = match &event.payload {
            EventPayload::StakeOpened { amount, .. } => (
                "Stake Successful",
                format!("You have successfully staked {} ETH", format_ether(*amount)),
                NotificationKind::Success,
            ),
            EventPayload::StakeClosed { amount, .. } => (
                "Unstake Successful",
                format!("You have successfully unstaked {} ETH", format_ether(*amount)),
                NotificationKind::Success,
            ),
            EventPayload::RewardClaimed { amount, .. } => (
                "Rewards Claimed",
                format!(
                    "You have claimed {} MNT tokens as rewards",
                    format_ether(*amount)
                ),
                NotificationKind::Success,
            ),
            EventPayload::TokenTransferred { value, .. } => (
                "Reward Distributed",
                format!("{} MNT was distributed to your wallet", format_ether(*value)),
                NotificationKind::Info,
            ),
        };

        Self {
            id: event.id().to_string(),
            user_wallet: event.wallet().to_string(),
            title: title.to_string(),
            message,
            kind,
            read: false,
            created_at: Utc::now(),
        }
    }
}
