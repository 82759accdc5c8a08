use std::collections::BTreeMap;
use std::fmt;

use alloy::primitives::U256;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::parse_u256;

/// Known contract event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// `Staked(user, amount, timestamp)` on the stake contract.
    StakeOpened,
    /// `Unstaked(user, amount, timestamp)` on the stake contract.
    StakeClosed,
    /// `RewardsClaimed(user, amount, timestamp)` on the stake contract.
    RewardClaimed,
    /// Reward token `Transfer` sent by a watched contract.
    TokenTransferred,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::StakeOpened,
        EventKind::StakeClosed,
        EventKind::RewardClaimed,
        EventKind::TokenTransferred,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StakeOpened => "stake_opened",
            Self::StakeClosed => "stake_closed",
            Self::RewardClaimed => "reward_claimed",
            Self::TokenTransferred => "token_transferred",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strongly typed event arguments. Addresses are lowercase 0x-hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    StakeOpened {
        user: String,
        amount: U256,
        timestamp: U256,
    },
    StakeClosed {
        user: String,
        amount: U256,
        timestamp: U256,
    },
    RewardClaimed {
        user: String,
        amount: U256,
        timestamp: U256,
    },
    TokenTransferred {
        from: String,
        to: String,
        value: U256,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::StakeOpened { .. } => EventKind::StakeOpened,
            Self::StakeClosed { .. } => EventKind::StakeClosed,
            Self::RewardClaimed { .. } => EventKind::RewardClaimed,
            Self::TokenTransferred { .. } => EventKind::TokenTransferred,
        }
    }

    /// The wallet whose read-models this event touches.
    pub fn wallet(&self) -> &str {
        match self {
            Self::StakeOpened { user, .. }
            | Self::StakeClosed { user, .. }
            | Self::RewardClaimed { user, .. } => user,
            Self::TokenTransferred { to, .. } => to,
        }
    }

    /// The amount moved by this event, in wei.
    pub fn amount(&self) -> U256 {
        match self {
            Self::StakeOpened { amount, .. }
            | Self::StakeClosed { amount, .. }
            | Self::RewardClaimed { amount, .. } => *amount,
            Self::TokenTransferred { value, .. } => *value,
        }
    }

    /// String rendering of the arguments, as persisted in `event_data`.
    pub fn arguments(&self) -> BTreeMap<String, String> {
        let mut args = BTreeMap::new();
        match self {
            Self::StakeOpened { user, amount, timestamp }
            | Self::StakeClosed { user, amount, timestamp }
            | Self::RewardClaimed { user, amount, timestamp } => {
                args.insert("user".to_string(), user.clone());
                args.insert("amount".to_string(), amount.to_string());
                args.insert("timestamp".to_string(), timestamp.to_string());
            },
            Self::TokenTransferred { from, to, value } => {
                args.insert("from".to_string(), from.clone());
                args.insert("to".to_string(), to.clone());
                args.insert("value".to_string(), value.to_string());
            },
        }
        args
    }

    /// Rebuild a payload from its persisted kind and arguments.
    pub fn from_arguments(kind: EventKind, args: &BTreeMap<String, String>) -> Option<Self> {
        let text = |key: &str| args.get(key).cloned();
        let number = |key: &str| args.get(key).and_then(|v| parse_u256(v));

        Some(match kind {
            EventKind::StakeOpened => Self::StakeOpened {
                user: text("user")?,
                amount: number("amount")?,
                timestamp: number("timestamp")?,
            },
            EventKind::StakeClosed => Self::StakeClosed {
                user: text("user")?,
                amount: number("amount")?,
                timestamp: number("timestamp")?,
            },
            EventKind::RewardClaimed => Self::RewardClaimed {
                user: text("user")?,
                amount: number("amount")?,
                timestamp: number("timestamp")?,
            },
            EventKind::TokenTransferred => Self::TokenTransferred {
                from: text("from")?,
                to: text("to")?,
                value: number("value")?,
            },
        })
    }
}

/// Identity of a contract event: `(transaction_hash, log_index)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId {
    pub transaction_hash: String,
    pub log_index: u64,
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transaction_hash, self.log_index)
    }
}

/// Normalized contract event, stored append-only in `indexer.contract_events`.
///
/// Primary Key: (transaction_hash, log_index)
/// Ordering: (block_number, log_index) ascending
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub contract_address: String,
    pub payload: EventPayload,
    pub transaction_hash: String,
    pub block_number: u64,
    pub log_index: u64,
    pub observed_at: DateTime<Utc>,
}

impl RawEvent {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn id(&self) -> EventId {
        EventId {
            transaction_hash: self.transaction_hash.clone(),
            log_index: self.log_index,
        }
    }

    pub fn ordering_key(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }

    pub fn wallet(&self) -> &str {
        self.payload.wallet()
    }

    pub fn arguments(&self) -> BTreeMap<String, String> {
        self.payload.arguments()
    }
}
