use alloy::primitives::U256;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use rustc_hash::FxHashMap;

use crate::{
    db::models::{EventKind, RawEvent},
    utils::wei_to_ether,
};

/// Per-wallet staking summary (PostgreSQL)
///
/// Primary Key: wallet_id
///
/// Always rebuilt from the wallet's full event history, never incremented,
/// so replaying an event cannot double-count it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAggregate {
    pub wallet_id: String,
    /// Net stake in wei: opened minus closed, floored at zero.
    pub total_staked: U256,
    /// Claimed rewards in wei.
    pub total_rewards_earned: U256,
    /// Stake opened + stake closed events.
    pub stake_event_count: u64,
    pub last_activity_at: DateTime<Utc>,
}

impl UserAggregate {
    /// Fold a wallet's history. Returns `None` when it has no events.
    pub fn from_history(wallet_id: &str, events: &[RawEvent]) -> Option<Self> {
        let mut opened = U256::ZERO;
        let mut closed = U256::ZERO;
        let mut rewards = U256::ZERO;
        let mut stake_event_count = 0u64;
        let mut last_activity_at: Option<DateTime<Utc>> = None;

        for event in events.iter().filter(|e| e.wallet() == wallet_id) {
            let amount = event.payload.amount();
            match event.kind() {
                EventKind::StakeOpened => {
                    opened = opened.saturating_add(amount);
                    stake_event_count += 1;
                },
                EventKind::StakeClosed => {
                    closed = closed.saturating_add(amount);
                    stake_event_count += 1;
                },
                EventKind::RewardClaimed => rewards = rewards.saturating_add(amount),
                // The matching claim already accounts for the payout.
                EventKind::TokenTransferred => {},
            }
            last_activity_at = last_activity_at.max(Some(event.observed_at));
        }

        Some(Self {
            wallet_id: wallet_id.to_string(),
            total_staked: opened.saturating_sub(closed),
            total_rewards_earned: rewards,
            stake_event_count,
            last_activity_at: last_activity_at?,
        })
    }

    pub fn total_staked_ether(&self) -> BigDecimal {
        wei_to_ether(self.total_staked)
    }

}

/// Contract-wide rollup for one UTC calendar day (PostgreSQL)
///
/// Primary Key: date
///
/// A cumulative snapshot as of the end of `date`, rebuilt from every event
/// observed on or before that day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyAggregate {
    pub date: NaiveDate,
    pub total_staked: U256,
    /// Distinct wallets with stake activity.
    pub total_users: u64,
    pub total_rewards_distributed: U256,
    /// `total_staked / total_users`, zero without users.
    pub average_stake_amount: U256,
}

impl DailyAggregate {
    pub fn from_history(date: NaiveDate, events: &[RawEvent]) -> Self {
        let mut stakes: FxHashMap<&str, (U256, U256)> = FxHashMap::default();
        let mut rewards = U256::ZERO;

        for event in events.iter().filter(|e| e.observed_at.date_naive() <= date) {
            let amount = event.payload.amount();
            match event.kind() {
                EventKind::StakeOpened => {
                    let entry = stakes.entry(event.wallet()).or_default();
                    entry.0 = entry.0.saturating_add(amount);
                },
                EventKind::StakeClosed => {
                    let entry = stakes.entry(event.wallet()).or_default();
                    entry.1 = entry.1.saturating_add(amount);
                },
                EventKind::RewardClaimed => rewards = rewards.saturating_add(amount),
                EventKind::TokenTransferred => {},
            }
        }

        let total_staked = stakes
            .values()
            .fold(U256::ZERO, |acc, (opened, closed)| acc.saturating_add(opened.saturating_sub(*closed)));

        Self::from_totals(date, total_staked, stakes.len() as u64, rewards)
    }

    /// Rollup from sums computed elsewhere; fills in the average.
    pub fn from_totals(
        date: NaiveDate,
        total_staked: U256,
        total_users: u64,
        total_rewards_distributed: U256,
    ) -> Self {
        let average_stake_amount = if total_users > 0 {
            total_staked / U256::from(total_users)
        } else {
            U256::ZERO
        };

        Self {
            date,
            total_staked,
            total_users,
            total_rewards_distributed,
            average_stake_amount,
        }
    }

    pub fn total_staked_ether(&self) -> BigDecimal {
        wei_to_ether(self.total_staked)
    }

    pub fn average_stake_amount_ether(&self) -> BigDecimal {
        wei_to_ether(self.average_stake_amount)
    }
}
