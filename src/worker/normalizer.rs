//! Turns raw node logs into typed [`RawEvent`]s.

use alloy::{
    primitives::{Address, B256},
    sol_types::SolEvent,
};
use chrono::{DateTime, Utc};

use crate::{
    abis::{RewardsClaimed, Staked, Transfer, Unstaked},
    chain::{LogFilter, RawLogEntry},
    db::models::{EventPayload, RawEvent},
    error::IndexerError,
    utils::hex_encode,
};

/// Every topic0 the indexer asks the node for.
pub const EVENT_SIGNATURES: [B256; 4] = [
    Staked::SIGNATURE_HASH,
    Unstaked::SIGNATURE_HASH,
    RewardsClaimed::SIGNATURE_HASH,
    Transfer::SIGNATURE_HASH,
];

pub struct Normalizer {
    watched: Vec<Address>,
    /// First watched contract. The only sender whose transfers are payouts.
    stake_contract: Address,
}

impl Normalizer {
    pub fn new(watched_contracts: &[String]) -> Result<Self, IndexerError> {
        let watched = watched_contracts
            .iter()
            .map(|raw| {
                raw.parse::<Address>().map_err(|e| {
                    IndexerError::Config(format!("invalid watched contract {}: {}", raw, e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let Some(&stake_contract) = watched.first() else {
            return Err(IndexerError::Config("watched_contracts is empty".to_string()));
        };

        Ok(Self {
            watched,
            stake_contract,
        })
    }

    /// Watched contracts as lowercase 0x-hex.
    pub fn watched_contracts(&self) -> Vec<String> {
        self.watched.iter().map(|a| hex_encode(a.as_slice())).collect()
    }

    pub fn filter(&self) -> LogFilter {
        LogFilter {
            addresses: self.watched.clone(),
            topics: EVENT_SIGNATURES.to_vec(),
            from_block: None,
        }
    }

    pub fn normalize(&self, log: &RawLogEntry) -> Result<RawEvent, IndexerError> {
        let unknown = || IndexerError::UnknownEventKind {
            topic0: log
                .topic0()
                .map(|t| hex_encode(t.as_slice()))
                .unwrap_or_else(|| "none".to_string()),
            tx_hash: log
                .transaction_hash
                .map(|h| hex_encode(h.as_slice()))
                .unwrap_or_else(|| "pending".to_string()),
            log_index: log.log_index.unwrap_or_default(),
        };

        let (Some(tx_hash), Some(block_number), Some(log_index), Some(topic0)) = (
            log.transaction_hash,
            log.block_number,
            log.log_index,
            log.topic0(),
        ) else {
            return Err(unknown());
        };

        if !self.watched.contains(&log.address) {
            return Err(unknown());
        }

        let data = log.log_data();
        let address = |a: Address| hex_encode(a.as_slice());

        let payload = match topic0 {
            t if t == &Staked::SIGNATURE_HASH => {
                let event = Staked::decode_log_data(&data).map_err(|_| unknown())?;
                EventPayload::StakeOpened {
                    user: address(event.user),
                    amount: event.amount,
                    timestamp: event.timestamp,
                }
            },
            t if t == &Unstaked::SIGNATURE_HASH => {
                let event = Unstaked::decode_log_data(&data).map_err(|_| unknown())?;
                EventPayload::StakeClosed {
                    user: address(event.user),
                    amount: event.amount,
                    timestamp: event.timestamp,
                }
            },
            t if t == &RewardsClaimed::SIGNATURE_HASH => {
                let event = RewardsClaimed::decode_log_data(&data).map_err(|_| unknown())?;
                EventPayload::RewardClaimed {
                    user: address(event.user),
                    amount: event.amount,
                    timestamp: event.timestamp,
                }
            },
            t if t == &Transfer::SIGNATURE_HASH => {
                let event = Transfer::decode_log_data(&data).map_err(|_| unknown())?;
                if event.from != self.stake_contract {
                    return Err(unknown());
                }
                EventPayload::TokenTransferred {
                    from: address(event.from),
                    to: address(event.to),
                    value: event.value,
                }
            },
            _ => return Err(unknown()),
        };

        let observed_at = log
            .block_timestamp
            .and_then(|ts| DateTime::<Utc>::from_timestamp(i64::try_from(ts).ok()?, 0))
            .unwrap_or_else(Utc::now);

        Ok(RawEvent {
            contract_address: address(log.address),
            payload,
            transaction_hash: hex_encode(tx_hash.as_slice()),
            block_number,
            log_index,
            observed_at,
        })
    }
}
