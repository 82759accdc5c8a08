//! Scripted [`ChainClient`] for tests.

use std::sync::{Arc, Mutex};

use alloy::{
    primitives::{Address, B256, U256},
    sol_types::SolEvent,
};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::{
    abis::{RewardsClaimed, Staked, Transfer, Unstaked},
    chain::{ChainClient, ChainEvent, LogFilter, RawLogEntry, SubscriptionHandle},
    error::IndexerError,
};

pub const STAKE_CONTRACT: Address = Address::repeat_byte(0x5a);
pub const REWARD_TOKEN: Address = Address::repeat_byte(0x7e);

/// 10^18 wei.
pub const ETHER: u128 = 1_000_000_000_000_000_000;

pub fn wallet(byte: u8) -> Address {
    Address::repeat_byte(byte)
}

fn entry(
    address: Address,
    data: alloy::primitives::LogData,
    block: u64,
    log_index: u64,
) -> RawLogEntry {
    RawLogEntry {
        address,
        topics: data.topics().to_vec(),
        data: data.data,
        transaction_hash: Some(B256::left_padding_from(&[(block % 256) as u8, log_index as u8, 0xee])),
        block_number: Some(block),
        log_index: Some(log_index),
        block_timestamp: Some(1_767_225_600 + block * 12),
    }
}

pub fn staked(user: Address, wei: u128, block: u64, log_index: u64) -> RawLogEntry {
    let event = Staked {
        user,
        amount: U256::from(wei),
        timestamp: U256::from(1_767_225_600 + block * 12),
    };
    entry(STAKE_CONTRACT, event.encode_log_data(), block, log_index)
}

pub fn unstaked(user: Address, wei: u128, block: u64, log_index: u64) -> RawLogEntry {
    let event = Unstaked {
        user,
        amount: U256::from(wei),
        timestamp: U256::from(1_767_225_600 + block * 12),
    };
    entry(STAKE_CONTRACT, event.encode_log_data(), block, log_index)
}

pub fn claimed(user: Address, wei: u128, block: u64, log_index: u64) -> RawLogEntry {
    let event = RewardsClaimed {
        user,
        amount: U256::from(wei),
        timestamp: U256::from(1_767_225_600 + block * 12),
    };
    entry(STAKE_CONTRACT, event.encode_log_data(), block, log_index)
}

pub fn transfer(from: Address, to: Address, wei: u128, block: u64, log_index: u64) -> RawLogEntry {
    let event = Transfer {
        from,
        to,
        value: U256::from(wei),
    };
    entry(REWARD_TOKEN, event.encode_log_data(), block, log_index)
}

/// A call to `logs_in_range` that parks until released or cancelled.
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

#[derive(Default)]
struct Script {
    height: u64,
    logs: Vec<RawLogEntry>,
    /// Widest range served before answering `RangeTooLarge`.
    max_range: Option<u64>,
    height_failures: u32,
    /// Remaining failures keyed by range start.
    range_failures: FxHashMap<u64, u32>,
    gates: FxHashMap<u64, Arc<Gate>>,
    calls: Vec<(u64, u64)>,
    sink: Option<mpsc::Sender<ChainEvent>>,
    subscribed_from: Option<u64>,
}

#[derive(Default)]
pub struct MockChain {
    script: Mutex<Script>,
}

impl MockChain {
    pub fn new(height: u64) -> Self {
        let chain = Self::default();
        chain.set_height(height);
        chain
    }

    pub fn set_height(&self, height: u64) {
        self.script.lock().unwrap().height = height;
    }

    pub fn push_log(&self, log: RawLogEntry) {
        self.script.lock().unwrap().logs.push(log);
    }

    pub fn set_max_range(&self, blocks: u64) {
        self.script.lock().unwrap().max_range = Some(blocks);
    }

    pub fn fail_height(&self, times: u32) {
        self.script.lock().unwrap().height_failures = times;
    }

    pub fn fail_range(&self, from: u64, times: u32) {
        self.script.lock().unwrap().range_failures.insert(from, times);
    }

    pub fn gate_range(&self, from: u64) -> Arc<Gate> {
        let gate = Arc::new(Gate {
            entered: Notify::new(),
            release: Notify::new(),
        });
        self.script.lock().unwrap().gates.insert(from, gate.clone());
        gate
    }

    /// Every `logs_in_range` call so far, in order.
    pub fn calls(&self) -> Vec<(u64, u64)> {
        self.script.lock().unwrap().calls.clone()
    }

    pub fn subscribed_from(&self) -> Option<u64> {
        self.script.lock().unwrap().subscribed_from
    }

    /// Push an event through the live subscription, if any.
    pub async fn emit(&self, event: ChainEvent) -> bool {
        let sink = self.script.lock().unwrap().sink.clone();
        match sink {
            Some(sink) => sink.send(event).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn current_height(&self) -> Result<u64, IndexerError> {
        let mut script = self.script.lock().unwrap();
        if script.height_failures > 0 {
            script.height_failures -= 1;
            return Err(IndexerError::Connection("node unreachable".into()));
        }
        Ok(script.height)
    }

    async fn logs_in_range(
        &self,
        from: u64,
        to: u64,
        filter: &LogFilter,
    ) -> Result<Vec<RawLogEntry>, IndexerError> {
        let gate = {
            let mut script = self.script.lock().unwrap();
            script.calls.push((from, to));
            script.gates.remove(&from)
        };
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        let mut script = self.script.lock().unwrap();
        if let Some(max) = script.max_range {
            if to - from + 1 > max {
                return Err(IndexerError::RangeTooLarge { from, to });
            }
        }
        if let Some(left) = script.range_failures.get_mut(&from) {
            if *left > 0 {
                *left -= 1;
                return Err(IndexerError::Connection("eth_getLogs reset by peer".into()));
            }
        }

        Ok(script
            .logs
            .iter()
            .filter(|log| {
                let block = log.block_number.unwrap_or_default();
                (from..=to).contains(&block)
                    && (filter.addresses.is_empty() || filter.addresses.contains(&log.address))
            })
            .cloned()
            .collect())
    }

    async fn subscribe(
        &self,
        filter: &LogFilter,
        sink: mpsc::Sender<ChainEvent>,
    ) -> Result<SubscriptionHandle, IndexerError> {
        let mut script = self.script.lock().unwrap();
        script.sink = Some(sink);
        script.subscribed_from = filter.from_block;
        Ok(SubscriptionHandle::new(CancellationToken::new()))
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) {
        handle.cancel();
        self.script.lock().unwrap().sink = None;
    }
}
