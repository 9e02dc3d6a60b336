//! Shared value types for raw chain records, decoded events, and the
//! in-memory chain-tail representation.

use std::sync::atomic::AtomicBool;

use serde::{Deserialize, Serialize};

use crate::checkpoint::Checkpoint;

pub type ChainId = u64;
pub type BlockNumber = u64;
pub type Address = alloy_primitives::Address;
pub type B256 = alloy_primitives::B256;

/// The subset of a block header the chain tail keeps in memory to detect
/// reorgs by parent-hash walk-back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightBlock {
    pub hash: B256,
    pub parent_hash: B256,
    pub number: BlockNumber,
    pub timestamp: u64,
}

/// A raw, undecoded chain record as returned by the RPC transport, tagged
/// with its source chain so downstream stages never need to thread it
/// through a side channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RawRecord {
    Block(RawBlock),
    Transaction(RawTransaction),
    Log(RawLog),
    Trace(RawTrace),
    Transfer(RawTransfer),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawBlock {
    pub chain_id: ChainId,
    pub hash: B256,
    pub parent_hash: B256,
    pub number: BlockNumber,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTransaction {
    pub chain_id: ChainId,
    pub block_number: BlockNumber,
    pub transaction_index: u32,
    pub hash: B256,
    pub from: Address,
    pub to: Option<Address>,
    pub input: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLog {
    pub chain_id: ChainId,
    pub block_number: BlockNumber,
    pub transaction_index: u32,
    pub log_index: u32,
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTrace {
    pub chain_id: ChainId,
    pub block_number: BlockNumber,
    pub transaction_index: u32,
    pub trace_address: Vec<u32>,
    pub from: Address,
    pub to: Option<Address>,
    pub input: Vec<u8>,
    pub value: alloy_primitives::U256,
}

/// A native value transfer extracted from a block's transactions, used by
/// `TransferFilter` sources that don't care about contract calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTransfer {
    pub chain_id: ChainId,
    pub block_number: BlockNumber,
    pub transaction_index: u32,
    pub from: Address,
    pub to: Address,
    pub value: alloy_primitives::U256,
}

/// A decoded event ready for the indexing cache: the raw record's
/// checkpoint, the filter fragment id that matched it, and the decoded
/// argument object (or `None` if decoding was skipped/failed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub checkpoint: Checkpoint,
    pub filter_id: u64,
    pub source_name: String,
    pub args: Option<serde_json::Value>,
}

/// Process-wide flags read by the shutdown path; a single-writer
/// `AtomicBool` rather than a mutex since only the active handler task
/// ever sets it.
#[derive(Debug, Default)]
pub struct RuntimeState {
    pub handler_in_flight: AtomicBool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn runtime_state_defaults_to_idle() {
        let state = RuntimeState::default();
        assert!(!state.handler_in_flight.load(Ordering::SeqCst));
    }
}
