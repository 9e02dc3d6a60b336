//! Fixed-width, lexicographically comparable checkpoint codec.
//!
//! A `Checkpoint` totally orders events: within a chain by
//! `(block_number, transaction_index, event_type_rank, event_index)`; across
//! chains by `(block_timestamp, chain_id)` first. Encoding is a
//! zero-padded decimal concatenation so two checkpoints compare equal under
//! `Ord` iff their encoded strings compare equal under byte order.

use std::cmp::Ordering;
use std::fmt;

/// Event-type ranks used as a tiebreaker within the same transaction index.
/// Ranks are stable across releases since they are embedded in the encoded
/// checkpoint string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum EventTypeRank {
    Block = 0,
    Transaction = 1,
    Transfer = 2,
    Log = 3,
    Trace = 4,
}

/// Field widths, chosen once centrally.
/// `block_timestamp` and `chain_id` lead the tuple, in that order, so
/// cross-chain ordering falls directly out of a lexicographic compare: the
/// global event order across chains is by block_timestamp then chain_id.
mod width {
    pub const CHAIN_ID: usize = 10;
    pub const BLOCK_TIMESTAMP: usize = 20;
    pub const BLOCK_NUMBER: usize = 16;
    pub const TX_INDEX: usize = 10;
    pub const EVENT_TYPE_RANK: usize = 1;
    pub const EVENT_INDEX: usize = 10;
}

/// Total-order key for one raw record, across chains and across reorgs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checkpoint {
    pub chain_id: u64,
    pub block_number: u64,
    pub block_timestamp: u64,
    pub transaction_index: u32,
    pub event_type_rank: u8,
    pub event_index: u32,
}

impl Checkpoint {
    pub fn new(
        chain_id: u64,
        block_number: u64,
        block_timestamp: u64,
        transaction_index: u32,
        event_type_rank: u8,
        event_index: u32,
    ) -> Self {
        Self {
            chain_id,
            block_number,
            block_timestamp,
            transaction_index,
            event_type_rank,
            event_index,
        }
    }

    /// The smallest possible checkpoint for a chain at a given block, used
    /// by the reorg controller to bound a `effective_from >= c` deletion.
    pub fn floor(chain_id: u64, block_number: u64) -> Self {
        Self {
            chain_id,
            block_number,
            block_timestamp: 0,
            transaction_index: 0,
            event_type_rank: 0,
            event_index: 0,
        }
    }

    /// Encode as the fixed-width, lexicographically comparable string
    /// persisted in `effective_from`/`effective_to` columns.
    pub fn encode(&self) -> String {
        format!(
            "{:0tw$}{:0cw$}{:0bw$}{:0xw$}{:0rw$}{:0ew$}",
            self.block_timestamp,
            self.chain_id,
            self.block_number,
            self.transaction_index,
            self.event_type_rank,
            self.event_index,
            tw = width::BLOCK_TIMESTAMP,
            cw = width::CHAIN_ID,
            bw = width::BLOCK_NUMBER,
            xw = width::TX_INDEX,
            rw = width::EVENT_TYPE_RANK,
            ew = width::EVENT_INDEX,
        )
    }

    pub fn decode(s: &str) -> Option<Checkpoint> {
        let mut offset = 0;
        let take = |s: &str, offset: &mut usize, width: usize| -> Option<&str> {
            let slice = s.get(*offset..*offset + width)?;
            *offset += width;
            Some(slice)
        };

        let block_timestamp = take(s, &mut offset, width::BLOCK_TIMESTAMP)?.parse().ok()?;
        let chain_id = take(s, &mut offset, width::CHAIN_ID)?.parse().ok()?;
        let block_number = take(s, &mut offset, width::BLOCK_NUMBER)?.parse().ok()?;
        let transaction_index = take(s, &mut offset, width::TX_INDEX)?.parse().ok()?;
        let event_type_rank = take(s, &mut offset, width::EVENT_TYPE_RANK)?.parse().ok()?;
        let event_index = take(s, &mut offset, width::EVENT_INDEX)?.parse().ok()?;

        if offset != s.len() {
            return None;
        }

        Some(Checkpoint {
            chain_id,
            block_number,
            block_timestamp,
            transaction_index,
            event_type_rank,
            event_index,
        })
    }

    /// The maximum representable checkpoint, used as a sentinel "+∞" for
    /// `effective_to` on a row version that is still current.
    pub fn infinity() -> Checkpoint {
        Checkpoint {
            chain_id: 10u64.pow(width::CHAIN_ID as u32 - 1) - 1,
            block_number: 10u64.pow(width::BLOCK_NUMBER as u32 - 1) - 1,
            block_timestamp: 10u64.pow(width::BLOCK_TIMESTAMP as u32 - 1) - 1,
            transaction_index: 10u32.pow(width::TX_INDEX as u32 - 1) - 1,
            event_type_rank: 9,
            event_index: 10u32.pow(width::EVENT_INDEX as u32 - 1) - 1,
        }
    }
}

impl PartialOrd for Checkpoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Checkpoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.encode().cmp(&other.encode())
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let cp = Checkpoint::new(1, 19_000_000, 1_700_000_000, 3, 3, 1);
        let encoded = cp.encode();
        assert_eq!(Checkpoint::decode(&encoded), Some(cp));
    }

    #[test]
    fn strictly_increasing_within_a_chain() {
        let a = Checkpoint::new(1, 100, 1_000, 0, 0, 0);
        let b = Checkpoint::new(1, 100, 1_000, 0, 0, 1);
        let c = Checkpoint::new(1, 101, 1_001, 0, 0, 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn cross_chain_orders_by_timestamp_then_chain() {
        let earlier_other_chain = Checkpoint::new(2, 50, 999, 0, 0, 0);
        let later_chain_one = Checkpoint::new(1, 100, 1_000, 0, 0, 0);
        assert!(earlier_other_chain < later_chain_one);

        let same_ts_chain_1 = Checkpoint::new(1, 100, 1_000, 0, 0, 0);
        let same_ts_chain_2 = Checkpoint::new(2, 100, 1_000, 0, 0, 0);
        assert!(same_ts_chain_1 < same_ts_chain_2);
    }

    #[test]
    fn encoded_order_matches_struct_order() {
        let mut checkpoints = vec![
            Checkpoint::new(2, 10, 500, 0, 0, 0),
            Checkpoint::new(1, 10, 500, 0, 0, 0),
            Checkpoint::new(1, 10, 400, 5, 0, 0),
            Checkpoint::new(1, 10, 400, 5, 1, 0),
        ];
        let mut encoded: Vec<String> = checkpoints.iter().map(Checkpoint::encode).collect();
        checkpoints.sort();
        encoded.sort();
        let resorted_encoded: Vec<String> = checkpoints.iter().map(Checkpoint::encode).collect();
        assert_eq!(encoded, resorted_encoded);
    }

    #[test]
    fn infinity_is_greater_than_any_realistic_checkpoint() {
        let realistic = Checkpoint::new(99999, 99_999_999, 9_999_999_999, 500, 4, 20);
        assert!(realistic < Checkpoint::infinity());
    }
}
