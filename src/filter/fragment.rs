//! Compiled filter fragments: one per (chain, constraint set) combination
//! a [`crate::config::SourceConfig`] expands into at startup.

use std::collections::HashSet;

use crate::types::ChainId;

/// A constraint against a fixed-width byte value: match anything, match
/// exactly one value, or match any of a set. Compiled once so evaluation
/// never re-parses hex strings per record.
#[derive(Debug, Clone)]
pub enum MatchSet<const N: usize> {
    Any,
    One([u8; N]),
    Many(HashSet<[u8; N]>),
}

impl<const N: usize> MatchSet<N> {
    pub fn matches(&self, value: &[u8; N]) -> bool {
        match self {
            MatchSet::Any => true,
            MatchSet::One(v) => v == value,
            MatchSet::Many(set) => set.contains(value),
        }
    }
}

/// How a `Log` fragment constrains the emitting address: a fixed
/// `MatchSet`, or a reference to the [`crate::filter::ChildAddressRegistry`]
/// populated by a parent factory source's decoded child addresses.
#[derive(Debug, Clone)]
pub enum AddressConstraint {
    Fixed(MatchSet<20>),
    Factory,
}

#[derive(Debug, Clone)]
pub enum FragmentKind {
    Log {
        topic0: MatchSet<32>,
        address: AddressConstraint,
    },
    Block {
        interval: u64,
        offset: u64,
    },
    Transaction {
        from: MatchSet<20>,
        to: MatchSet<20>,
        selector: MatchSet<4>,
    },
    Trace {
        to: MatchSet<20>,
        selector: MatchSet<4>,
    },
    Transfer {
        from: MatchSet<20>,
        to: MatchSet<20>,
    },
}

#[derive(Debug, Clone)]
pub struct Fragment {
    /// Name of the source config this fragment was compiled from, used to
    /// attribute matched events and to resolve `FactorySource::parent_source`.
    pub source_name: String,
    /// `None` means the fragment applies across every configured chain
    /// (used for BlockFilter sources that name no specific chain).
    pub chain_id: Option<ChainId>,
    pub start_block: u64,
    /// `None` means the fragment has no upper bound (still open).
    pub end_block: Option<u64>,
    pub kind: FragmentKind,
}

impl Fragment {
    /// Whether `block_number` falls within `[start_block, end_block]`.
    pub fn in_range(&self, block_number: u64) -> bool {
        block_number >= self.start_block && self.end_block.map(|end| block_number <= end).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_set_any_matches_everything() {
        let m: MatchSet<4> = MatchSet::Any;
        assert!(m.matches(&[0, 0, 0, 0]));
        assert!(m.matches(&[1, 2, 3, 4]));
    }

    #[test]
    fn match_set_many_is_a_set_membership_test() {
        let mut set = HashSet::new();
        set.insert([1u8, 2, 3, 4]);
        set.insert([5u8, 6, 7, 8]);
        let m = MatchSet::Many(set);
        assert!(m.matches(&[1, 2, 3, 4]));
        assert!(!m.matches(&[9, 9, 9, 9]));
    }
}
