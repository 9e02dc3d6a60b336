//! Filter evaluator: compiles user-declared [`crate::config::SourceConfig`]
//! values into indexed fragments and evaluates raw records against them in
//! O(matching fragments) per record.

mod fragment;
pub mod factory;

pub use fragment::{AddressConstraint, MatchSet, Fragment, FragmentKind};
pub use factory::ChildAddressRegistry;

use std::collections::HashMap;

use crate::types::{ChainId, RawLog, RawRecord, RawTransaction, RawTrace, RawTransfer};

/// Compiled set of fragments, indexed by the keys each kind can be looked
/// up by so evaluation never scans fragments that cannot possibly match.
#[derive(Debug, Default)]
pub struct FilterEvaluator {
    fragments: Vec<Fragment>,
    by_topic0: HashMap<(ChainId, [u8; 32]), Vec<usize>>,
    by_address: HashMap<(ChainId, [u8; 20]), Vec<usize>>,
    by_selector: HashMap<(ChainId, [u8; 4]), Vec<usize>>,
    block_fragments: HashMap<ChainId, Vec<usize>>,
}

/// A fragment id paired with the source name it was compiled from, handed
/// back to the event decoder/indexing cache so output can be attributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchedFragment {
    pub fragment_id: usize,
}

impl FilterEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_fragment(&mut self, fragment: Fragment) -> usize {
        let id = self.fragments.len();
        match &fragment.kind {
            FragmentKind::Log { topic0, address } => {
                if let Some(chain_id) = fragment.chain_id {
                    if let MatchSet::One(t) = topic0 {
                        self.by_topic0.entry((chain_id, *t)).or_default().push(id);
                    }
                    if let AddressConstraint::Fixed(MatchSet::One(a)) = address {
                        self.by_address.entry((chain_id, *a)).or_default().push(id);
                    }
                }
            }
            FragmentKind::Transaction { selector, .. } | FragmentKind::Trace { selector, .. } => {
                if let Some(chain_id) = fragment.chain_id {
                    if let MatchSet::One(s) = selector {
                        self.by_selector.entry((chain_id, *s)).or_default().push(id);
                    }
                }
            }
            FragmentKind::Block { .. } => {
                if let Some(chain_id) = fragment.chain_id {
                    self.block_fragments.entry(chain_id).or_default().push(id);
                }
            }
            FragmentKind::Transfer { .. } => {}
        }
        self.fragments.push(fragment);
        id
    }

    pub fn fragment(&self, id: usize) -> &Fragment {
        &self.fragments[id]
    }

    /// Evaluate a raw log against the compiled index, returning every
    /// fragment id that matches. `registry` resolves `AddressConstraint::Factory`
    /// fragments against addresses discovered by a parent factory source.
    pub fn matches_log(&self, log: &RawLog, registry: &ChildAddressRegistry) -> Vec<MatchedFragment> {
        let mut out = Vec::new();
        let topic0 = log.topics.first().map(|t| t.0);

        let mut candidates: Vec<usize> = Vec::new();
        if let Some(t0) = topic0 {
            if let Some(ids) = self.by_topic0.get(&(log.chain_id, t0)) {
                candidates.extend(ids);
            }
        }
        if let Some(ids) = self.by_address.get(&(log.chain_id, log.address.0 .0)) {
            candidates.extend(ids);
        }
        // Fragments with no indexable constraint (topic0 = Any, and address
        // not a single fixed value) are never inserted into a bucket above;
        // fall back to a linear scan restricted to this chain for those.
        for (id, fragment) in self.fragments.iter().enumerate() {
            if fragment.chain_id.is_some() && fragment.chain_id != Some(log.chain_id) {
                continue;
            }
            if let FragmentKind::Log { topic0: t, address: a } = &fragment.kind {
                let address_indexed = matches!(a, AddressConstraint::Fixed(MatchSet::One(_)));
                if matches!(t, MatchSet::Any) && !address_indexed {
                    candidates.push(id);
                }
            }
        }

        candidates.sort_unstable();
        candidates.dedup();

        for id in candidates {
            let fragment = &self.fragments[id];
            if fragment_matches_log(fragment, log, registry) {
                out.push(MatchedFragment { fragment_id: id });
            }
        }
        out
    }

    pub fn matches_transaction(&self, tx: &RawTransaction) -> Vec<MatchedFragment> {
        let mut out = Vec::new();
        for (id, fragment) in self.fragments.iter().enumerate() {
            if fragment.chain_id.is_some() && fragment.chain_id != Some(tx.chain_id) {
                continue;
            }
            if !fragment.in_range(tx.block_number) {
                continue;
            }
            if let FragmentKind::Transaction { from, to, selector } = &fragment.kind {
                let selector_bytes: Option<[u8; 4]> = tx
                    .input
                    .get(0..4)
                    .and_then(|s| s.try_into().ok());
                if from.matches(&tx.from.0 .0)
                    && tx.to.map(|t| to.matches(&t.0 .0)).unwrap_or(matches!(to, MatchSet::Any))
                    && selector_bytes
                        .map(|s| selector.matches(&s))
                        .unwrap_or(matches!(selector, MatchSet::Any))
                {
                    out.push(MatchedFragment { fragment_id: id });
                }
            }
        }
        out
    }

    pub fn matches_trace(&self, trace: &RawTrace) -> Vec<MatchedFragment> {
        let mut out = Vec::new();
        for (id, fragment) in self.fragments.iter().enumerate() {
            if fragment.chain_id.is_some() && fragment.chain_id != Some(trace.chain_id) {
                continue;
            }
            if !fragment.in_range(trace.block_number) {
                continue;
            }
            if let FragmentKind::Trace { to, selector, .. } = &fragment.kind {
                let selector_bytes: Option<[u8; 4]> = trace.input.get(0..4).and_then(|s| s.try_into().ok());
                if trace.to.map(|t| to.matches(&t.0 .0)).unwrap_or(matches!(to, MatchSet::Any))
                    && selector_bytes
                        .map(|s| selector.matches(&s))
                        .unwrap_or(matches!(selector, MatchSet::Any))
                {
                    out.push(MatchedFragment { fragment_id: id });
                }
            }
        }
        out
    }

    /// Matches a native value transfer against every `Transfer` fragment on
    /// its chain. Zero-value transfers never match: `TransferFilter` exists
    /// to track value movement, not every call with an empty `value` field.
    pub fn matches_transfer(&self, transfer: &RawTransfer) -> Vec<MatchedFragment> {
        let mut out = Vec::new();
        if transfer.value.is_zero() {
            return out;
        }
        for (id, fragment) in self.fragments.iter().enumerate() {
            if fragment.chain_id.is_some() && fragment.chain_id != Some(transfer.chain_id) {
                continue;
            }
            if !fragment.in_range(transfer.block_number) {
                continue;
            }
            if let FragmentKind::Transfer { from, to } = &fragment.kind {
                if from.matches(&transfer.from.0 .0) && to.matches(&transfer.to.0 .0) {
                    out.push(MatchedFragment { fragment_id: id });
                }
            }
        }
        out
    }

    /// Every block on a chain is a candidate for a BlockFilter; interval
    /// and offset are applied here rather than indexed.
    pub fn matches_block(&self, chain_id: ChainId, block_number: u64) -> Vec<MatchedFragment> {
        let mut out = Vec::new();
        if let Some(ids) = self.block_fragments.get(&chain_id) {
            for &id in ids {
                let fragment = &self.fragments[id];
                if let FragmentKind::Block { interval, offset } = &fragment.kind {
                    let interval = (*interval).max(1);
                    if fragment.in_range(block_number)
                        && block_number >= *offset
                        && (block_number - offset) % interval == 0
                    {
                        out.push(MatchedFragment { fragment_id: id });
                    }
                }
            }
        }
        out
    }

    pub fn evaluate(&self, record: &RawRecord, registry: &ChildAddressRegistry) -> Vec<MatchedFragment> {
        match record {
            RawRecord::Log(log) => self.matches_log(log, registry),
            RawRecord::Transaction(tx) => self.matches_transaction(tx),
            RawRecord::Trace(trace) => self.matches_trace(trace),
            RawRecord::Block(block) => self.matches_block(block.chain_id, block.number),
            RawRecord::Transfer(transfer) => self.matches_transfer(transfer),
        }
    }
}

fn fragment_matches_log(fragment: &Fragment, log: &RawLog, registry: &ChildAddressRegistry) -> bool {
    let FragmentKind::Log { topic0, address } = &fragment.kind else {
        return false;
    };
    if !fragment.in_range(log.block_number) {
        return false;
    }
    let topic0_ok = match log.topics.first() {
        Some(t) => topic0.matches(&t.0),
        None => matches!(topic0, MatchSet::Any),
    };
    let address_ok = match address {
        AddressConstraint::Fixed(set) => set.matches(&log.address.0 .0),
        AddressConstraint::Factory => registry.is_active_child(log.chain_id, &log.address, log.block_number),
    };
    topic0_ok && address_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, B256};

    fn log(chain_id: ChainId, address: Address, topic0: B256) -> RawLog {
        RawLog {
            chain_id,
            block_number: 100,
            transaction_index: 0,
            log_index: 0,
            address,
            topics: vec![topic0],
            data: vec![],
        }
    }

    #[test]
    fn matches_exact_topic0_and_address() {
        let mut eval = FilterEvaluator::new();
        let registry = ChildAddressRegistry::new();
        let addr = Address::repeat_byte(0xAA);
        let topic0 = B256::repeat_byte(0x11);
        let id = eval.add_fragment(Fragment {
            source_name: "test".to_string(),
            chain_id: Some(1),
            start_block: 0,
            end_block: None,
            kind: FragmentKind::Log {
                topic0: MatchSet::One(topic0.0),
                address: AddressConstraint::Fixed(MatchSet::One(addr.0 .0)),
            },
        });

        let matching = log(1, addr, topic0);
        assert_eq!(eval.matches_log(&matching, &registry), vec![MatchedFragment { fragment_id: id }]);

        let wrong_chain = log(2, addr, topic0);
        assert!(eval.matches_log(&wrong_chain, &registry).is_empty());

        let wrong_topic = log(1, addr, B256::repeat_byte(0x22));
        assert!(eval.matches_log(&wrong_topic, &registry).is_empty());
    }

    #[test]
    fn any_address_matches_every_address_on_chain() {
        let mut eval = FilterEvaluator::new();
        let registry = ChildAddressRegistry::new();
        let topic0 = B256::repeat_byte(0x33);
        let id = eval.add_fragment(Fragment {
            source_name: "test".to_string(),
            chain_id: Some(1),
            start_block: 0,
            end_block: None,
            kind: FragmentKind::Log {
                topic0: MatchSet::One(topic0.0),
                address: AddressConstraint::Fixed(MatchSet::Any),
            },
        });

        let a = log(1, Address::repeat_byte(0x01), topic0);
        let b = log(1, Address::repeat_byte(0x02), topic0);
        assert_eq!(eval.matches_log(&a, &registry), vec![MatchedFragment { fragment_id: id }]);
        assert_eq!(eval.matches_log(&b, &registry), vec![MatchedFragment { fragment_id: id }]);
    }

    #[test]
    fn end_block_closes_the_fragment_after_its_last_tracked_block() {
        let mut eval = FilterEvaluator::new();
        let registry = ChildAddressRegistry::new();
        let addr = Address::repeat_byte(0xBB);
        let topic0 = B256::repeat_byte(0x44);
        eval.add_fragment(Fragment {
            source_name: "test".to_string(),
            chain_id: Some(1),
            start_block: 50,
            end_block: Some(100),
            kind: FragmentKind::Log {
                topic0: MatchSet::One(topic0.0),
                address: AddressConstraint::Fixed(MatchSet::One(addr.0 .0)),
            },
        });

        let mut before = log(1, addr, topic0);
        before.block_number = 49;
        assert!(eval.matches_log(&before, &registry).is_empty());

        let mut within = log(1, addr, topic0);
        within.block_number = 100;
        assert!(!eval.matches_log(&within, &registry).is_empty());

        let mut after = log(1, addr, topic0);
        after.block_number = 101;
        assert!(eval.matches_log(&after, &registry).is_empty());
    }

    #[test]
    fn factory_address_constraint_only_matches_registered_children_from_their_first_block() {
        let mut eval = FilterEvaluator::new();
        let mut registry = ChildAddressRegistry::new();
        let child = Address::repeat_byte(0xCC);
        let topic0 = B256::repeat_byte(0x55);
        let id = eval.add_fragment(Fragment {
            source_name: "test".to_string(),
            chain_id: Some(1),
            start_block: 0,
            end_block: None,
            kind: FragmentKind::Log {
                topic0: MatchSet::One(topic0.0),
                address: AddressConstraint::Factory,
            },
        });

        let mut before_creation = log(1, child, topic0);
        before_creation.block_number = 4;
        assert!(eval.matches_log(&before_creation, &registry).is_empty());

        registry.register(1, child, 5);

        let mut before_creation_again = log(1, child, topic0);
        before_creation_again.block_number = 4;
        assert!(eval.matches_log(&before_creation_again, &registry).is_empty());

        let mut at_creation = log(1, child, topic0);
        at_creation.block_number = 5;
        assert_eq!(eval.matches_log(&at_creation, &registry), vec![MatchedFragment { fragment_id: id }]);

        let mut after_creation = log(1, child, topic0);
        after_creation.block_number = 10;
        assert_eq!(eval.matches_log(&after_creation, &registry), vec![MatchedFragment { fragment_id: id }]);
    }

    #[test]
    fn block_filter_respects_interval_and_offset() {
        let mut eval = FilterEvaluator::new();
        eval.add_fragment(Fragment {
            source_name: "test".to_string(),
            chain_id: Some(1),
            start_block: 100,
            end_block: None,
            kind: FragmentKind::Block { interval: 10, offset: 5 },
        });

        assert!(eval.matches_block(1, 99).is_empty());
        assert!(!eval.matches_block(1, 105).is_empty());
        assert!(eval.matches_block(1, 106).is_empty());
        assert!(!eval.matches_block(1, 115).is_empty());
    }

    #[test]
    fn transfer_filter_ignores_zero_value_and_respects_range() {
        use crate::types::RawTransfer;
        use alloy_primitives::U256;

        let mut eval = FilterEvaluator::new();
        let from = Address::repeat_byte(0x01);
        let to = Address::repeat_byte(0x02);
        eval.add_fragment(Fragment {
            source_name: "test".to_string(),
            chain_id: Some(1),
            start_block: 10,
            end_block: Some(20),
            kind: FragmentKind::Transfer {
                from: MatchSet::One(from.0 .0),
                to: MatchSet::One(to.0 .0),
            },
        });

        let zero = RawTransfer {
            chain_id: 1,
            block_number: 15,
            transaction_index: 0,
            from,
            to,
            value: U256::ZERO,
        };
        assert!(eval.matches_transfer(&zero).is_empty());

        let mut nonzero = zero.clone();
        nonzero.value = U256::from(1u64);
        assert!(!eval.matches_transfer(&nonzero).is_empty());

        let mut out_of_range = nonzero.clone();
        out_of_range.block_number = 25;
        assert!(eval.matches_transfer(&out_of_range).is_empty());
    }
}
