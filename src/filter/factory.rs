//! Child-address registry: tracks addresses created by a factory contract
//! (e.g. a Uniswap-style pool deployer) so filter fragments compiled from a
//! `Factory` source can grow as new children are discovered, gated by
//! `factory_address_threshold`, an explicit, runtime-owned registry
//! rather than an implicit global cache.

use std::collections::HashMap;

use crate::types::{Address, BlockNumber, ChainId};

#[derive(Debug, Default)]
pub struct ChildAddressRegistry {
    children: HashMap<(ChainId, Address), BlockNumber>,
}

impl ChildAddressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly observed child address. Idempotent: re-registering
    /// the same address keeps its original first-seen block.
    pub fn register(&mut self, chain_id: ChainId, address: Address, first_block_seen: BlockNumber) {
        self.children.entry((chain_id, address)).or_insert(first_block_seen);
    }

    /// Whether `address` is a known child and `at_block` is at or after its
    /// first-seen block, the gating condition the filter evaluator must
    /// apply so a child's own history before creation is never attributed
    /// to it.
    pub fn is_active_child(&self, chain_id: ChainId, address: &Address, at_block: BlockNumber) -> bool {
        self.children
            .get(&(chain_id, *address))
            .is_some_and(|&first_seen| at_block >= first_seen)
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Drop every child registered at or after `from_block` on `chain_id`,
    /// invoked by the reorg controller alongside row-version truncation.
    pub fn truncate_from(&mut self, chain_id: ChainId, from_block: BlockNumber) {
        self.children
            .retain(|(cid, _), first_seen| *cid != chain_id || *first_seen < from_block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Address as Addr;

    #[test]
    fn child_is_inactive_before_its_first_seen_block() {
        let mut reg = ChildAddressRegistry::new();
        let addr = Addr::repeat_byte(0x01);
        reg.register(1, addr, 1_000);

        assert!(!reg.is_active_child(1, &addr, 999));
        assert!(reg.is_active_child(1, &addr, 1_000));
        assert!(reg.is_active_child(1, &addr, 1_001));
    }

    #[test]
    fn register_is_idempotent_on_first_seen_block() {
        let mut reg = ChildAddressRegistry::new();
        let addr = Addr::repeat_byte(0x02);
        reg.register(1, addr, 500);
        reg.register(1, addr, 900);
        assert!(reg.is_active_child(1, &addr, 500));
        assert!(!reg.is_active_child(1, &addr, 400));
    }

    #[test]
    fn truncate_from_drops_children_registered_at_or_after_cutoff() {
        let mut reg = ChildAddressRegistry::new();
        let old = Addr::repeat_byte(0x03);
        let new = Addr::repeat_byte(0x04);
        reg.register(1, old, 100);
        reg.register(1, new, 200);

        reg.truncate_from(1, 200);

        assert!(reg.is_active_child(1, &old, 150));
        assert!(!reg.is_active_child(1, &new, 250));
    }
}
