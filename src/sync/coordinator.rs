//! Priority-queue merge of per-chain event streams into one global,
//! checkpoint-ordered stream, plus the safe-to-process and finality
//! frontiers the indexing cache and reorg controller read from.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::RwLock;

use crate::checkpoint::Checkpoint;
use crate::types::{ChainId, Event};

/// Per-chain frontier state: the highest checkpoint that is safe to
/// process (past `finality_lag` or explicitly finalized) and the highest
/// checkpoint considered final.
#[derive(Debug, Clone, Copy, Default)]
struct ChainFrontier {
    safe: Option<Checkpoint>,
    finality: Option<Checkpoint>,
}

/// Merges per-chain event batches (each individually ordered by
/// checkpoint) into one globally ordered stream via a
/// min-heap keyed by checkpoint, and exposes monotone safe/finality
/// frontiers across all configured chains.
#[derive(Default)]
pub struct SyncCoordinator {
    frontiers: RwLock<HashMap<ChainId, ChainFrontier>>,
}

impl SyncCoordinator {
    pub fn new(chain_ids: impl IntoIterator<Item = ChainId>) -> Self {
        let frontiers = chain_ids
            .into_iter()
            .map(|id| (id, ChainFrontier::default()))
            .collect();
        Self {
            frontiers: RwLock::new(frontiers),
        }
    }

    /// Advance `chain_id`'s safe-to-process frontier. Must be called with
    /// monotonically increasing checkpoints per chain; a regression (e.g.
    /// after a reorg) must go through [`Self::reset_chain`] instead.
    pub fn new_checkpoint(&self, chain_id: ChainId, checkpoint: Checkpoint) {
        let mut frontiers = self.frontiers.write().expect("frontier lock poisoned");
        let entry = frontiers.entry(chain_id).or_default();
        entry.safe = Some(entry.safe.map_or(checkpoint, |s| s.max(checkpoint)));
    }

    pub fn new_finality_checkpoint(&self, chain_id: ChainId, checkpoint: Checkpoint) {
        let mut frontiers = self.frontiers.write().expect("frontier lock poisoned");
        let entry = frontiers.entry(chain_id).or_default();
        entry.finality = Some(entry.finality.map_or(checkpoint, |f| f.max(checkpoint)));
    }

    /// Reset a chain's frontiers downward after a reorg: the reorg
    /// controller calls this with the ancestor checkpoint before
    /// re-processing from there.
    pub fn reset_chain(&self, chain_id: ChainId, ancestor: Checkpoint) {
        let mut frontiers = self.frontiers.write().expect("frontier lock poisoned");
        let entry = frontiers.entry(chain_id).or_default();
        entry.safe = Some(ancestor);
        if entry.finality.map(|f| f > ancestor).unwrap_or(false) {
            entry.finality = Some(ancestor);
        }
    }

    /// The minimum safe-to-process checkpoint across every configured
    /// chain: the global point before which every chain's event stream is
    /// safe to hand to the indexing cache. `None` until every chain has
    /// emitted at least one checkpoint.
    pub fn global_safe_checkpoint(&self) -> Option<Checkpoint> {
        let frontiers = self.frontiers.read().expect("frontier lock poisoned");
        if frontiers.is_empty() {
            return None;
        }
        frontiers.values().try_fold(None::<Checkpoint>, |acc, f| {
            let safe = f.safe?;
            Some(Some(acc.map_or(safe, |a| a.min(safe))))
        })?
    }

    pub fn global_finality_checkpoint(&self) -> Option<Checkpoint> {
        let frontiers = self.frontiers.read().expect("frontier lock poisoned");
        if frontiers.is_empty() {
            return None;
        }
        frontiers.values().try_fold(None::<Checkpoint>, |acc, f| {
            let finality = f.finality?;
            Some(Some(acc.map_or(finality, |a| a.min(finality))))
        })?
    }
}

/// Merge already-sorted per-chain event batches into one globally ordered
/// vector via a min-heap, rather than concatenating and re-sorting.
pub fn merge_ordered(batches: Vec<Vec<Event>>) -> Vec<Event> {
    let mut heap: BinaryHeap<Reverse<(Checkpoint, usize, usize)>> = BinaryHeap::new();
    for (batch_idx, batch) in batches.iter().enumerate() {
        if let Some(first) = batch.first() {
            heap.push(Reverse((first.checkpoint, batch_idx, 0)));
        }
    }

    let mut out = Vec::new();
    while let Some(Reverse((_, batch_idx, item_idx))) = heap.pop() {
        out.push(batches[batch_idx][item_idx].clone());
        if let Some(next) = batches[batch_idx].get(item_idx + 1) {
            heap.push(Reverse((next.checkpoint, batch_idx, item_idx + 1)));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(chain_id: u64, block: u64) -> Event {
        Event {
            checkpoint: Checkpoint::new(chain_id, block, block * 12, 0, 0, 0),
            filter_id: 0,
            source_name: "s".to_string(),
            args: None,
        }
    }

    #[test]
    fn merge_ordered_interleaves_by_checkpoint() {
        let chain_a = vec![event(1, 100), event(1, 200)];
        let chain_b = vec![event(2, 150), event(2, 250)];
        let merged = merge_ordered(vec![chain_a, chain_b]);
        let numbers: Vec<u64> = merged.iter().map(|e| e.checkpoint.block_number).collect();
        assert_eq!(numbers, vec![100, 150, 200, 250]);
    }

    #[test]
    fn global_safe_checkpoint_is_the_minimum_across_chains() {
        let coordinator = SyncCoordinator::new([1, 2]);
        coordinator.new_checkpoint(1, Checkpoint::new(1, 500, 6_000, 0, 0, 0));
        coordinator.new_checkpoint(2, Checkpoint::new(2, 100, 1_200, 0, 0, 0));

        let global = coordinator.global_safe_checkpoint().unwrap();
        assert_eq!(global.chain_id, 2);
        assert_eq!(global.block_number, 100);
    }

    #[test]
    fn global_safe_checkpoint_is_none_until_every_chain_has_reported() {
        let coordinator = SyncCoordinator::new([1, 2]);
        coordinator.new_checkpoint(1, Checkpoint::new(1, 500, 6_000, 0, 0, 0));
        assert!(coordinator.global_safe_checkpoint().is_none());
    }

    #[test]
    fn reset_chain_lowers_the_frontier_after_a_reorg() {
        let coordinator = SyncCoordinator::new([1]);
        coordinator.new_checkpoint(1, Checkpoint::new(1, 500, 6_000, 0, 0, 0));
        coordinator.reset_chain(1, Checkpoint::new(1, 400, 4_800, 0, 0, 0));

        let global = coordinator.global_safe_checkpoint().unwrap();
        assert_eq!(global.block_number, 400);
    }
}
