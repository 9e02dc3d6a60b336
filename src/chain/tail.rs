//! Chain tail: a bounded deque of recent [`LightBlock`]s used to detect
//! reorgs by parent-hash walk-back without re-fetching full blocks.

use std::collections::VecDeque;

use crate::errors::{ErrorContext, FatalError, IndexerError};
use crate::types::{BlockNumber, LightBlock};

/// Outcome of extending the tail with a newly observed head block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailUpdate {
    /// The new head's parent matches the current tip: no reorg.
    Extended,
    /// The new head's parent does not match the current tip, but a common
    /// ancestor was found within the tracked window. `ancestor` is the
    /// last block still valid on both chains.
    Reorged { ancestor: LightBlock, removed: Vec<LightBlock> },
    /// The new block is already the current tip (duplicate poll); no-op.
    Unchanged,
}

/// Bounded deque of light blocks, length capped at `reorg_depth`. When the
/// cap is hit the oldest block is dropped, which is what makes a reorg
/// deeper than `reorg_depth` unrecoverable from memory alone (escalates to
/// `FatalError::DeepReorg`).
#[derive(Debug)]
pub struct ChainTail {
    chain_id: u64,
    blocks: VecDeque<LightBlock>,
    capacity: usize,
}

impl ChainTail {
    pub fn new(chain_id: u64, capacity: usize) -> Self {
        Self {
            chain_id,
            blocks: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn tip(&self) -> Option<&LightBlock> {
        self.blocks.back()
    }

    pub fn tip_number(&self) -> Option<BlockNumber> {
        self.tip().map(|b| b.number)
    }

    /// Seed the tail after a cold start (e.g. from the last persisted
    /// checkpoint's block).
    pub fn seed(&mut self, block: LightBlock) {
        self.blocks.clear();
        self.blocks.push_back(block);
    }

    /// Extend the tail with a newly observed block, detecting reorgs by
    /// walking the tracked window back to find a matching parent.
    /// `fetch_parent` resolves a remote block by hash (e.g. via
    /// `eth_getBlockByHash`) so a reorg deeper than one block can be walked
    /// back on the remote chain rather than only checked against
    /// `new_head`'s immediate parent.
    pub async fn extend<F, Fut>(&mut self, block: LightBlock, fetch_parent: F) -> Result<TailUpdate, IndexerError>
    where
        F: Fn(crate::types::B256) -> Fut,
        Fut: std::future::Future<Output = Result<Option<LightBlock>, IndexerError>>,
    {
        match self.tip() {
            None => {
                self.blocks.push_back(block);
                Ok(TailUpdate::Extended)
            }
            Some(tip) if tip.hash == block.hash => Ok(TailUpdate::Unchanged),
            Some(tip) if tip.hash == block.parent_hash => {
                self.push(block);
                Ok(TailUpdate::Extended)
            }
            Some(_) => self.handle_reorg(block, fetch_parent).await,
        }
    }

    /// Walk the remote chain back from `new_head`, one parent fetch at a
    /// time, until a hash in the tracked local window is found (the common
    /// ancestor) or the window is exhausted.
    async fn handle_reorg<F, Fut>(&mut self, new_head: LightBlock, fetch_parent: F) -> Result<TailUpdate, IndexerError>
    where
        F: Fn(crate::types::B256) -> Fut,
        Fut: std::future::Future<Output = Result<Option<LightBlock>, IndexerError>>,
    {
        let mut remote_cursor = new_head.clone();
        let mut steps = 0usize;

        let ancestor_hash = loop {
            if self.blocks.iter().any(|b| b.hash == remote_cursor.parent_hash) {
                break remote_cursor.parent_hash;
            }

            steps += 1;
            if steps > self.capacity {
                return Err(FatalError::DeepReorg(ErrorContext::new(format!(
                    "chain {} reorg deeper than tracked window ({} blocks)",
                    self.chain_id, self.capacity
                )))
                .into());
            }

            match fetch_parent(remote_cursor.parent_hash).await? {
                Some(parent) => remote_cursor = parent,
                None => {
                    return Err(FatalError::DeepReorg(ErrorContext::new(format!(
                        "chain {} reorg ancestor lookup failed at block {}",
                        self.chain_id, remote_cursor.number
                    )))
                    .into())
                }
            }
        };

        let mut removed = Vec::new();
        while let Some(back) = self.blocks.back() {
            if back.hash == ancestor_hash {
                break;
            }
            removed.push(self.blocks.pop_back().expect("back() just returned Some"));
        }
        let ancestor = self
            .blocks
            .back()
            .cloned()
            .expect("ancestor hash was found in the tracked window above");

        self.push(new_head);
        Ok(TailUpdate::Reorged { ancestor, removed })
    }

    fn push(&mut self, block: LightBlock) {
        if self.blocks.len() >= self.capacity {
            self.blocks.pop_front();
        }
        self.blocks.push_back(block);
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B256;
    use std::collections::HashMap;

    fn block(n: u64, hash: u8, parent: u8) -> LightBlock {
        LightBlock {
            hash: B256::repeat_byte(hash),
            parent_hash: B256::repeat_byte(parent),
            number: n,
            timestamp: n * 12,
        }
    }

    /// A `fetch_parent` stub that never needs to fetch anything, for tests
    /// where the ancestor is already in the local window.
    async fn no_fetch(_hash: B256) -> Result<Option<LightBlock>, IndexerError> {
        Ok(None)
    }

    #[tokio::test]
    async fn extending_with_matching_parent_is_not_a_reorg() {
        let mut tail = ChainTail::new(1, 10);
        tail.seed(block(100, 1, 0));
        let update = tail.extend(block(101, 2, 1), no_fetch).await.unwrap();
        assert_eq!(update, TailUpdate::Extended);
        assert_eq!(tail.tip_number(), Some(101));
    }

    #[tokio::test]
    async fn one_block_reorg_finds_the_ancestor() {
        let mut tail = ChainTail::new(1, 10);
        tail.seed(block(100, 1, 0));
        tail.extend(block(101, 2, 1), no_fetch).await.unwrap();

        // A competing block 101' whose parent is still block 100.
        let update = tail.extend(block(101, 3, 1), no_fetch).await.unwrap();
        match update {
            TailUpdate::Reorged { ancestor, removed } => {
                assert_eq!(ancestor.number, 100);
                assert_eq!(removed.len(), 1);
                assert_eq!(removed[0].number, 101);
            }
            other => panic!("expected Reorged, got {other:?}"),
        }
        assert_eq!(tail.tip_number(), Some(101));
    }

    #[tokio::test]
    async fn multi_block_reorg_walks_the_remote_chain_back_to_the_ancestor() {
        let mut tail = ChainTail::new(1, 10);
        tail.seed(block(100, 1, 0));
        tail.extend(block(101, 2, 1), no_fetch).await.unwrap();
        tail.extend(block(102, 3, 2), no_fetch).await.unwrap();

        // Remote chain reorged two blocks deep: 101' -> 102', with 101'
        // parented on the same block 100 we still have locally. The new
        // head 102' is only known by hash; its parent 101' must be fetched.
        let remote_101 = block(101, 20, 1);
        let remote_102 = block(102, 21, 20);

        let mut remote = HashMap::new();
        remote.insert(remote_102.parent_hash, remote_101.clone());

        let update = tail
            .extend(remote_102.clone(), |hash| {
                let remote = remote.clone();
                async move { Ok(remote.get(&hash).cloned()) }
            })
            .await
            .unwrap();

        match update {
            TailUpdate::Reorged { ancestor, removed } => {
                assert_eq!(ancestor.number, 100);
                assert_eq!(removed.len(), 2);
            }
            other => panic!("expected Reorged, got {other:?}"),
        }
        assert_eq!(tail.tip_number(), Some(102));
    }

    #[tokio::test]
    async fn reorg_deeper_than_capacity_is_fatal() {
        let mut tail = ChainTail::new(1, 2);
        tail.seed(block(100, 1, 0));
        tail.extend(block(101, 2, 1), no_fetch).await.unwrap();
        tail.extend(block(102, 3, 2), no_fetch).await.unwrap(); // evicts block 100 from the window

        // Remote ancestor chain keeps resolving but never crosses back into
        // the two-block local window, so the walk-back must give up once it
        // has taken more steps than the window holds.
        let err = tail
            .extend(block(102, 99, 77), |hash| async move {
                let byte = hash.0[0];
                Ok(Some(block(200, byte.wrapping_sub(1), byte.wrapping_sub(2))))
            })
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn reorg_ancestor_lookup_failure_is_fatal() {
        let mut tail = ChainTail::new(1, 10);
        tail.seed(block(100, 1, 0));
        tail.extend(block(101, 2, 1), no_fetch).await.unwrap();

        // new_head's parent is unknown both locally and remotely.
        let err = tail.extend(block(101, 30, 29), no_fetch).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn duplicate_poll_is_unchanged() {
        let mut tail = ChainTail::new(1, 10);
        tail.seed(block(100, 1, 0));
        let update = tail.extend(block(100, 1, 0), no_fetch).await.unwrap();
        assert_eq!(update, TailUpdate::Unchanged);
    }
}
