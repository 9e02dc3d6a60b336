//! Reorg controller.
//!
//! Implements rollback to the common ancestor once [`ChainTail::extend`]
//! reports a [`TailUpdate::Reorged`]: every row version written past the
//! ancestor is truncated, child addresses registered in the discarded
//! range are dropped, and the chain's sync frontiers are reset down to the
//! ancestor, all driven from the same ancestor block so no component can
//! observe a checkpoint another has already discarded.

use std::sync::Arc;

use tracing::warn;

use crate::chain::TailUpdate;
use crate::checkpoint::Checkpoint;
use crate::errors::IndexerError;
use crate::filter::ChildAddressRegistry;
use crate::storage::Storage;
use crate::sync::SyncCoordinator;
use crate::types::{ChainId, LightBlock};

/// Summary of a completed rollback, for logging/metrics.
#[derive(Debug, Clone)]
pub struct ReorgInfo {
    pub chain_id: ChainId,
    pub ancestor_block: u64,
    pub orphaned_blocks: usize,
}

pub struct ReorgController<S: Storage> {
    storage: Arc<S>,
}

impl<S: Storage> ReorgController<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// React to a chain tail update. A no-op for `Extended`/`Unchanged`.
    pub async fn handle(
        &self,
        chain_id: ChainId,
        update: &TailUpdate,
        coordinator: &SyncCoordinator,
        registry: &mut ChildAddressRegistry,
    ) -> Result<Option<ReorgInfo>, IndexerError> {
        let TailUpdate::Reorged { ancestor, removed } = update else {
            return Ok(None);
        };

        warn!(
            chain_id,
            ancestor = ancestor.number,
            orphaned = removed.len(),
            "reorg detected, rolling back to ancestor"
        );

        let ancestor_checkpoint = self.rollback_to(chain_id, ancestor).await?;

        registry.truncate_from(chain_id, ancestor.number + 1);
        coordinator.reset_chain(chain_id, ancestor_checkpoint);

        crate::metrics::increment_reorg_events(&chain_id.to_string());
        crate::metrics::set_reorg_depth(&chain_id.to_string(), removed.len() as i64);

        Ok(Some(ReorgInfo {
            chain_id,
            ancestor_block: ancestor.number,
            orphaned_blocks: removed.len(),
        }))
    }

    /// Delete every row version effective at or after the first block past
    /// `ancestor`, reopening any version that was closed inside the
    /// discarded range. Returns the checkpoint floor dependent components
    /// should reset their own frontiers to.
    async fn rollback_to(&self, chain_id: ChainId, ancestor: &LightBlock) -> Result<Checkpoint, IndexerError> {
        let floor = Checkpoint::floor(chain_id, ancestor.number + 1);
        self.storage.truncate_from(&floor).await?;
        Ok(Checkpoint::floor(chain_id, ancestor.number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::SqliteStorage;
    use alloy_primitives::B256;

    fn block(n: u64, hash: u8, parent: u8) -> LightBlock {
        LightBlock {
            hash: B256::repeat_byte(hash),
            parent_hash: B256::repeat_byte(parent),
            number: n,
            timestamp: n * 12,
        }
    }

    #[tokio::test]
    async fn reorg_truncates_row_versions_past_the_ancestor() {
        let storage = Arc::new(SqliteStorage::connect("sqlite::memory:").await.unwrap());
        let controller = ReorgController::new(storage.clone());
        let coordinator = SyncCoordinator::new([1]);
        let mut registry = ChildAddressRegistry::new();

        storage
            .insert_version("accounts", "0xabc", serde_json::json!({"n": 1}), &Checkpoint::new(1, 100, 1_200, 0, 0, 0))
            .await
            .unwrap();
        storage
            .insert_version("accounts", "0xabc", serde_json::json!({"n": 2}), &Checkpoint::new(1, 105, 1_260, 0, 0, 0))
            .await
            .unwrap();

        let update = TailUpdate::Reorged {
            ancestor: block(100, 1, 0),
            removed: vec![block(105, 2, 1)],
        };
        let info = controller.handle(1, &update, &coordinator, &mut registry).await.unwrap().unwrap();
        assert_eq!(info.ancestor_block, 100);
        assert_eq!(info.orphaned_blocks, 1);

        let current = storage.find_current("accounts", "0xabc").await.unwrap().unwrap();
        assert_eq!(current.value, serde_json::json!({"n": 1}));
    }

    #[tokio::test]
    async fn reorg_drops_child_addresses_registered_after_the_ancestor() {
        let storage = Arc::new(SqliteStorage::connect("sqlite::memory:").await.unwrap());
        let controller = ReorgController::new(storage);
        let coordinator = SyncCoordinator::new([1]);
        let mut registry = ChildAddressRegistry::new();

        let child = alloy_primitives::Address::repeat_byte(0x42);
        registry.register(1, child, 105);

        let update = TailUpdate::Reorged {
            ancestor: block(100, 1, 0),
            removed: vec![block(105, 2, 1)],
        };
        controller.handle(1, &update, &coordinator, &mut registry).await.unwrap();

        assert!(!registry.is_active_child(1, &child, 105));
    }

    #[tokio::test]
    async fn non_reorg_updates_are_a_no_op() {
        let storage = Arc::new(SqliteStorage::connect("sqlite::memory:").await.unwrap());
        let controller = ReorgController::new(storage);
        let coordinator = SyncCoordinator::new([1]);
        let mut registry = ChildAddressRegistry::new();

        coordinator.new_checkpoint(1, Checkpoint::new(1, 500, 6_000, 0, 0, 0));
        let info = controller.handle(1, &TailUpdate::Unchanged, &coordinator, &mut registry).await.unwrap();
        assert!(info.is_none());

        assert_eq!(coordinator.global_safe_checkpoint().unwrap().block_number, 500);
    }
}
