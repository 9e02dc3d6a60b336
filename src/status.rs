//! Status / metadata store: per-chain progress and readiness, backed by
//! the same [`Storage`] trait the indexing cache and reorg controller use.

use std::sync::Arc;

use crate::checkpoint::Checkpoint;
use crate::errors::IndexerError;
use crate::storage::{Status, Storage};
use crate::types::ChainId;

/// Thin wrapper exposing the subset of [`Storage`] the HTTP `/status` and
/// `/ready` handlers need, plus the all-chains readiness rule.
pub struct StatusStore<S: Storage> {
    storage: Arc<S>,
    chain_ids: Vec<ChainId>,
}

impl<S: Storage> StatusStore<S> {
    pub fn new(storage: Arc<S>, chain_ids: Vec<ChainId>) -> Self {
        Self { storage, chain_ids }
    }

    pub async fn record_progress(&self, chain_id: ChainId, checkpoint: Checkpoint, ready: bool) -> Result<(), IndexerError> {
        self.storage
            .set_status(&Status {
                chain_id,
                block_number: checkpoint.block_number,
                block_timestamp: checkpoint.block_timestamp,
                ready,
            })
            .await
    }

    pub async fn get(&self, chain_id: ChainId) -> Result<Option<Status>, IndexerError> {
        self.storage.get_status(chain_id).await
    }

    pub async fn all(&self) -> Result<Vec<Status>, IndexerError> {
        self.storage.get_all_statuses().await
    }

    /// Whether every configured chain has reported `ready = true`. A chain
    /// with no status row yet is not ready.
    pub async fn is_ready(&self) -> Result<bool, IndexerError> {
        let statuses = self.storage.get_all_statuses().await?;
        Ok(self.chain_ids.iter().all(|chain_id| {
            statuses.iter().any(|s| s.chain_id == *chain_id && s.ready)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::SqliteStorage;

    #[tokio::test]
    async fn is_ready_requires_every_configured_chain() {
        let storage = Arc::new(SqliteStorage::connect("sqlite::memory:").await.unwrap());
        let store = StatusStore::new(storage, vec![1, 2]);

        assert!(!store.is_ready().await.unwrap());

        store.record_progress(1, Checkpoint::new(1, 100, 1_200, 0, 0, 0), true).await.unwrap();
        assert!(!store.is_ready().await.unwrap());

        store.record_progress(2, Checkpoint::new(2, 50, 600, 0, 0, 0), true).await.unwrap();
        assert!(store.is_ready().await.unwrap());
    }

    #[tokio::test]
    async fn get_returns_the_latest_recorded_status() {
        let storage = Arc::new(SqliteStorage::connect("sqlite::memory:").await.unwrap());
        let store = StatusStore::new(storage, vec![1]);

        store.record_progress(1, Checkpoint::new(1, 100, 1_200, 0, 0, 0), false).await.unwrap();
        let status = store.get(1).await.unwrap().unwrap();
        assert_eq!(status.block_number, 100);
        assert!(!status.ready);
    }
}
