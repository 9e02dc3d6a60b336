//! Single-flight RPC cache: coalesces concurrent requests for the same
//! `(method, chain_id, block_number, params)` key into one upstream call,
//! and persists results through the [`Storage`] trait so restarts don't
//! re-fetch history.

use std::collections::HashMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::errors::IndexerError;
use crate::storage::{RpcCacheRecord, Storage};
use crate::types::ChainId;

use super::RpcClient;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    method: String,
    chain_id: ChainId,
    block_number: Option<u64>,
    request_hash: String,
}

fn hash_params(params: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(params.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

type InFlight = watch::Receiver<Option<Result<serde_json::Value, IndexerError>>>;

pub struct RpcCache<S: Storage, C: RpcClient> {
    storage: Arc<S>,
    client: Arc<C>,
    in_flight: Mutex<HashMap<CacheKey, InFlight>>,
}

impl<S: Storage, C: RpcClient> RpcCache<S, C> {
    pub fn new(storage: Arc<S>, client: Arc<C>) -> Self {
        Self {
            storage,
            client,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub async fn call(
        &self,
        chain_id: ChainId,
        method: &str,
        block_number: Option<u64>,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, IndexerError> {
        let key = CacheKey {
            method: method.to_string(),
            chain_id,
            block_number,
            request_hash: hash_params(&params),
        };

        if let Some(cached) = self
            .storage
            .get_rpc_cache(method, chain_id, block_number, &key.request_hash)
            .await?
        {
            crate::metrics::RPC_CACHE_HITS.with_label_values(&[method]).inc();
            return Ok(cached);
        }

        // Join an in-flight request for the same key if one exists.
        let mut guard = self.in_flight.lock().await;
        if let Some(receiver) = guard.get(&key).cloned() {
            drop(guard);
            return wait_for(receiver).await;
        }

        let (tx, rx) = watch::channel(None);
        guard.insert(key.clone(), rx);
        drop(guard);

        crate::metrics::RPC_CACHE_MISSES.with_label_values(&[method]).inc();
        let result = self.client.call(chain_id, method, params).await;

        if let Ok(value) = &result {
            self.storage
                .put_rpc_cache(&RpcCacheRecord {
                    method: method.to_string(),
                    chain_id,
                    block_number,
                    request_hash: key.request_hash.clone(),
                    result_json: value.clone(),
                })
                .await?;
        }

        // Always remove the in-flight slot, even on error, so a future
        // caller is never doomed to await a cancelled sender's stale `None`.
        self.in_flight.lock().await.remove(&key);
        let _ = tx.send(Some(result.clone()));

        result
    }
}

async fn wait_for(mut receiver: InFlight) -> Result<serde_json::Value, IndexerError> {
    loop {
        if let Some(result) = receiver.borrow().clone() {
            return result;
        }
        if receiver.changed().await.is_err() {
            debug!("in-flight rpc sender dropped without a result; treating as cancelled");
            return Err(crate::errors::IndexerError::from(crate::errors::InfraError::Rpc(
                crate::errors::ErrorContext::new("in-flight rpc request was cancelled"),
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::SqliteStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingClient {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl RpcClient for CountingClient {
        async fn call(&self, _chain_id: ChainId, _method: &str, _params: serde_json::Value) -> Result<serde_json::Value, IndexerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok(serde_json::json!({"ok": true}))
        }
    }

    #[tokio::test]
    async fn concurrent_misses_coalesce_into_one_upstream_call() {
        let storage = Arc::new(SqliteStorage::connect("sqlite::memory:").await.unwrap());
        let client = Arc::new(CountingClient { calls: AtomicUsize::new(0) });
        let cache = Arc::new(RpcCache::new(storage, client.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.call(1, "eth_getBlockByNumber", Some(100), serde_json::json!([100])).await
            }));
        }

        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_second_call_after_completion_hits_the_storage_cache() {
        let storage = Arc::new(SqliteStorage::connect("sqlite::memory:").await.unwrap());
        let client = Arc::new(CountingClient { calls: AtomicUsize::new(0) });
        let cache = RpcCache::new(storage, client.clone());

        cache.call(1, "eth_chainId", None, serde_json::json!([])).await.unwrap();
        cache.call(1, "eth_chainId", None, serde_json::json!([])).await.unwrap();

        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }
}
