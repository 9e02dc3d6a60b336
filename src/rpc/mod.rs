//! RPC transport and single-flight cache.

pub mod cache;
pub mod transport;

pub use cache::RpcCache;
pub use transport::ReqwestRpcClient;

use async_trait::async_trait;

use crate::errors::IndexerError;
use crate::types::ChainId;

/// A JSON-RPC 2.0 client abstraction, implemented by [`ReqwestRpcClient`]
/// and by test doubles.
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn call(&self, chain_id: ChainId, method: &str, params: serde_json::Value) -> Result<serde_json::Value, IndexerError>;
}
