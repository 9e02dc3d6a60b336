//! User handler trait and the explicit context object handed to it: the
//! client, db handle, and current-event view, passed explicitly rather
//! than injected via task-local state.

use std::sync::Arc;

use async_trait::async_trait;

use crate::cache::IndexingCache;
use crate::errors::IndexerError;
use crate::rpc::{ReqwestRpcClient, RpcCache};
use crate::storage::AnyStorage;
use crate::types::Event;

/// Everything a handler needs to act on one event: the RPC cache for
/// pinned reads, and a named lookup of the indexing caches declared for
/// this deployment.
pub struct HandlerContext {
    pub rpc: Arc<RpcCache<AnyStorage, ReqwestRpcClient>>,
    pub tables: std::collections::HashMap<String, Arc<IndexingCache<AnyStorage>>>,
}

impl HandlerContext {
    pub fn table(&self, name: &str) -> Option<&Arc<IndexingCache<AnyStorage>>> {
        self.tables.get(name)
    }
}

/// One user-written handler per declared source. Runs to completion for a
/// single event before the next one is dispatched; only one handler
/// writes to the indexing cache at a time.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &HandlerContext, event: &Event) -> Result<(), IndexerError>;
}
