//! Storage dialect layer: a `Storage` trait shared by the indexing cache,
//! reorg controller, backfiller and RPC cache, with `sqlx`-backed Postgres
//! and SQLite implementations.

pub mod postgres;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::checkpoint::Checkpoint;
use crate::errors::IndexerError;
use crate::types::ChainId;

/// One row version as persisted by the indexing cache: `effective_to` is
/// the encoded checkpoint, `Checkpoint::infinity()` when the row is still
/// current.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RowVersion {
    pub table_name: String,
    pub primary_key: String,
    pub chain_id: ChainId,
    pub value: serde_json::Value,
    pub effective_from: String,
    pub effective_to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcCacheRecord {
    pub method: String,
    pub chain_id: ChainId,
    pub block_number: Option<u64>,
    pub request_hash: String,
    pub result_json: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedInterval {
    pub source: String,
    pub chain_id: ChainId,
    pub block_start: u64,
    pub block_end: u64,
    pub end_block_timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Status {
    pub chain_id: ChainId,
    pub block_number: u64,
    pub block_timestamp: u64,
    pub ready: bool,
}

/// Everything the runtime needs from a relational backend. Implementations
/// create their own schema on connect (`CREATE TABLE IF NOT EXISTS`) so the
/// runtime never ships a separate migration step.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn find_current(&self, table: &str, primary_key: &str) -> Result<Option<RowVersion>, IndexerError>;

    /// Insert a new current row version effective from `checkpoint`.
    async fn insert_version(
        &self,
        table: &str,
        primary_key: &str,
        value: serde_json::Value,
        effective_from: &Checkpoint,
    ) -> Result<(), IndexerError>;

    /// Close out the current row version for `primary_key` as of
    /// `effective_to`, so a subsequent `insert_version` starts the next one.
    async fn close_version(&self, table: &str, primary_key: &str, effective_to: &Checkpoint) -> Result<(), IndexerError>;

    /// Delete every row version with `effective_from >= floor` and reset
    /// `effective_to` back to infinity for every row version with
    /// `effective_to >= floor`: the reorg truncation invariant.
    async fn truncate_from(&self, floor: &Checkpoint) -> Result<(), IndexerError>;

    async fn get_rpc_cache(
        &self,
        method: &str,
        chain_id: ChainId,
        block_number: Option<u64>,
        request_hash: &str,
    ) -> Result<Option<serde_json::Value>, IndexerError>;

    async fn put_rpc_cache(&self, record: &RpcCacheRecord) -> Result<(), IndexerError>;

    async fn get_cached_intervals(&self, source: &str, chain_id: ChainId) -> Result<Vec<CachedInterval>, IndexerError>;

    async fn put_cached_interval(&self, interval: &CachedInterval) -> Result<(), IndexerError>;

    async fn get_status(&self, chain_id: ChainId) -> Result<Option<Status>, IndexerError>;

    async fn set_status(&self, status: &Status) -> Result<(), IndexerError>;

    async fn get_all_statuses(&self) -> Result<Vec<Status>, IndexerError>;

    /// Read-only passthrough for ad hoc queries the typed API above does
    /// not cover. Each row is rendered as a JSON object keyed by column
    /// name; callers must not rely on a query with side effects.
    async fn sql(&self, query: &str) -> Result<Vec<serde_json::Value>, IndexerError>;
}

/// Dialect-erasing wrapper so the rest of the runtime (generic over
/// `S: Storage`) can be instantiated once regardless of which backend
/// `database.dialect` selects at startup, rather than duplicating every
/// generic call site per dialect.
#[derive(Clone)]
pub enum AnyStorage {
    Postgres(postgres::PostgresStorage),
    Sqlite(sqlite::SqliteStorage),
}

macro_rules! dispatch {
    ($self:ident, $method:ident ( $($arg:expr),* )) => {
        match $self {
            AnyStorage::Postgres(s) => s.$method($($arg),*).await,
            AnyStorage::Sqlite(s) => s.$method($($arg),*).await,
        }
    };
}

#[async_trait]
impl Storage for AnyStorage {
    async fn find_current(&self, table: &str, primary_key: &str) -> Result<Option<RowVersion>, IndexerError> {
        dispatch!(self, find_current(table, primary_key))
    }

    async fn insert_version(
        &self,
        table: &str,
        primary_key: &str,
        value: serde_json::Value,
        effective_from: &Checkpoint,
    ) -> Result<(), IndexerError> {
        dispatch!(self, insert_version(table, primary_key, value, effective_from))
    }

    async fn close_version(&self, table: &str, primary_key: &str, effective_to: &Checkpoint) -> Result<(), IndexerError> {
        dispatch!(self, close_version(table, primary_key, effective_to))
    }

    async fn truncate_from(&self, floor: &Checkpoint) -> Result<(), IndexerError> {
        dispatch!(self, truncate_from(floor))
    }

    async fn get_rpc_cache(
        &self,
        method: &str,
        chain_id: ChainId,
        block_number: Option<u64>,
        request_hash: &str,
    ) -> Result<Option<serde_json::Value>, IndexerError> {
        dispatch!(self, get_rpc_cache(method, chain_id, block_number, request_hash))
    }

    async fn put_rpc_cache(&self, record: &RpcCacheRecord) -> Result<(), IndexerError> {
        dispatch!(self, put_rpc_cache(record))
    }

    async fn get_cached_intervals(&self, source: &str, chain_id: ChainId) -> Result<Vec<CachedInterval>, IndexerError> {
        dispatch!(self, get_cached_intervals(source, chain_id))
    }

    async fn put_cached_interval(&self, interval: &CachedInterval) -> Result<(), IndexerError> {
        dispatch!(self, put_cached_interval(interval))
    }

    async fn get_status(&self, chain_id: ChainId) -> Result<Option<Status>, IndexerError> {
        dispatch!(self, get_status(chain_id))
    }

    async fn set_status(&self, status: &Status) -> Result<(), IndexerError> {
        dispatch!(self, set_status(status))
    }

    async fn get_all_statuses(&self) -> Result<Vec<Status>, IndexerError> {
        dispatch!(self, get_all_statuses())
    }

    async fn sql(&self, query: &str) -> Result<Vec<serde_json::Value>, IndexerError> {
        dispatch!(self, sql(query))
    }
}
