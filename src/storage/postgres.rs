//! Postgres `Storage` implementation, backed by a `sqlx::PgPool`.

use async_trait::async_trait;
use sqlx::{Column, PgPool, Row};
use tracing::{debug, info};

use crate::checkpoint::Checkpoint;
use crate::errors::IndexerError;
use crate::types::ChainId;

use super::{CachedInterval, RowVersion, RpcCacheRecord, Status, Storage};

#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub async fn connect(database_url: &str) -> Result<Self, IndexerError> {
        let pool = PgPool::connect(database_url).await?;
        let storage = Self { pool };
        storage.init_schema().await?;
        info!("postgres storage connected and schema initialized");
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<(), IndexerError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS row_versions (
                table_name     TEXT    NOT NULL,
                primary_key    TEXT    NOT NULL,
                chain_id       BIGINT  NOT NULL,
                value          JSONB   NOT NULL,
                effective_from TEXT    NOT NULL,
                effective_to   TEXT    NOT NULL,
                PRIMARY KEY (table_name, primary_key, effective_from)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_row_versions_current
             ON row_versions (table_name, primary_key, effective_to)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_row_versions_chain_truncate
             ON row_versions (chain_id, effective_from)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS rpc_request_results (
                method         TEXT    NOT NULL,
                chain_id       BIGINT  NOT NULL,
                block_number   BIGINT,
                request_hash   TEXT    NOT NULL,
                result_json    JSONB   NOT NULL,
                PRIMARY KEY (method, chain_id, request_hash)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cached_intervals (
                source              TEXT   NOT NULL,
                chain_id            BIGINT NOT NULL,
                block_start         BIGINT NOT NULL,
                block_end           BIGINT NOT NULL,
                end_block_timestamp BIGINT NOT NULL,
                PRIMARY KEY (source, chain_id, block_start)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS _indexer_status (
                chain_id       BIGINT  PRIMARY KEY,
                block_number   BIGINT  NOT NULL,
                block_timestamp BIGINT NOT NULL,
                ready          BOOLEAN NOT NULL DEFAULT FALSE
            )",
        )
        .execute(&self.pool)
        .await?;

        debug!("postgres schema initialized");
        Ok(())
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn find_current(&self, table: &str, primary_key: &str) -> Result<Option<RowVersion>, IndexerError> {
        let row = sqlx::query(
            "SELECT table_name, primary_key, chain_id, value, effective_from, effective_to
             FROM row_versions
             WHERE table_name = $1 AND primary_key = $2 AND effective_to = $3",
        )
        .bind(table)
        .bind(primary_key)
        .bind(Checkpoint::infinity().encode())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| RowVersion {
            table_name: r.get("table_name"),
            primary_key: r.get("primary_key"),
            chain_id: r.get::<i64, _>("chain_id") as ChainId,
            value: r.get("value"),
            effective_from: r.get("effective_from"),
            effective_to: r.get("effective_to"),
        }))
    }

    async fn insert_version(
        &self,
        table: &str,
        primary_key: &str,
        value: serde_json::Value,
        effective_from: &Checkpoint,
    ) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT INTO row_versions (table_name, primary_key, chain_id, value, effective_from, effective_to)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(table)
        .bind(primary_key)
        .bind(effective_from.chain_id as i64)
        .bind(value)
        .bind(effective_from.encode())
        .bind(Checkpoint::infinity().encode())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn close_version(&self, table: &str, primary_key: &str, effective_to: &Checkpoint) -> Result<(), IndexerError> {
        sqlx::query(
            "UPDATE row_versions SET effective_to = $1
             WHERE table_name = $2 AND primary_key = $3 AND effective_to = $4",
        )
        .bind(effective_to.encode())
        .bind(table)
        .bind(primary_key)
        .bind(Checkpoint::infinity().encode())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn truncate_from(&self, floor: &Checkpoint) -> Result<(), IndexerError> {
        let floor_encoded = floor.encode();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM row_versions WHERE chain_id = $1 AND effective_from >= $2")
            .bind(floor.chain_id as i64)
            .bind(&floor_encoded)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE row_versions SET effective_to = $1
             WHERE chain_id = $2 AND effective_to >= $3 AND effective_to <> $1",
        )
        .bind(Checkpoint::infinity().encode())
        .bind(floor.chain_id as i64)
        .bind(&floor_encoded)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_rpc_cache(
        &self,
        method: &str,
        chain_id: ChainId,
        _block_number: Option<u64>,
        request_hash: &str,
    ) -> Result<Option<serde_json::Value>, IndexerError> {
        let row = sqlx::query(
            "SELECT result_json FROM rpc_request_results
             WHERE method = $1 AND chain_id = $2 AND request_hash = $3",
        )
        .bind(method)
        .bind(chain_id as i64)
        .bind(request_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("result_json")))
    }

    async fn put_rpc_cache(&self, record: &RpcCacheRecord) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT INTO rpc_request_results (method, chain_id, block_number, request_hash, result_json)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (method, chain_id, request_hash) DO UPDATE SET result_json = EXCLUDED.result_json",
        )
        .bind(&record.method)
        .bind(record.chain_id as i64)
        .bind(record.block_number.map(|b| b as i64))
        .bind(&record.request_hash)
        .bind(&record.result_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_cached_intervals(&self, source: &str, chain_id: ChainId) -> Result<Vec<CachedInterval>, IndexerError> {
        let rows = sqlx::query(
            "SELECT source, chain_id, block_start, block_end, end_block_timestamp
             FROM cached_intervals WHERE source = $1 AND chain_id = $2
             ORDER BY block_start ASC",
        )
        .bind(source)
        .bind(chain_id as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| CachedInterval {
                source: r.get("source"),
                chain_id: r.get::<i64, _>("chain_id") as ChainId,
                block_start: r.get::<i64, _>("block_start") as u64,
                block_end: r.get::<i64, _>("block_end") as u64,
                end_block_timestamp: r.get::<i64, _>("end_block_timestamp") as u64,
            })
            .collect())
    }

    async fn put_cached_interval(&self, interval: &CachedInterval) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT INTO cached_intervals (source, chain_id, block_start, block_end, end_block_timestamp)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (source, chain_id, block_start) DO UPDATE SET
                block_end = EXCLUDED.block_end, end_block_timestamp = EXCLUDED.end_block_timestamp",
        )
        .bind(&interval.source)
        .bind(interval.chain_id as i64)
        .bind(interval.block_start as i64)
        .bind(interval.block_end as i64)
        .bind(interval.end_block_timestamp as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_status(&self, chain_id: ChainId) -> Result<Option<Status>, IndexerError> {
        let row = sqlx::query(
            "SELECT chain_id, block_number, block_timestamp, ready FROM _indexer_status WHERE chain_id = $1",
        )
        .bind(chain_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Status {
            chain_id: r.get::<i64, _>("chain_id") as ChainId,
            block_number: r.get::<i64, _>("block_number") as u64,
            block_timestamp: r.get::<i64, _>("block_timestamp") as u64,
            ready: r.get("ready"),
        }))
    }

    async fn set_status(&self, status: &Status) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT INTO _indexer_status (chain_id, block_number, block_timestamp, ready)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (chain_id) DO UPDATE SET
                block_number = EXCLUDED.block_number,
                block_timestamp = EXCLUDED.block_timestamp,
                ready = _indexer_status.ready OR EXCLUDED.ready",
        )
        .bind(status.chain_id as i64)
        .bind(status.block_number as i64)
        .bind(status.block_timestamp as i64)
        .bind(status.ready)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_all_statuses(&self) -> Result<Vec<Status>, IndexerError> {
        let rows = sqlx::query("SELECT chain_id, block_number, block_timestamp, ready FROM _indexer_status")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| Status {
                chain_id: r.get::<i64, _>("chain_id") as ChainId,
                block_number: r.get::<i64, _>("block_number") as u64,
                block_timestamp: r.get::<i64, _>("block_timestamp") as u64,
                ready: r.get("ready"),
            })
            .collect())
    }

    async fn sql(&self, query: &str) -> Result<Vec<serde_json::Value>, IndexerError> {
        let rows = sqlx::query(query).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_json).collect())
    }
}

fn row_to_json(row: &sqlx::postgres::PgRow) -> serde_json::Value {
    let mut obj = serde_json::Map::new();
    for column in row.columns() {
        let name = column.name();
        let value = row
            .try_get::<i64, _>(name)
            .map(serde_json::Value::from)
            .or_else(|_| row.try_get::<f64, _>(name).map(|v| serde_json::json!(v)))
            .or_else(|_| row.try_get::<bool, _>(name).map(serde_json::Value::from))
            .or_else(|_| row.try_get::<String, _>(name).map(serde_json::Value::from))
            .or_else(|_| row.try_get::<serde_json::Value, _>(name))
            .unwrap_or(serde_json::Value::Null);
        obj.insert(name.to_string(), value);
    }
    serde_json::Value::Object(obj)
}
