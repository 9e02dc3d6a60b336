//! Write-through indexing cache: every decoded event's row writes land
//! here first; entries are flushed to [`Storage`] and evicted once the
//! cache's estimated byte size crosses `cache_bytes`, per
//! `flush_ratio`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::checkpoint::Checkpoint;
use crate::errors::{ErrorContext, IndexerError, UserError};
use crate::storage::Storage;

/// Conflict-resolution strategy for `insert`/`insert_many` when a row
/// already has a current version: either raise `UniqueConstraintError`
/// (the default, `None`), skip the write, or replace the value.
pub enum OnConflict {
    DoNothing,
    DoUpdate(Value),
    DoUpdateWith(Arc<dyn Fn(&Value) -> Value + Send + Sync>),
}

/// Declared column shape for hex-normalization; stands in for the output
/// of the schema DSL compiler this runtime does not implement (non-goal).
#[derive(Debug, Clone)]
pub struct ColumnSchema {
    pub name: String,
    pub hex_byte_width: Option<usize>,
    pub not_null: bool,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    effective_from: Checkpoint,
    op_index: u64,
}

/// In-memory, write-through cache for one logical table, keyed by primary
/// key. `op_index` is a strictly increasing write counter used to decide
/// eviction order: the highest `op_index` entries are kept, mirroring an
/// LRU-by-write-order policy without a separate access-time clock.
pub struct IndexingCache<S: Storage> {
    table: String,
    schema: Vec<ColumnSchema>,
    storage: Arc<S>,
    entries: RwLock<HashMap<String, CacheEntry>>,
    next_op_index: RwLock<u64>,
    max_bytes: u64,
    flush_ratio: f64,
}

impl<S: Storage> IndexingCache<S> {
    pub fn new(table: impl Into<String>, schema: Vec<ColumnSchema>, storage: Arc<S>, max_bytes: u64, flush_ratio: f64) -> Self {
        Self {
            table: table.into(),
            schema,
            storage,
            entries: RwLock::new(HashMap::new()),
            next_op_index: RwLock::new(0),
            max_bytes,
            flush_ratio: flush_ratio.clamp(0.0, 1.0),
        }
    }

    fn normalize_hex(&self, mut value: Value) -> Value {
        if let Value::Object(ref mut map) = value {
            for column in &self.schema {
                if let Some(width) = column.hex_byte_width {
                    if let Some(Value::String(s)) = map.get(&column.name) {
                        if let Some(stripped) = s.strip_prefix("0x") {
                            let lower = stripped.to_lowercase();
                            let padded = format!("{:0>width$}", lower, width = width * 2);
                            map.insert(column.name.clone(), Value::String(format!("0x{padded}")));
                        }
                    }
                }
            }
        }
        value
    }

    fn validate(&self, value: &Value) -> Result<(), IndexerError> {
        let Value::Object(map) = value else {
            return Err(UserError::InvalidStoreMethod(ErrorContext::new("row value must be a JSON object")).into());
        };
        for column in &self.schema {
            if column.not_null {
                match map.get(&column.name) {
                    None | Some(Value::Null) => {
                        return Err(UserError::NotNullConstraint(ErrorContext::new(format!(
                            "column `{}` is NOT NULL",
                            column.name
                        )))
                        .into());
                    }
                    _ => {}
                }
            }
            if let Some(Value::Number(n)) = map.get(&column.name) {
                if n.is_i64() || n.is_u64() {
                    // JSON numbers cannot carry full u256 precision; the
                    // spec requires bigints to live in dedicated columns,
                    // never as a bare JSON number.
                    if n.as_i64().map(|v| v.unsigned_abs() > (1u64 << 53)).unwrap_or(false) {
                        return Err(UserError::BigIntSerialization(ErrorContext::new(format!(
                            "column `{}` exceeds safe JSON integer range; use a string",
                            column.name
                        )))
                        .into());
                    }
                }
            }
        }
        Ok(())
    }

    /// Insert the current row version for `primary_key`, closing out the
    /// previous version at `effective_from` if one exists. A pk that
    /// already has a current (non-null) value is a conflict: with
    /// `on_conflict = None` it raises `UserError::UniqueConstraint`; with
    /// `Some(OnConflict::DoNothing)` the write is skipped; with
    /// `Some(OnConflict::DoUpdate(_))`/`DoUpdateWith(_)` the conflicting
    /// value is replaced instead.
    pub async fn insert(
        &self,
        primary_key: &str,
        value: Value,
        effective_from: Checkpoint,
        on_conflict: Option<OnConflict>,
    ) -> Result<(), IndexerError> {
        let current = self.find(primary_key).await?;

        let value = match (current, on_conflict) {
            (None, _) => value,
            (Some(_), None) => {
                return Err(UserError::UniqueConstraint(ErrorContext::new(format!(
                    "duplicate primary key `{primary_key}` in table `{}`",
                    self.table
                )))
                .into());
            }
            (Some(_), Some(OnConflict::DoNothing)) => return Ok(()),
            (Some(_), Some(OnConflict::DoUpdate(replacement))) => replacement,
            (Some(current), Some(OnConflict::DoUpdateWith(f))) => f(&current),
        };

        self.validate(&value)?;
        let normalized = self.normalize_hex(value);

        let previous_effective_from = match self.entries.read().await.get(primary_key) {
            Some(entry) => Some(entry.effective_from),
            None => self
                .storage
                .find_current(&self.table, primary_key)
                .await?
                .and_then(|row| Checkpoint::decode(&row.effective_from)),
        };

        if previous_effective_from.is_some_and(|prev| prev != effective_from) {
            self.storage.close_version(&self.table, primary_key, &effective_from).await?;
        }

        let op_index = {
            let mut next = self.next_op_index.write().await;
            let idx = *next;
            *next += 1;
            idx
        };

        self.entries.write().await.insert(
            primary_key.to_string(),
            CacheEntry {
                value: normalized.clone(),
                effective_from,
                op_index,
            },
        );
        self.storage.insert_version(&self.table, primary_key, normalized, &effective_from).await?;

        self.maybe_flush().await;
        Ok(())
    }

    /// Insert every `(primary_key, value)` pair under the same conflict
    /// strategy, in order, stopping at the first error.
    pub async fn insert_many(
        &self,
        values: Vec<(String, Value)>,
        effective_from: Checkpoint,
        on_conflict: Option<OnConflict>,
    ) -> Result<(), IndexerError> {
        for (primary_key, value) in values {
            let strategy = match &on_conflict {
                None => None,
                Some(OnConflict::DoNothing) => Some(OnConflict::DoNothing),
                Some(OnConflict::DoUpdate(v)) => Some(OnConflict::DoUpdate(v.clone())),
                Some(OnConflict::DoUpdateWith(f)) => Some(OnConflict::DoUpdateWith(f.clone())),
            };
            self.insert(&primary_key, value, effective_from, strategy).await?;
        }
        Ok(())
    }

    /// Read-only passthrough to the backing storage, for ad hoc queries
    /// the typed cache API does not cover.
    pub async fn sql(&self, query: &str) -> Result<Vec<Value>, IndexerError> {
        self.storage.sql(query).await
    }

    pub async fn find(&self, primary_key: &str) -> Result<Option<Value>, IndexerError> {
        if let Some(entry) = self.entries.read().await.get(primary_key) {
            return Ok(Some(entry.value.clone()));
        }
        Ok(self
            .storage
            .find_current(&self.table, primary_key)
            .await?
            .map(|row| row.value))
    }

    pub async fn update(&self, primary_key: &str, value: Value, effective_from: Checkpoint) -> Result<(), IndexerError> {
        match self.find(primary_key).await? {
            Some(_) => {
                self.insert(primary_key, value.clone(), effective_from, Some(OnConflict::DoUpdate(value)))
                    .await
            }
            None => Err(UserError::RecordNotFound(ErrorContext::new(format!(
                "no current row for primary key `{primary_key}`"
            )))
            .into()),
        }
    }

    pub async fn delete(&self, primary_key: &str, effective_to: Checkpoint) -> Result<(), IndexerError> {
        self.storage.close_version(&self.table, primary_key, &effective_to).await?;
        self.entries.write().await.remove(primary_key);
        Ok(())
    }

    /// Estimated in-memory size in bytes: the serialized length of every
    /// cached value, which is cheap enough to recompute on demand at the
    /// write rates this cache sees.
    pub async fn estimated_bytes(&self) -> u64 {
        self.entries
            .read()
            .await
            .values()
            .map(|e| e.value.to_string().len() as u64)
            .sum()
    }

    async fn maybe_flush(&self) {
        let bytes = self.estimated_bytes().await;
        crate::metrics::set_cache_bytes(bytes as i64);
        if bytes <= self.max_bytes {
            return;
        }

        let mut entries = self.entries.write().await;
        let live_entries = entries.len() as f64;
        let keep_count = (live_entries * (1.0 - self.flush_ratio)).round() as usize;

        let mut by_op_index: Vec<(String, u64)> = entries.iter().map(|(k, v)| (k.clone(), v.op_index)).collect();
        by_op_index.sort_by_key(|(_, op)| *op);

        let evict_count = by_op_index.len().saturating_sub(keep_count);
        for (key, _) in by_op_index.into_iter().take(evict_count) {
            entries.remove(&key);
            crate::metrics::CACHE_ENTRIES_EVICTED.inc();
        }
        crate::metrics::CACHE_FLUSHES.inc();
        debug!(table = %self.table, evicted = evict_count, "indexing cache flushed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::SqliteStorage;

    async fn cache(max_bytes: u64, flush_ratio: f64) -> IndexingCache<SqliteStorage> {
        let storage = Arc::new(SqliteStorage::connect("sqlite::memory:").await.unwrap());
        IndexingCache::new(
            "accounts",
            vec![ColumnSchema { name: "address".to_string(), hex_byte_width: Some(20), not_null: true }],
            storage,
            max_bytes,
            flush_ratio,
        )
    }

    #[tokio::test]
    async fn hex_columns_are_lowercased_and_padded() {
        let c = cache(1 << 20, 0.5).await;
        c.insert(
            "0xabc",
            serde_json::json!({"address": "0xABC"}),
            Checkpoint::new(1, 1, 1, 0, 0, 0),
            None,
        )
        .await
        .unwrap();

        let row = c.find("0xabc").await.unwrap().unwrap();
        assert_eq!(row["address"], serde_json::json!(format!("0x{}", "0".repeat(38) + "abc")));
    }

    #[tokio::test]
    async fn not_null_violation_is_rejected() {
        let c = cache(1 << 20, 0.5).await;
        let err = c
            .insert("0xabc", serde_json::json!({}), Checkpoint::new(1, 1, 1, 0, 0, 0), None)
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::User(UserError::NotNullConstraint(_))));
    }

    #[tokio::test]
    async fn duplicate_pk_without_on_conflict_is_a_unique_constraint_error() {
        let c = cache(1 << 20, 0.5).await;
        c.insert(
            "0xabc",
            serde_json::json!({"address": "0xabc"}),
            Checkpoint::new(1, 1, 1, 0, 0, 0),
            None,
        )
        .await
        .unwrap();

        let err = c
            .insert(
                "0xabc",
                serde_json::json!({"address": "0xabc"}),
                Checkpoint::new(1, 2, 2, 0, 0, 0),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::User(UserError::UniqueConstraint(_))));
    }

    #[tokio::test]
    async fn on_conflict_do_nothing_keeps_the_existing_value() {
        let c = cache(1 << 20, 0.5).await;
        c.insert(
            "0xabc",
            serde_json::json!({"address": "0xabc"}),
            Checkpoint::new(1, 1, 1, 0, 0, 0),
            None,
        )
        .await
        .unwrap();

        c.insert(
            "0xabc",
            serde_json::json!({"address": "0xdef"}),
            Checkpoint::new(1, 2, 2, 0, 0, 0),
            Some(OnConflict::DoNothing),
        )
        .await
        .unwrap();

        let row = c.find("0xabc").await.unwrap().unwrap();
        assert_eq!(row["address"], serde_json::json!(format!("0x{}", "0".repeat(38) + "abc")));
    }

    #[tokio::test]
    async fn on_conflict_do_update_with_applies_a_function_of_the_current_value() {
        let c = cache(1 << 20, 0.5).await;
        c.insert(
            "0xabc",
            serde_json::json!({"address": "0xabc", "count": 1}),
            Checkpoint::new(1, 1, 1, 0, 0, 0),
            None,
        )
        .await
        .unwrap();

        let bump = |current: &Value| {
            let mut updated = current.clone();
            let count = updated["count"].as_i64().unwrap_or(0);
            updated["count"] = serde_json::json!(count + 1);
            updated
        };
        c.insert_many(
            vec![("0xabc".to_string(), serde_json::json!({}))],
            Checkpoint::new(1, 2, 2, 0, 0, 0),
            Some(OnConflict::DoUpdateWith(Arc::new(bump))),
        )
        .await
        .unwrap();

        let row = c.find("0xabc").await.unwrap().unwrap();
        assert_eq!(row["count"], serde_json::json!(2));
    }

    #[tokio::test]
    async fn sql_passthrough_reads_directly_from_storage() {
        let c = cache(1 << 20, 0.5).await;
        c.insert(
            "0xabc",
            serde_json::json!({"address": "0xabc"}),
            Checkpoint::new(1, 1, 1, 0, 0, 0),
            None,
        )
        .await
        .unwrap();

        let rows = c.sql("SELECT primary_key FROM row_versions WHERE table_name = 'accounts'").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["primary_key"], serde_json::json!("0xabc"));
    }

    #[tokio::test]
    async fn flush_ratio_zero_never_evicts() {
        let c = cache(1, 0.0).await; // 1 byte budget: every insert exceeds it
        for i in 0..20 {
            c.insert(
                &format!("0x{i:x}"),
                serde_json::json!({"address": format!("0x{:040x}", i)}),
                Checkpoint::new(1, i, i, 0, 0, 0),
                None,
            )
            .await
            .unwrap();
        }
        assert_eq!(c.entries.read().await.len(), 20);
    }

    #[tokio::test]
    async fn flush_ratio_one_evicts_everything_but_the_newest() {
        let c = cache(1, 1.0).await;
        for i in 0..5 {
            c.insert(
                &format!("0x{i:x}"),
                serde_json::json!({"address": format!("0x{:040x}", i)}),
                Checkpoint::new(1, i, i, 0, 0, 0),
                None,
            )
            .await
            .unwrap();
        }
        // each insert triggers maybe_flush since max_bytes=1; by the end
        // only the most recently inserted entry should remain in memory
        // (older rows are still safe in storage).
        assert!(c.entries.read().await.len() <= 1);
    }
}
