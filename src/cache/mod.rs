//! Indexing cache: the write-through, byte-budget-bounded cache every
//! decoded event is written to before (and in lieu of per-write) hitting
//! storage.

pub mod indexing_cache;

pub use indexing_cache::{ColumnSchema, IndexingCache};
