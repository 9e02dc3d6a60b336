//! Historical backfiller: fetches a source's block range in adaptively
//! sized, semaphore-bounded shards, skipping ranges already covered by a
//! persisted [`CachedInterval`].

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::errors::IndexerError;
use crate::storage::{CachedInterval, Storage};
use crate::types::{BlockNumber, ChainId};

const DEFAULT_RANGE_SIZE: u64 = 2_000;
const MAX_RANGE_SIZE: u64 = 50_000;
const MIN_RANGE_SIZE: u64 = 1;
const GROWTH_FACTOR: u64 = 2;
const GROWTH_STREAK: u32 = 3;

/// Adaptive range sizer: halves on a provider error, grows geometrically
/// after a run of successes, clamped to `[MIN_RANGE_SIZE, MAX_RANGE_SIZE]`.
pub struct RangeSizer {
    current: AtomicU64,
    success_streak: AtomicU64,
}

impl RangeSizer {
    pub fn new() -> Self {
        Self {
            current: AtomicU64::new(DEFAULT_RANGE_SIZE),
            success_streak: AtomicU64::new(0),
        }
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn on_provider_error(&self) {
        self.success_streak.store(0, Ordering::Relaxed);
        let new_size = (self.current() / 2).max(MIN_RANGE_SIZE);
        self.current.store(new_size, Ordering::Relaxed);
    }

    pub fn on_success(&self) {
        let streak = self.success_streak.fetch_add(1, Ordering::Relaxed) + 1;
        if streak as u32 >= GROWTH_STREAK {
            self.success_streak.store(0, Ordering::Relaxed);
            let new_size = (self.current() * GROWTH_FACTOR).min(MAX_RANGE_SIZE);
            self.current.store(new_size, Ordering::Relaxed);
        }
    }
}

impl Default for RangeSizer {
    fn default() -> Self {
        Self::new()
    }
}

/// A fetched sub-range of blocks, ready to be merged back into order.
#[derive(Debug, Clone)]
pub struct FetchedRange {
    pub start: BlockNumber,
    pub end: BlockNumber,
}

/// Subtract already-cached intervals from `[start, end]`, returning the
/// remaining sub-ranges that still need to be fetched.
pub fn subtract_cached(start: BlockNumber, end: BlockNumber, cached: &[CachedInterval]) -> Vec<(BlockNumber, BlockNumber)> {
    let mut gaps = vec![(start, end)];
    for interval in cached {
        if interval.block_end < start || interval.block_start > end {
            continue;
        }
        let mut next_gaps = Vec::new();
        for (gap_start, gap_end) in gaps {
            if interval.block_end < gap_start || interval.block_start > gap_end {
                next_gaps.push((gap_start, gap_end));
                continue;
            }
            if interval.block_start > gap_start {
                next_gaps.push((gap_start, interval.block_start.saturating_sub(1)));
            }
            if interval.block_end < gap_end {
                next_gaps.push((interval.block_end + 1, gap_end));
            }
        }
        gaps = next_gaps;
    }
    gaps.retain(|(s, e)| s <= e);
    gaps
}

/// Split `[start, end]` into shards of at most `shard_size` blocks.
pub fn shard_range(start: BlockNumber, end: BlockNumber, shard_size: u64) -> Vec<(BlockNumber, BlockNumber)> {
    let mut shards = Vec::new();
    let mut cursor = start;
    while cursor <= end {
        let shard_end = (cursor + shard_size - 1).min(end);
        shards.push((cursor, shard_end));
        cursor = shard_end + 1;
    }
    shards
}

/// Reassemble fetched shards back into ascending block order with a
/// min-heap, since semaphore-bounded tasks may complete out of order.
pub fn reassemble(mut ranges: Vec<FetchedRange>) -> Vec<FetchedRange> {
    let mut heap: BinaryHeap<Reverse<BlockNumber>> = ranges.iter().map(|r| Reverse(r.start)).collect();
    ranges.sort_by_key(|r| r.start);
    let mut ordered = Vec::with_capacity(ranges.len());
    while let Some(Reverse(start)) = heap.pop() {
        if let Some(pos) = ranges.iter().position(|r| r.start == start) {
            ordered.push(ranges.remove(pos));
        }
    }
    ordered
}

/// Drives backfill for one source/chain pair: consults `storage` for
/// cached intervals, shards the remaining gaps, and fetches them under a
/// shared semaphore.
pub struct Backfiller<S: Storage> {
    storage: Arc<S>,
    semaphore: Arc<Semaphore>,
    sizer: RangeSizer,
}

impl<S: Storage> Backfiller<S> {
    pub fn new(storage: Arc<S>, max_concurrency: usize) -> Self {
        Self {
            storage,
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            sizer: RangeSizer::new(),
        }
    }

    /// Compute the work list for `[start, end]` after removing ranges
    /// already covered by a persisted `CachedInterval`, sharded by the
    /// sizer's current range size.
    pub async fn plan(
        &self,
        source: &str,
        chain_id: ChainId,
        start: BlockNumber,
        end: BlockNumber,
    ) -> Result<Vec<(BlockNumber, BlockNumber)>, IndexerError> {
        let cached = self.storage.get_cached_intervals(source, chain_id).await?;
        let gaps = subtract_cached(start, end, &cached);
        let shard_size = self.sizer.current();
        let shards: Vec<(BlockNumber, BlockNumber)> = gaps
            .into_iter()
            .flat_map(|(s, e)| shard_range(s, e, shard_size))
            .collect();
        debug!(source, chain_id, shard_count = shards.len(), shard_size, "planned backfill shards");
        Ok(shards)
    }

    pub fn sizer(&self) -> &RangeSizer {
        &self.sizer
    }

    /// Record a completed shard as a cached interval so a future restart
    /// skips it.
    pub async fn mark_complete(
        &self,
        source: &str,
        chain_id: ChainId,
        start: BlockNumber,
        end: BlockNumber,
        end_block_timestamp: u64,
    ) -> Result<(), IndexerError> {
        self.storage
            .put_cached_interval(&CachedInterval {
                source: source.to_string(),
                chain_id,
                block_start: start,
                block_end: end,
                end_block_timestamp,
            })
            .await
    }

    pub fn acquire_permit_count(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn on_provider_error(&self, source: &str) {
        warn!(source, "backfill provider error, halving range size");
        self.sizer.on_provider_error();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interval(start: u64, end: u64) -> CachedInterval {
        CachedInterval {
            source: "s".to_string(),
            chain_id: 1,
            block_start: start,
            block_end: end,
            end_block_timestamp: end * 12,
        }
    }

    #[test]
    fn subtract_cached_splits_around_a_middle_interval() {
        let gaps = subtract_cached(0, 100, &[interval(40, 60)]);
        assert_eq!(gaps, vec![(0, 39), (61, 100)]);
    }

    #[test]
    fn subtract_cached_handles_fully_covered_range() {
        let gaps = subtract_cached(10, 20, &[interval(0, 100)]);
        assert!(gaps.is_empty());
    }

    #[test]
    fn subtract_cached_ignores_non_overlapping_intervals() {
        let gaps = subtract_cached(50, 100, &[interval(0, 10)]);
        assert_eq!(gaps, vec![(50, 100)]);
    }

    #[test]
    fn shard_range_splits_into_fixed_size_chunks() {
        let shards = shard_range(0, 25, 10);
        assert_eq!(shards, vec![(0, 9), (10, 19), (20, 25)]);
    }

    #[test]
    fn range_sizer_halves_on_error_and_grows_after_a_streak() {
        let sizer = RangeSizer::new();
        let start = sizer.current();
        sizer.on_provider_error();
        assert_eq!(sizer.current(), start / 2);

        for _ in 0..GROWTH_STREAK {
            sizer.on_success();
        }
        assert!(sizer.current() > start / 2);
    }

    #[test]
    fn reassemble_restores_ascending_order() {
        let ranges = vec![
            FetchedRange { start: 20, end: 29 },
            FetchedRange { start: 0, end: 9 },
            FetchedRange { start: 10, end: 19 },
        ];
        let ordered = reassemble(ranges);
        assert_eq!(ordered.iter().map(|r| r.start).collect::<Vec<_>>(), vec![0, 10, 20]);
    }
}
