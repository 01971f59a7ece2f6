//! Process-wide statistics merged at cycle boundaries.
//!
//! Collectors run on whatever thread owns their request. Each one builds its
//! numbers privately and merges them into a [`StatsRegistry`] once per cycle
//! under a write lock; readers take a snapshot under a read lock.

use parking_lot::{const_rwlock, RwLock};

use crate::gc::ReclaimReport;
use crate::value::DataKind;

/// Number of log2 block-size buckets.
pub const BLOCK_SIZE_BUCKETS: usize = 16;

/// Fixed-width histogram of counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Histogram<const N: usize> {
    buckets: [u64; N],
}

impl<const N: usize> Default for Histogram<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Histogram<N> {
    /// All-zero histogram.
    #[must_use]
    pub const fn new() -> Self {
        Self { buckets: [0; N] }
    }

    /// Add `n` to `bucket`. Out-of-range buckets land in the last one.
    pub fn add(&mut self, bucket: usize, n: u64) {
        let idx = bucket.min(N - 1);
        self.buckets[idx] = self.buckets[idx].saturating_add(n);
    }

    /// Value of `bucket`.
    #[must_use]
    pub fn get(&self, bucket: usize) -> u64 {
        self.buckets.get(bucket).copied().unwrap_or(0)
    }

    /// Sum of every bucket.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.buckets.iter().sum()
    }

    /// Bucket-wise sum.
    pub fn merge(&mut self, other: &Self) {
        for (a, b) in self.buckets.iter_mut().zip(other.buckets.iter()) {
            *a = a.saturating_add(*b);
        }
    }

    /// Non-empty buckets as `(index, value)`.
    pub fn iter(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.buckets
            .iter()
            .copied()
            .enumerate()
            .filter(|&(_, v)| v > 0)
    }
}

/// Point-in-time copy of a registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Successful cycles merged.
    pub cycles: u64,
    /// Reachable payloads per kind.
    pub objects_by_kind: Histogram<{ DataKind::COUNT }>,
    /// Reachable bytes per kind.
    pub bytes_by_kind: Histogram<{ DataKind::COUNT }>,
    /// Reclaimable blocks bucketed by `log2(block_size)`.
    pub reclaimable_by_block_size: Histogram<BLOCK_SIZE_BUCKETS>,
    /// Validation defects.
    pub defects: u64,
}

/// Read-mostly shared statistics.
pub struct StatsRegistry {
    inner: RwLock<StatsSnapshot>,
}

impl Default for StatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StatsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsRegistry")
            .field("inner", &*self.inner.read())
            .finish()
    }
}

impl StatsRegistry {
    /// Empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: const_rwlock(StatsSnapshot {
                cycles: 0,
                objects_by_kind: Histogram::new(),
                bytes_by_kind: Histogram::new(),
                reclaimable_by_block_size: Histogram::new(),
                defects: 0,
            }),
        }
    }

    /// Fold one finished cycle into the registry.
    pub fn merge_cycle(&self, report: &ReclaimReport) {
        let mut objects = Histogram::<{ DataKind::COUNT }>::new();
        let mut bytes = Histogram::<{ DataKind::COUNT }>::new();
        for (kind, count, b) in report.census.iter() {
            objects.add(kind.index(), count);
            bytes.add(kind.index(), b);
        }
        let mut reclaimable = Histogram::<BLOCK_SIZE_BUCKETS>::new();
        for slab in &report.slabs {
            reclaimable.add(
                slab.block_size.trailing_zeros() as usize,
                slab.reclaimable as u64,
            );
        }

        let mut inner = self.inner.write();
        inner.cycles += 1;
        inner.objects_by_kind.merge(&objects);
        inner.bytes_by_kind.merge(&bytes);
        inner.reclaimable_by_block_size.merge(&reclaimable);
        inner.defects += report.validation_defects.len() as u64;
    }

    /// Copy the current totals.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        *self.inner.read()
    }

    /// Zero every counter.
    pub fn reset(&self) {
        *self.inner.write() = StatsSnapshot::default();
    }
}

static GLOBAL_STATS: StatsRegistry = StatsRegistry::new();

/// The process-wide registry collectors publish into by default.
#[must_use]
pub fn global_stats() -> &'static StatsRegistry {
    &GLOBAL_STATS
}
