//! Per-cycle mirror of the allocator's slabs.
//!
//! At the start of a cycle the directory snapshots every active slab into a
//! [`SlabTrackingRecord`], keyed by slab base. Marking sets bits in each
//! record's used-block bitmap; the allocated-block bitmap is never written.
//! The whole directory is discarded at the end of the cycle.

use std::collections::HashMap;

use slab_alloc::{BlockBitmap, SlabInfo};

use crate::error::{CollectError, Result};

/// The allocator as seen by a collector.
pub trait SlabSource {
    /// Snapshot every slab currently handed out by the allocator.
    fn active_slabs(&self) -> Vec<SlabInfo>;

    /// Alignment of every slab base. Must be a power of two.
    fn slab_alignment(&self) -> usize;

    /// Mask `addr` down to the base of the slab that would contain it.
    fn slab_aligned_base(&self, addr: usize) -> usize {
        addr & !(self.slab_alignment() - 1)
    }

    /// Release the blocks set in `blocks` of the slab at `base`, returning
    /// how many were actually released.
    fn recycle(&mut self, base: usize, blocks: &BlockBitmap) -> usize;
}

/// One slab's snapshot plus the blocks marking has reached in it.
#[derive(Debug, Clone)]
pub struct SlabTrackingRecord {
    /// Snapshot taken at cycle start.
    pub slab: SlabInfo,
    /// Blocks reached by the tracer.
    pub used_blocks: BlockBitmap,
}

impl SlabTrackingRecord {
    fn new(slab: SlabInfo) -> Self {
        let used_blocks = BlockBitmap::new(slab.block_count);
        Self { slab, used_blocks }
    }

    /// Blocks allocated at snapshot time that marking never reached.
    #[must_use]
    pub fn reclaimable(&self) -> BlockBitmap {
        self.slab.allocated.and_not(&self.used_blocks)
    }

    /// Returns `true` if the block containing `addr` is allocated but unused.
    #[must_use]
    pub fn is_reclaimable(&self, addr: usize) -> bool {
        self.slab
            .block_index(addr)
            .is_some_and(|i| self.slab.allocated.get(i) && !self.used_blocks.get(i))
    }
}

/// Result of [`SlabDirectory::mark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// First time this block was reached.
    Marked {
        /// Block size of the containing slab.
        block_size: usize,
    },
    /// The block was already marked this cycle.
    AlreadyMarked {
        /// Block size of the containing slab.
        block_size: usize,
    },
    /// The address is outside every tracked slab.
    Unmapped,
    /// The address is inside a tracked slab but its block was not allocated
    /// at snapshot time. Nothing is marked.
    Unallocated {
        /// Block size of the containing slab.
        block_size: usize,
    },
}

fn check_slab(slab: &SlabInfo, alignment: usize) -> std::result::Result<(), &'static str> {
    if slab.block_size == 0 {
        return Err("zero block size");
    }
    if slab.allocated.len() != slab.block_count {
        return Err("allocated bitmap length differs from block count");
    }
    if slab.base % alignment != 0 {
        return Err("base is not slab aligned");
    }
    let span = slab
        .block_size
        .checked_mul(slab.block_count)
        .ok_or("block area overflows")?;
    if span > alignment || slab.base.checked_add(span).is_none() {
        return Err("block area exceeds the slab");
    }
    Ok(())
}

/// Slab base to tracking record map for one cycle.
#[derive(Debug, Default)]
pub struct SlabDirectory {
    records: Vec<SlabTrackingRecord>,
    by_base: HashMap<usize, usize>,
    alignment: usize,
}

impl SlabDirectory {
    /// Empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the directory contents with a fresh snapshot of `source`.
    ///
    /// # Errors
    ///
    /// A slab description that marking could not index safely. The
    /// directory is left empty.
    pub fn snapshot<S: SlabSource + ?Sized>(&mut self, source: &S) -> Result<()> {
        self.clear();
        let alignment = source.slab_alignment();
        if !alignment.is_power_of_two() {
            return Err(CollectError::InvalidSlabAlignment { alignment });
        }
        for slab in source.active_slabs() {
            if let Err(reason) = check_slab(&slab, alignment) {
                self.clear();
                return Err(CollectError::InvalidSlab {
                    base: slab.base,
                    reason,
                });
            }
            if self.by_base.insert(slab.base, self.records.len()).is_some() {
                self.clear();
                return Err(CollectError::InvalidSlab {
                    base: slab.base,
                    reason: "reported twice",
                });
            }
            self.records.push(SlabTrackingRecord::new(slab));
        }
        self.alignment = alignment;
        Ok(())
    }

    const fn base_of(&self, addr: usize) -> usize {
        addr & !(self.alignment.wrapping_sub(1))
    }

    /// Record of the slab containing `addr`.
    #[must_use]
    pub fn lookup(&self, addr: usize) -> Option<&SlabTrackingRecord> {
        if self.alignment == 0 {
            return None;
        }
        let record = &self.records[*self.by_base.get(&self.base_of(addr))?];
        record.slab.contains(addr).then_some(record)
    }

    /// Mark the block containing `addr` as reached.
    pub fn mark(&mut self, addr: usize) -> MarkOutcome {
        if self.alignment == 0 {
            return MarkOutcome::Unmapped;
        }
        let Some(&idx) = self.by_base.get(&self.base_of(addr)) else {
            return MarkOutcome::Unmapped;
        };
        let record = &mut self.records[idx];
        let Some(block) = record.slab.block_index(addr) else {
            return MarkOutcome::Unmapped;
        };
        let block_size = record.slab.block_size;
        if !record.slab.allocated.get(block) {
            return MarkOutcome::Unallocated { block_size };
        }
        if record.used_blocks.set(block) {
            MarkOutcome::Marked { block_size }
        } else {
            MarkOutcome::AlreadyMarked { block_size }
        }
    }

    /// All records, in snapshot order.
    #[must_use]
    pub fn records(&self) -> &[SlabTrackingRecord] {
        &self.records
    }

    /// Number of tracked slabs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if no slab is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every record.
    pub fn clear(&mut self) {
        self.records.clear();
        self.by_base.clear();
        self.alignment = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALIGN: usize = 0x1_0000;

    struct FakeSlabs(Vec<SlabInfo>);

    impl SlabSource for FakeSlabs {
        fn active_slabs(&self) -> Vec<SlabInfo> {
            self.0.clone()
        }

        fn slab_alignment(&self) -> usize {
            ALIGN
        }

        fn recycle(&mut self, _base: usize, _blocks: &BlockBitmap) -> usize {
            0
        }
    }

    fn slab(base: usize, block_size: usize, allocated: &[usize]) -> SlabInfo {
        let block_count = ALIGN / block_size;
        let mut bits = BlockBitmap::new(block_count);
        for &i in allocated {
            bits.set(i);
        }
        SlabInfo {
            base,
            block_size,
            block_count,
            allocated: bits,
        }
    }

    #[test]
    fn test_mark_outcomes() {
        let source = FakeSlabs(vec![slab(0x10_0000, 1024, &[0, 1, 5])]);
        let mut dir = SlabDirectory::new();
        dir.snapshot(&source).unwrap();

        assert_eq!(dir.mark(0x10_0000), MarkOutcome::Marked { block_size: 1024 });
        assert_eq!(dir.mark(0x10_0010), MarkOutcome::AlreadyMarked { block_size: 1024 });
        assert_eq!(dir.mark(0x10_0800), MarkOutcome::Unallocated { block_size: 1024 });
        assert_eq!(dir.mark(0x20_0000), MarkOutcome::Unmapped);

        let record = dir.lookup(0x10_0000 + 5 * 1024).unwrap();
        assert!(record.is_reclaimable(0x10_0000 + 5 * 1024));
        assert!(!record.is_reclaimable(0x10_0000));
        assert_eq!(record.reclaimable().iter_ones().collect::<Vec<_>>(), vec![1, 5]);
        assert!(record.used_blocks.is_subset_of(&record.slab.allocated));
    }

    #[test]
    fn test_snapshot_replaces_and_clear_empties() {
        let mut dir = SlabDirectory::new();
        dir.snapshot(&FakeSlabs(vec![slab(0x10_0000, 16, &[0])])).unwrap();
        dir.mark(0x10_0000);
        dir.snapshot(&FakeSlabs(vec![
            slab(0x10_0000, 16, &[0]),
            slab(0x30_0000, 2048, &[]),
        ]))
        .unwrap();
        assert_eq!(dir.len(), 2);
        assert_eq!(dir.records()[0].used_blocks.count_ones(), 0);

        dir.clear();
        assert!(dir.is_empty());
        assert_eq!(dir.mark(0x10_0000), MarkOutcome::Unmapped);
        assert!(dir.lookup(0x10_0000).is_none());
    }

    #[test]
    fn test_inconsistent_slabs_rejected() {
        let mut short_bitmap = slab(0x10_0000, 1024, &[0]);
        short_bitmap.allocated = BlockBitmap::new(3);
        let zero_size = SlabInfo {
            base: 0x20_0000,
            block_size: 0,
            block_count: 4,
            allocated: BlockBitmap::new(4),
        };
        let oversized = SlabInfo {
            base: 0x30_0000,
            block_size: 1024,
            block_count: 2 * ALIGN / 1024,
            allocated: BlockBitmap::new(2 * ALIGN / 1024),
        };
        let misaligned = slab(0x10_0040, 1024, &[]);

        for bad in [short_bitmap, zero_size, oversized, misaligned] {
            let base = bad.base;
            let mut dir = SlabDirectory::new();
            let source = FakeSlabs(vec![slab(0x40_0000, 16, &[0]), bad]);
            match dir.snapshot(&source) {
                Err(CollectError::InvalidSlab { base: b, .. }) => assert_eq!(b, base),
                other => panic!("expected InvalidSlab at {base:#x}, got {other:?}"),
            }
            assert!(dir.is_empty());
            assert_eq!(dir.mark(0x40_0000), MarkOutcome::Unmapped);
        }

        let mut dir = SlabDirectory::new();
        let twice = FakeSlabs(vec![slab(0x10_0000, 16, &[]), slab(0x10_0000, 16, &[])]);
        assert!(matches!(
            dir.snapshot(&twice),
            Err(CollectError::InvalidSlab { base: 0x10_0000, reason: "reported twice" })
        ));
    }

    #[test]
    fn test_default_aligned_base() {
        let source = FakeSlabs(Vec::new());
        assert_eq!(source.slab_aligned_base(0x12_3456), 0x12_0000);
    }
}
