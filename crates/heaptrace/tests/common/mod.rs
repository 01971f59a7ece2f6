//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use heaptrace::{
    BlockBitmap, CellOwner, CollectorConfig, FuncInfo, HeapRef, SlabInfo, SlabSource, StringData,
    Value, VmState,
};

/// Slab alignment used by the synthetic allocator.
pub const ALIGN: usize = 0x1_0000;

/// An allocator stand-in whose slabs are plain descriptions.
///
/// Blocks are never backed by memory. The stand-in owns no cells, so the
/// tracer treats every handle into it as a leaf.
#[derive(Debug, Default)]
pub struct SyntheticSlabs {
    slabs: Vec<SlabInfo>,
    pub recycled: Vec<(usize, usize)>,
}

impl SyntheticSlabs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a slab at `base` with `block_size` blocks, `allocated` set.
    pub fn add_slab(&mut self, base: usize, block_size: usize, allocated: impl IntoIterator<Item = usize>) {
        assert_eq!(base % ALIGN, 0);
        let block_count = ALIGN / block_size;
        let mut bits = BlockBitmap::new(block_count);
        for i in allocated {
            bits.set(i);
        }
        self.slabs.push(SlabInfo {
            base,
            block_size,
            block_count,
            allocated: bits,
        });
    }

    /// Add a slab description as-is, consistent or not.
    pub fn push_raw(&mut self, slab: SlabInfo) {
        self.slabs.push(slab);
    }

    pub fn allocated_count(&self) -> usize {
        self.slabs.iter().map(|s| s.allocated.count_ones()).sum()
    }
}

impl SlabSource for SyntheticSlabs {
    fn active_slabs(&self) -> Vec<SlabInfo> {
        self.slabs.clone()
    }

    fn slab_alignment(&self) -> usize {
        ALIGN
    }

    fn recycle(&mut self, base: usize, blocks: &BlockBitmap) -> usize {
        let Some(slab) = self.slabs.iter_mut().find(|s| s.base == base) else {
            return 0;
        };
        let released = blocks.iter_ones().filter(|&i| slab.allocated.clear(i)).count();
        self.recycled.push((base, released));
        released
    }
}

// SAFETY: no address is ever claimed.
unsafe impl CellOwner for SyntheticSlabs {
    fn owns_cell(&self, _addr: usize) -> bool {
        false
    }
}

/// A string value whose payload address is `addr`. Never dereferenced.
pub fn fake_string(addr: usize) -> Value {
    // SAFETY: the handle is only resolved through an owner, and
    // `SyntheticSlabs` owns nothing.
    Value::String(unsafe { HeapRef::<StringData>::from_addr(addr) })
}

/// Collector configuration that keeps the global stats registry untouched.
pub fn quiet() -> CollectorConfig {
    CollectorConfig::new().with_publish_stats(false)
}

/// Push a `main` frame with `locals` local slots.
pub fn main_frame(vm: &mut VmState, locals: usize) {
    vm.push_frame(Arc::new(FuncInfo::new("main", 0, locals)), &[]);
}

/// Deterministic pseudo-random numbers for graph generation.
pub struct Lcg(u64);

impl Lcg {
    pub const fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub fn next_u64(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }

    pub fn below(&mut self, n: usize) -> usize {
        (self.next_u64() % n as u64) as usize
    }
}
