//! Slabs, size-class segments and the arena that owns them.

use std::collections::HashMap;
use std::ptr::NonNull;

use crate::{reserve_aligned, AllocError, BlockBitmap, Mapping};

// ============================================================================
// Constants
// ============================================================================

/// Size of each slab.
pub const SLAB_SIZE: usize = 64 * 1024;

/// Every slab base is a multiple of this.
pub const SLAB_ALIGNMENT: usize = SLAB_SIZE;

/// Mask for extracting the slab base from a pointer.
pub const SLAB_MASK: usize = !(SLAB_ALIGNMENT - 1);

/// Block sizes served by the arena.
/// Requests are routed to the smallest size class that fits them.
pub const SIZE_CLASSES: [usize; 8] = [16, 32, 64, 128, 256, 512, 1024, 2048];

/// Requests larger than this are rejected.
pub const MAX_SMALL_SIZE: usize = 2048;

/// Index into [`SIZE_CLASSES`] of the smallest class that fits `size`.
#[must_use]
pub const fn size_class_for(size: usize) -> Option<usize> {
    let mut i = 0;
    while i < SIZE_CLASSES.len() {
        if size <= SIZE_CLASSES[i] {
            return Some(i);
        }
        i += 1;
    }
    None
}

// ============================================================================
// Slab
// ============================================================================

/// One aligned region subdivided into equal-size blocks.
struct Slab {
    mapping: Mapping,
    block_size: usize,
    block_count: usize,
    allocated: BlockBitmap,
}

impl Slab {
    fn new(block_size: usize) -> Result<Self, AllocError> {
        let mapping = reserve_aligned(SLAB_SIZE, SLAB_ALIGNMENT)?;
        let block_count = SLAB_SIZE / block_size;
        Ok(Self {
            mapping,
            block_size,
            block_count,
            allocated: BlockBitmap::new(block_count),
        })
    }

    fn base(&self) -> usize {
        self.mapping.ptr() as usize
    }

    fn is_full(&self) -> bool {
        self.allocated.count_ones() == self.block_count
    }

    fn info(&self) -> SlabInfo {
        SlabInfo {
            base: self.base(),
            block_size: self.block_size,
            block_count: self.block_count,
            allocated: self.allocated.clone(),
        }
    }
}

// ============================================================================
// SlabInfo - read-only snapshot
// ============================================================================

/// A point-in-time copy of one slab's geometry and allocated-block bitmap.
///
/// This is what a collector sees of the allocator: it never reads or writes
/// the live bitmap directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlabInfo {
    /// Slab-aligned base address.
    pub base: usize,
    /// Size of every block in this slab.
    pub block_size: usize,
    /// Number of blocks in the slab.
    pub block_count: usize,
    /// Blocks the allocator considered handed out when the snapshot was taken.
    pub allocated: BlockBitmap,
}

impl SlabInfo {
    /// One past the last byte of the slab's block area.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.base + self.block_size * self.block_count
    }

    /// Returns `true` if `addr` lies within this slab's blocks.
    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Index of the block containing `addr`.
    #[must_use]
    pub const fn block_index(&self, addr: usize) -> Option<usize> {
        if self.contains(addr) {
            Some((addr - self.base) / self.block_size)
        } else {
            None
        }
    }

    /// Start address of block `index`.
    #[must_use]
    pub const fn block_addr(&self, index: usize) -> usize {
        self.base + index * self.block_size
    }
}

// ============================================================================
// Segment - per size class
// ============================================================================

/// The slabs serving one size class.
#[derive(Default)]
struct Segment {
    /// Indices into `SlabArena::slabs`.
    slabs: Vec<usize>,
    /// Slab currently being allocated from.
    current: Option<usize>,
}

// ============================================================================
// SlabArena
// ============================================================================

/// Segregated-size allocator built from [`SLAB_SIZE`] slabs.
///
/// Slabs are never returned to the OS before the arena is dropped, so a
/// block address stays mapped for the arena's whole lifetime.
pub struct SlabArena {
    slabs: Vec<Slab>,
    by_base: HashMap<usize, usize>,
    segments: [Segment; SIZE_CLASSES.len()],
    blocks_in_use: usize,
    bytes_in_use: usize,
}

impl SlabArena {
    /// Create an empty arena. No memory is mapped until the first allocation.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slabs: Vec::new(),
            by_base: HashMap::new(),
            segments: Default::default(),
            blocks_in_use: 0,
            bytes_in_use: 0,
        }
    }

    /// Allocate one block of the smallest size class that fits `size`.
    ///
    /// The block contents are unspecified.
    ///
    /// # Errors
    ///
    /// [`AllocError::TooLarge`] for requests above [`MAX_SMALL_SIZE`],
    /// [`AllocError::Os`] if a new slab cannot be mapped.
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let class = size_class_for(size).ok_or(AllocError::TooLarge(size))?;
        let block_size = SIZE_CLASSES[class];

        let slab_idx = match self.find_slab_with_room(class) {
            Some(idx) => idx,
            None => self.add_slab(class)?,
        };

        let slab = &mut self.slabs[slab_idx];
        let Some(block) = slab.allocated.first_clear() else {
            unreachable!("slab selected for allocation has no free block");
        };
        slab.allocated.set(block);
        self.blocks_in_use += 1;
        self.bytes_in_use += block_size;

        let addr = slab.base() + block * block_size;
        // SAFETY: `addr` is inside a live mapping and mappings are never null.
        Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) })
    }

    fn find_slab_with_room(&mut self, class: usize) -> Option<usize> {
        let segment = &mut self.segments[class];

        // 1. Fast path: the current slab
        if let Some(current) = segment.current {
            if !self.slabs[current].is_full() {
                return Some(current);
            }
        }

        // 2. Slow path: any other slab of this class with a free block
        let found = segment
            .slabs
            .iter()
            .copied()
            .find(|&idx| !self.slabs[idx].is_full());
        if found.is_some() {
            segment.current = found;
        }
        found
    }

    fn add_slab(&mut self, class: usize) -> Result<usize, AllocError> {
        let slab = Slab::new(SIZE_CLASSES[class])?;
        let idx = self.slabs.len();
        self.by_base.insert(slab.base(), idx);
        self.slabs.push(slab);

        let segment = &mut self.segments[class];
        segment.slabs.push(idx);
        segment.current = Some(idx);
        Ok(idx)
    }

    fn slab_for(&self, addr: usize) -> Option<&Slab> {
        self.by_base
            .get(&Self::slab_aligned_base(addr))
            .map(|&idx| &self.slabs[idx])
    }

    fn slab_for_mut(&mut self, addr: usize) -> Option<&mut Slab> {
        self.by_base
            .get(&Self::slab_aligned_base(addr))
            .map(|&idx| &mut self.slabs[idx])
    }

    /// Return the block containing `ptr` to the arena.
    ///
    /// Returns `false` if `ptr` is not inside any slab or its block is
    /// already free.
    pub fn free(&mut self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let Some(slab) = self.slab_for_mut(addr) else {
            return false;
        };
        let block = (addr - slab.base()) / slab.block_size;
        let block_size = slab.block_size;
        if !slab.allocated.clear(block) {
            return false;
        }
        self.blocks_in_use -= 1;
        self.bytes_in_use -= block_size;
        true
    }

    /// Release every block in `blocks` that is still allocated in the slab at
    /// `base`. Returns the number of blocks released.
    ///
    /// This is the only path by which a collector mutates allocator state.
    pub fn recycle(&mut self, base: usize, blocks: &BlockBitmap) -> usize {
        let Some(slab) = self.slab_for_mut(base) else {
            return 0;
        };
        if blocks.len() != slab.block_count {
            return 0;
        }
        let block_size = slab.block_size;
        let mut released = 0;
        for index in blocks.iter_ones() {
            if slab.allocated.clear(index) {
                released += 1;
            }
        }
        self.blocks_in_use -= released;
        self.bytes_in_use -= released * block_size;
        released
    }

    /// Returns `true` if `addr` falls inside a block currently handed out.
    #[must_use]
    pub fn is_allocated(&self, addr: usize) -> bool {
        self.slab_for(addr).is_some_and(|slab| {
            let block = (addr - slab.base()) / slab.block_size;
            block < slab.block_count && slab.allocated.get(block)
        })
    }

    /// Block size of the slab containing `addr`.
    #[must_use]
    pub fn block_size_of(&self, addr: usize) -> Option<usize> {
        self.slab_for(addr).map(|slab| slab.block_size)
    }

    /// Snapshot every slab the arena has mapped.
    #[must_use]
    pub fn active_slabs(&self) -> Vec<SlabInfo> {
        self.slabs.iter().map(Slab::info).collect()
    }

    /// Mask `addr` down to its slab base.
    #[must_use]
    pub const fn slab_aligned_base(addr: usize) -> usize {
        addr & SLAB_MASK
    }

    /// Number of slabs mapped.
    #[must_use]
    pub fn slab_count(&self) -> usize {
        self.slabs.len()
    }

    /// Number of blocks currently handed out.
    #[must_use]
    pub const fn blocks_in_use(&self) -> usize {
        self.blocks_in_use
    }

    /// Bytes currently handed out, counted in whole blocks.
    #[must_use]
    pub const fn bytes_in_use(&self) -> usize {
        self.bytes_in_use
    }

    /// Iterate over the start address of every allocated block.
    pub fn allocated_blocks(&self) -> impl Iterator<Item = usize> + '_ {
        self.slabs.iter().flat_map(|slab| {
            slab.allocated
                .iter_ones()
                .map(move |index| slab.base() + index * slab.block_size)
        })
    }
}

impl Default for SlabArena {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SlabArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlabArena")
            .field("slabs", &self.slabs.len())
            .field("blocks_in_use", &self.blocks_in_use)
            .field("bytes_in_use", &self.bytes_in_use)
            .finish_non_exhaustive()
    }
}
