//! Typed heap over a [`SlabArena`].
//!
//! Every payload is written into its own block as a [`HeapCell`]. Releasing a
//! value drops the payload in place, leaves a tombstone header behind and
//! returns the block to the arena. Immortal cells live outside the arena
//! and are only freed when the heap is dropped.

use std::alloc::Layout;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

use slab_alloc::{
    AllocError, BlockBitmap, SlabArena, SlabInfo, SIZE_CLASSES, SLAB_ALIGNMENT, SLAB_SIZE,
};

use crate::gc::SlabSource;
use crate::value::{
    ArrayData, ArrayRef, CellData, CellHeader, CellOwner, Class, HeapCell, HeapRef, ObjectData,
    ObjectRef, RefData, RefRef, ResourceData, ResourceRef, StringData, StringRef, Value,
};

/// Owner of every heap cell of one request.
pub struct Heap {
    arena: SlabArena,
    immortal: HashMap<usize, Layout>,
}

impl Heap {
    /// Empty heap.
    #[must_use]
    pub fn new() -> Self {
        Self {
            arena: SlabArena::new(),
            immortal: HashMap::new(),
        }
    }

    /// Move `value` into a fresh block.
    ///
    /// # Errors
    ///
    /// Propagates allocator failures.
    pub fn alloc<T: CellData>(&mut self, value: T) -> Result<HeapRef<T>, AllocError> {
        const { assert!(std::mem::align_of::<HeapCell<T>>() <= SIZE_CLASSES[0]) };
        let ptr = self
            .arena
            .alloc(std::mem::size_of::<HeapCell<T>>())?
            .cast::<HeapCell<T>>();
        // SAFETY: the block is at least as large and as aligned as the cell,
        // and nothing else refers to it yet.
        unsafe { ptr.as_ptr().write(HeapCell::new(value)) };
        Ok(HeapRef::from_cell(ptr))
    }

    /// Allocate a string.
    ///
    /// # Errors
    ///
    /// Propagates allocator failures.
    pub fn alloc_string(&mut self, text: &str) -> Result<StringRef, AllocError> {
        self.alloc(StringData::new(text))
    }

    /// Allocate an empty array.
    ///
    /// # Errors
    ///
    /// Propagates allocator failures.
    pub fn alloc_array(&mut self) -> Result<ArrayRef, AllocError> {
        self.alloc(ArrayData::new())
    }

    /// Allocate an instance of `class`.
    ///
    /// # Errors
    ///
    /// Propagates allocator failures.
    pub fn alloc_object(&mut self, class: Arc<Class>) -> Result<ObjectRef, AllocError> {
        self.alloc(ObjectData::new(class))
    }

    /// Allocate a resource.
    ///
    /// # Errors
    ///
    /// Propagates allocator failures.
    pub fn alloc_resource(&mut self, name: &str) -> Result<ResourceRef, AllocError> {
        self.alloc(ResourceData::new(name))
    }

    /// Allocate a reference cell pointing at `target`.
    ///
    /// # Errors
    ///
    /// Propagates allocator failures.
    pub fn alloc_ref(&mut self, target: Value) -> Result<RefRef, AllocError> {
        self.alloc(RefData::new(target))
    }

    /// Place `value` in a cell outside the arena that lives as long as the
    /// heap.
    pub fn alloc_immortal<T: CellData>(&mut self, value: T) -> HeapRef<T> {
        let cell = Box::new(HeapCell::new(value));
        // SAFETY: `Box::into_raw` never returns null.
        let ptr = unsafe { NonNull::new_unchecked(Box::into_raw(cell)) };
        let handle = HeapRef::from_cell(ptr);
        self.immortal
            .insert(handle.addr(), Layout::new::<HeapCell<T>>());
        handle
    }

    /// Intern `text` as an immortal string outside every slab.
    pub fn alloc_static_string(&mut self, text: &str) -> StringRef {
        self.alloc_immortal(StringData::new(text))
    }

    fn is_cell_block(&self, addr: usize) -> bool {
        self.arena.is_allocated(addr)
            && self
                .arena
                .block_size_of(addr)
                .is_some_and(|size| addr % size == 0)
    }

    /// Returns `true` if `addr` is the start of a cell owned by this heap.
    #[must_use]
    pub fn owns(&self, addr: usize) -> bool {
        self.is_cell_block(addr) || self.immortal.contains_key(&addr)
    }

    /// Borrow the payload behind `r`.
    ///
    /// `None` if `r` does not name a live cell of this heap holding a `T`.
    #[must_use]
    pub fn get<T: CellData>(&self, r: HeapRef<T>) -> Option<&T> {
        r.resolve_in(self)
    }

    /// Borrow an array.
    #[must_use]
    pub fn array(&self, r: ArrayRef) -> Option<&ArrayData> {
        self.get(r)
    }

    /// Borrow an object.
    #[must_use]
    pub fn object(&self, r: ObjectRef) -> Option<&ObjectData> {
        self.get(r)
    }

    /// Borrow a string.
    #[must_use]
    pub fn string(&self, r: StringRef) -> Option<&StringData> {
        self.get(r)
    }

    /// Borrow a reference cell.
    #[must_use]
    pub fn ref_cell(&self, r: RefRef) -> Option<&RefData> {
        self.get(r)
    }

    /// Destroy a value's payload and return its block to the arena.
    ///
    /// Returns `false` for scalars, empty handles, immortal cells and
    /// anything this heap has not handed out.
    pub fn release(&mut self, value: Value) -> bool {
        value.heap_addr().is_some_and(|addr| self.release_addr(addr))
    }

    /// Address form of [`Heap::release`].
    pub fn release_addr(&mut self, addr: usize) -> bool {
        if !self.is_cell_block(addr) {
            return false;
        }
        // SAFETY: the block is allocated, so it was initialized by `alloc`.
        unsafe { CellHeader::destroy(addr as *mut u8) };
        self.arena.free(addr as *const u8)
    }

    /// Returns `true` if `value`'s payload is a live cell of this heap.
    #[must_use]
    pub fn is_live(&self, value: &Value) -> bool {
        value.heap_addr().is_some_and(|addr| self.owns(addr))
    }

    /// The underlying arena.
    #[must_use]
    pub const fn arena(&self) -> &SlabArena {
        &self.arena
    }

    /// Number of arena cells currently live.
    #[must_use]
    pub const fn cells_in_use(&self) -> usize {
        self.arena.blocks_in_use()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("arena", &self.arena)
            .field("immortal", &self.immortal.len())
            .finish()
    }
}

// SAFETY: `owns` accepts only allocated arena blocks and immortal cells.
// Both hold initialized cells that stay mapped until the heap drops, and
// destroying one takes `&mut self`.
unsafe impl CellOwner for Heap {
    fn owns_cell(&self, addr: usize) -> bool {
        self.owns(addr)
    }
}

impl SlabSource for Heap {
    fn active_slabs(&self) -> Vec<SlabInfo> {
        self.arena.active_slabs()
    }

    fn slab_alignment(&self) -> usize {
        SLAB_ALIGNMENT
    }

    fn recycle(&mut self, base: usize, blocks: &BlockBitmap) -> usize {
        let base = SlabArena::slab_aligned_base(base);
        let Some(block_size) = self.arena.block_size_of(base) else {
            return 0;
        };
        if blocks.len() != SLAB_SIZE / block_size {
            return 0;
        }
        for index in blocks.iter_ones() {
            let addr = base + index * block_size;
            if self.arena.is_allocated(addr) {
                // SAFETY: allocated blocks always hold an initialized cell.
                unsafe { CellHeader::destroy(addr as *mut u8) };
            }
        }
        self.arena.recycle(base, blocks)
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        for addr in self.arena.allocated_blocks() {
            // SAFETY: allocated blocks always hold an initialized cell, and
            // the arena mapping is still alive.
            unsafe { CellHeader::destroy(addr as *mut u8) };
        }
        for (&addr, &layout) in &self.immortal {
            let ptr = addr as *mut u8;
            // SAFETY: immortal cells came from `Box::new` with this layout
            // and are destroyed exactly once, here.
            unsafe {
                CellHeader::destroy(ptr);
                std::alloc::dealloc(ptr, layout);
            }
        }
    }
}
