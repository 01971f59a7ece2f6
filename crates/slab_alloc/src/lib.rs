//! Segregated-size slab allocator.
//!
//! Memory is reserved from the OS in [`SLAB_SIZE`] regions aligned to
//! [`SLAB_ALIGNMENT`]. Each slab serves a single block size, so the owning
//! slab of any pointer is found by masking it, and its block by a division.
//! Every slab carries a [`BlockBitmap`] of the blocks currently handed out.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub mod bitmap;
pub mod slab;

pub use bitmap::BlockBitmap;
pub use os::page_size;
pub use slab::{
    size_class_for, SlabArena, SlabInfo, MAX_SMALL_SIZE, SIZE_CLASSES, SLAB_ALIGNMENT, SLAB_SIZE,
};

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is typically the system page size.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// Errors produced by the slab allocator.
#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    /// The request does not fit any size class.
    #[error("allocation of {0} bytes exceeds the largest size class")]
    TooLarge(usize),

    /// The OS refused to map a new slab.
    #[error("failed to map slab: {0}")]
    Os(#[from] io::Error),
}

/// An aligned anonymous memory region.
///
/// The region is automatically unmapped when this handle is dropped.
pub struct Mapping {
    inner: os::MappingInner,
}

impl Mapping {
    /// Returns a pointer to the start of the mapping.
    #[must_use]
    pub const fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the mapping in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping is empty, which never happens for a
    /// successfully reserved region.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping")
            .field("ptr", &self.ptr())
            .field("len", &self.len())
            .finish()
    }
}

/// Reserves `len` bytes of zeroed read/write memory aligned to `align`.
///
/// # Errors
///
/// Returns `InvalidInput` if either argument is zero, `align` is not a power
/// of two, or either is not a multiple of the page size. OS failures are
/// passed through.
pub fn reserve_aligned(len: usize, align: usize) -> io::Result<Mapping> {
    let page = page_size();
    if len == 0 || !align.is_power_of_two() || align < page || len % page != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "length and alignment must be page multiples and alignment a power of two",
        ));
    }

    // SAFETY: arguments were validated above.
    let inner = unsafe { os::MappingInner::reserve_aligned(len, align)? };
    Ok(Mapping { inner })
}
