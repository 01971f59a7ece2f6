//! Errors surfaced by a collection cycle.
//!
//! Every variant describes a structural problem found while walking the
//! execution state or the object graph. A cycle that hits one aborts with no
//! partial mark state retained.

use slab_alloc::AllocError;
use thiserror::Error;

use crate::exec::{FrameId, StackPtr};

/// Alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CollectError>;

/// A structural failure encountered while tracing.
#[derive(Debug, Error)]
pub enum CollectError {
    /// A frame has no function metadata attached.
    #[error("frame {frame} has no function metadata")]
    MissingFunc {
        /// The offending frame.
        frame: FrameId,
    },

    /// An object has no class descriptor, so its property slots can't be
    /// enumerated.
    #[error("object at {addr:#x} has no class descriptor")]
    MissingClass {
        /// Payload address of the object.
        addr: usize,
    },

    /// An object holds fewer property slots than its class declares.
    #[error("object at {addr:#x} declares {declared} properties but holds {present}")]
    PropertySlotsMissing {
        /// Payload address of the object.
        addr: usize,
        /// Slots declared by the class.
        declared: usize,
        /// Slots actually present.
        present: usize,
    },

    /// Following caller links revisited a frame.
    #[error("frame chain revisits frame {frame}")]
    FrameChainCycle {
        /// First frame seen twice.
        frame: FrameId,
    },

    /// A caller link or the current-frame pointer names a frame that does
    /// not exist.
    #[error("frame {frame} does not exist")]
    DanglingFrame {
        /// Missing frame.
        frame: FrameId,
    },

    /// A frame's slot range falls outside the evaluation stack.
    #[error("frame {frame} slots {base}..{top} fall outside the evaluation stack (top {stack_top})")]
    StackOutOfBounds {
        /// The offending frame.
        frame: FrameId,
        /// First local slot.
        base: StackPtr,
        /// One past the frame's last slot.
        top: StackPtr,
        /// Stack top of the innermost frame when the walk started.
        stack_top: StackPtr,
    },

    /// The allocator reported a slab alignment that is not a power of two.
    #[error("slab alignment {alignment:#x} is not a power of two")]
    InvalidSlabAlignment {
        /// Reported alignment.
        alignment: usize,
    },

    /// The allocator reported a slab whose description does not add up.
    #[error("slab at {base:#x} is inconsistent: {reason}")]
    InvalidSlab {
        /// Reported slab base.
        base: usize,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// The heap could not satisfy an allocation.
    #[error(transparent)]
    Alloc(#[from] AllocError),
}
