//! Compute abstraction layer for multidimensional array workloads.
//!
//! - [`loom`] describes N-dimensional views over buffers ([`Layout`]) and plans joint
//!   iteration over several such views ([`AccessLayout`]).
//! - [`hal`] models the hardware side: memory resources and heaps, device queues with
//!   completion events, and a [`CachingAllocator`] that pools blocks across queues.

use derive_more::Display;

pub mod hal;
pub mod loom;

pub use hal::allocator::{Buffer, CachingAllocator, CachingAllocatorBuilder};
pub use loom::{
    access::{AccessLayout, AccessLayoutBuilder, OptimizeFlags},
    layout::{Axis, Extents, Layout, LayoutError, Strides},
    slice::{Subscript, Subscripts},
};

/// Coarse classification shared by every error type of the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ErrorKind {
    /// Malformed input: mismatched lengths, invalid permutations, bad subscripts.
    InvalidArgument,
    /// An index, slice or axis outside of its valid range.
    OutOfRange,
    /// Two shapes cannot be broadcast into each other.
    Broadcast,
    /// The call is not valid in the current state of the receiver.
    InvalidOperation,
    /// A backing memory resource is exhausted.
    OutOfMemory,
}

impl ErrorKind {
    /// Returns `true` for malformed input, counting broadcast failures.
    #[inline]
    pub fn is_invalid_argument(self) -> bool {
        matches!(self, Self::InvalidArgument | Self::Broadcast)
    }
}
