//! The `loom` module describes how multidimensional arrays sit in memory and how kernels walk them.
//!
//! ## Key Components
//! 1. **Layouts**:
//!    - [`layout::Axis`] pairs an extent with a signed stride; [`layout::axis`] holds the
//!      algorithms over axis sequences (sorting by locality, raveling, broadcasting).
//!    - [`layout::Layout`] is an immutable, reference-counted strided view with an offset.
//!
//! 2. **Subscripts**:
//!    - [`slice::Subscript`] covers indices, strided ranges, ellipsis and new axes.
//!
//! 3. **Access Planning**:
//!    - [`access::AccessLayout`] joins several operand layouts over one broadcast batch shape,
//!      then reorders and coalesces the batch axes for elementwise execution.

pub mod access;
pub mod layout;
pub mod slice;
