use std::{
    hash::{Hash, Hasher},
    sync::Arc,
};

use derive_more::{Deref, DerefMut, Display, From, Into};
use itertools::Itertools;
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::slice::{SliceRange, Subscript, Subscripts};
use crate::ErrorKind;

pub mod axis;

pub use axis::{Axis, LayoutFlags};

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("extents and strides length mismatch: {extents} extents, but {strides} strides")]
    Len { extents: usize, strides: usize },
    #[error("Two ellipsis tags are not allowed in subscripts {0}")]
    Ellipsis(Subscripts),
    #[error("subscripts {subscripts} consume more axes than layout {layout} has")]
    Exhausted {
        layout: Layout,
        subscripts: Subscripts,
    },
    #[error("index {index} is out of range for an axis of extent {extent}")]
    Index { index: isize, extent: usize },
    #[error("slice {range} is out of range for an axis of extent {extent}")]
    Slice { range: SliceRange, extent: usize },
    #[error("slice step cannot be zero")]
    Step,
    #[error("permutation of length {len} does not match layout of rank {rank}")]
    PermutationLen { len: usize, rank: usize },
    #[error("index {index} is out of range for a permutation of rank {rank}")]
    PermutationIndex { index: usize, rank: usize },
    #[error("Index {0} is missing from the permutation")]
    Missing(usize),
    #[error("Cannot swap axes on an empty layout")]
    Empty,
    #[error("axis {axis} is out of range for layout of rank {rank}")]
    Axis { axis: isize, rank: usize },
    #[error("cannot take the diagonal of axis {0} with itself")]
    Diagonal(usize),
    #[error("Can not broadcast layout with {rank} axes into a shape of {len} dimensions")]
    BroadcastRank { rank: usize, len: usize },
    #[error("Can not broadcast axis of extent {extent} into an extent of {target}")]
    BroadcastAxis { extent: usize, target: usize },
    #[error("coordinate of length {len} does not match layout of rank {rank}")]
    Coord { len: usize, rank: usize },
}

impl LayoutError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Len { .. }
            | Self::Ellipsis(_)
            | Self::Exhausted { .. }
            | Self::Step
            | Self::PermutationLen { .. }
            | Self::PermutationIndex { .. }
            | Self::Missing(_)
            | Self::Diagonal(_)
            | Self::Coord { .. } => ErrorKind::InvalidArgument,
            Self::Index { .. } | Self::Slice { .. } | Self::Empty | Self::Axis { .. } => {
                ErrorKind::OutOfRange
            }
            Self::BroadcastRank { .. } | Self::BroadcastAxis { .. } => ErrorKind::Broadcast,
        }
    }
}

#[derive(Debug, Display, Default, Clone, PartialEq, Eq, Hash, Deref, DerefMut, From, Into)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{_0:?}")]
#[deref(forward)]
#[deref_mut(forward)]
pub struct Extents(Box<[usize]>);

impl<const N: usize> From<[usize; N]> for Extents {
    #[inline]
    fn from(value: [usize; N]) -> Self {
        Self(value.into())
    }
}

impl From<Vec<usize>> for Extents {
    #[inline]
    fn from(value: Vec<usize>) -> Self {
        Self(value.into())
    }
}

impl From<&[usize]> for Extents {
    #[inline]
    fn from(value: &[usize]) -> Self {
        Self(value.into())
    }
}

impl Extents {
    /// Total number of elements. 1 for the empty sequence.
    #[inline]
    pub fn size(&self) -> usize {
        self.iter().product()
    }
}

#[derive(Debug, Display, Default, Clone, PartialEq, Eq, Hash, Deref, DerefMut, From, Into)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{_0:?}")]
#[deref(forward)]
#[deref_mut(forward)]
pub struct Strides(Box<[isize]>);

impl<const N: usize> From<[isize; N]> for Strides {
    #[inline]
    fn from(value: [isize; N]) -> Self {
        Self(value.into())
    }
}

impl From<Vec<isize>> for Strides {
    #[inline]
    fn from(value: Vec<isize>) -> Self {
        Self(value.into())
    }
}

impl From<&[isize]> for Strides {
    #[inline]
    fn from(value: &[isize]) -> Self {
        Self(value.into())
    }
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
struct Repr {
    axes: Box<[Axis]>,
    offset: isize,
}

/// An N-dimensional strided view: a sequence of [`Axis`] plus the offset of the first logical
/// element from the start of the owning buffer.
///
/// Layouts are immutable values. Clones share one reference-counted representation, and every
/// transformation returns a new layout. The default layout has rank 0 and offset 0 and does not
/// allocate; it addresses a single element.
#[derive(Debug, Default, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Layout(Option<Arc<Repr>>);

impl PartialEq for Layout {
    fn eq(&self, other: &Self) -> bool {
        self.offset() == other.offset() && self.axes() == other.axes()
    }
}

impl Eq for Layout {}

impl Hash for Layout {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.axes().hash(state);
        self.offset().hash(state);
    }
}

impl std::fmt::Display for Layout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}, {}>", self.extents(), self.strides())?;
        match self.offset() {
            0 => Ok(()),
            offset => write!(f, "+{offset}"),
        }
    }
}

impl Layout {
    fn from_parts(axes: impl Into<Box<[Axis]>>, offset: isize) -> Self {
        let axes: Box<[Axis]> = axes.into();
        match (axes.len(), offset) {
            (0, 0) => Self(None),
            _ => Self(Some(Arc::new(Repr { axes, offset }))),
        }
    }

    /// Row-major layout over `extents` with offset 0.
    pub fn contiguous(extents: &[usize]) -> Self {
        let mut axes = extents
            .iter()
            .map(|&extent| Axis::new(extent, 0))
            .collect_vec();
        axis::contiguous_strides(&mut axes);
        Self::from_parts(axes, 0)
    }

    pub fn custom(extents: &[usize], strides: &[isize], offset: isize) -> Result<Self, LayoutError> {
        if extents.len() != strides.len() {
            return Err(LayoutError::Len {
                extents: extents.len(),
                strides: strides.len(),
            });
        }
        let axes = extents
            .iter()
            .zip_eq(strides)
            .map(|(&extent, &stride)| Axis::new(extent, stride))
            .collect_vec();
        Ok(Self::from_parts(axes, offset))
    }

    /// Builds a layout from axis descriptors directly.
    #[inline]
    pub fn from_axes(axes: impl Into<Box<[Axis]>>, offset: isize) -> Self {
        Self::from_parts(axes, offset)
    }

    #[inline]
    pub fn axes(&self) -> &[Axis] {
        match &self.0 {
            Some(repr) => &repr.axes,
            None => &[],
        }
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.axes().len()
    }

    #[inline]
    pub fn extents(&self) -> Extents {
        self.axes().iter().map(|axis| axis.extent).collect_vec().into()
    }

    #[inline]
    pub fn strides(&self) -> Strides {
        self.axes().iter().map(|axis| axis.stride).collect_vec().into()
    }

    #[inline]
    pub fn offset(&self) -> isize {
        self.0.as_ref().map_or(0, |repr| repr.offset)
    }

    /// Returns the same axes at another offset. The representation is cloned only if shared.
    pub fn with_offset(self, offset: isize) -> Self {
        match self.0 {
            Some(mut repr) => {
                Arc::make_mut(&mut repr).offset = offset;
                match (repr.axes.len(), offset) {
                    (0, 0) => Self(None),
                    _ => Self(Some(repr)),
                }
            }
            None => Self::from_parts(Vec::new(), offset),
        }
    }

    /// Returns `true` if both layouts share one representation.
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (Some(x), Some(y)) => Arc::ptr_eq(x, y),
            (None, None) => true,
            _ => false,
        }
    }

    /// Product of the extents; 0 if any extent is 0, 1 for rank 0.
    #[inline]
    pub fn element_count(&self) -> usize {
        self.axes().iter().map(|axis| axis.extent).product()
    }

    /// Minimum length, in elements, of a buffer that holds every element this layout references,
    /// counting from element 0 of the buffer.
    pub fn storage_requirement(&self) -> usize {
        if self.element_count() == 0 {
            return 0;
        }
        let highest = self.offset() + axis::highest_offset(self.axes());
        (highest + 1).max(0) as usize
    }

    /// Offset of the lowest element this layout references. Below [`Layout::offset`] only when
    /// some axis walks backwards.
    #[inline]
    pub fn lowest_offset(&self) -> isize {
        self.offset() + axis::lowest_offset(self.axes())
    }

    #[inline]
    pub fn flags(&self) -> LayoutFlags {
        axis::flags(self.axes())
    }

    /// Offset of the element at `coord`.
    pub fn element_offset(&self, coord: &[usize]) -> Result<isize, LayoutError> {
        let rank = self.rank();
        if coord.len() != rank {
            let len = coord.len();
            return Err(LayoutError::Coord { len, rank });
        }
        self.axes()
            .iter()
            .zip_eq(coord)
            .try_fold(self.offset(), |offset, (axis, &index)| {
                match index < axis.extent {
                    true => Ok(offset + index as isize * axis.stride),
                    false => Err(LayoutError::Index {
                        index: index as isize,
                        extent: axis.extent,
                    }),
                }
            })
    }

    /// Applies subscripts to leading axes. Axes left over are passed through unchanged, and an
    /// [`Ellipsis`](Subscript::Ellipsis) passes through as many axes as the other subscripts
    /// leave.
    pub fn apply_subscripts(&self, subscripts: impl Into<Subscripts>) -> Result<Self, LayoutError> {
        let subscripts: Subscripts = subscripts.into();
        if subscripts.ellipsis_count() > 1 {
            return Err(LayoutError::Ellipsis(subscripts));
        }

        let rank = self.rank();
        let consumed = subscripts.consumed_count();
        let exhausted = || LayoutError::Exhausted {
            layout: self.clone(),
            subscripts: subscripts.clone(),
        };
        if consumed > rank {
            return Err(exhausted());
        }

        let mut input = self.axes().iter();
        let mut axes = Vec::with_capacity(rank + subscripts.len());
        let mut offset = self.offset();
        for &subscript in subscripts.iter() {
            match subscript {
                Subscript::Index(index) => {
                    let axis = input.next().ok_or_else(exhausted)?;
                    let extent = axis.extent;
                    let position = match index {
                        index if index < 0 => index + extent as isize,
                        index => index,
                    };
                    if !(0..extent as isize).contains(&position) {
                        return Err(LayoutError::Index { index, extent });
                    }
                    offset += position * axis.stride;
                }
                Subscript::Slice(range) => {
                    let axis = input.next().ok_or_else(exhausted)?;
                    let (start, len) = range.resolve(axis.extent)?;
                    // an empty axis addresses nothing, so its start never moves the offset
                    if len > 0 {
                        offset += start * axis.stride;
                    }
                    axes.push(Axis::new(len, axis.stride * range.step));
                }
                Subscript::Ellipsis => axes.extend(input.by_ref().take(rank - consumed)),
                Subscript::NewAxis => axes.push(Axis::new(1, 0)),
            }
        }
        axes.extend(input);

        Ok(Self::from_parts(axes, offset))
    }

    /// Reverses the order of all axes.
    #[inline]
    pub fn transpose(&self) -> Self {
        Self::from_parts(axis::transposed(self.axes()), self.offset())
    }

    /// Reorders axes so that axis `i` of the result is axis `order[i]` of `self`.
    pub fn permute(&self, order: &[usize]) -> Result<Self, LayoutError> {
        let rank = self.rank();
        if order.len() != rank {
            let len = order.len();
            return Err(LayoutError::PermutationLen { len, rank });
        }

        let mut seen = vec![false; rank];
        for &index in order {
            match seen.get_mut(index) {
                Some(seen) => *seen = true,
                None => return Err(LayoutError::PermutationIndex { index, rank }),
            }
        }
        if let Some(missing) = seen.iter().position(|&seen| !seen) {
            return Err(LayoutError::Missing(missing));
        }

        let axes = order.iter().map(|&index| self.axes()[index]).collect_vec();
        Ok(Self::from_parts(axes, self.offset()))
    }

    fn resolve_axis(&self, axis: isize) -> Result<usize, LayoutError> {
        let rank = self.rank();
        let resolved = match axis {
            axis if axis < 0 => axis + rank as isize,
            axis => axis,
        };
        match (0..rank as isize).contains(&resolved) {
            true => Ok(resolved as usize),
            false => Err(LayoutError::Axis { axis, rank }),
        }
    }

    /// Swaps two axes. Negative indices count from the last axis.
    pub fn matrix_transpose(&self, axis1: isize, axis2: isize) -> Result<Self, LayoutError> {
        if self.rank() == 0 {
            return Err(LayoutError::Empty);
        }
        let axis1 = self.resolve_axis(axis1)?;
        let axis2 = self.resolve_axis(axis2)?;

        let mut axes = self.axes().to_vec();
        axes.swap(axis1, axis2);
        Ok(Self::from_parts(axes, self.offset()))
    }

    /// Swaps the last two axes.
    #[inline]
    pub fn matrix_transpose_last(&self) -> Result<Self, LayoutError> {
        self.matrix_transpose(-1, -2)
    }

    /// Replaces two axes by their diagonal, appended as the last axis.
    ///
    /// The diagonal has the smaller of the two extents and the sum of the two strides. Other axes
    /// keep their relative order.
    pub fn matrix_diagonal(&self, axis1: isize, axis2: isize) -> Result<Self, LayoutError> {
        let axis1 = self.resolve_axis(axis1)?;
        let axis2 = self.resolve_axis(axis2)?;
        if axis1 == axis2 {
            return Err(LayoutError::Diagonal(axis1));
        }

        let (x, y) = (self.axes()[axis1], self.axes()[axis2]);
        let diagonal = Axis::new(x.extent.min(y.extent), x.stride + y.stride);
        let axes = self
            .axes()
            .iter()
            .enumerate()
            .filter(|&(index, _)| index != axis1 && index != axis2)
            .map(|(_, &axis)| axis)
            .chain(std::iter::once(diagonal))
            .collect_vec();
        Ok(Self::from_parts(axes, self.offset()))
    }

    /// Diagonal of the last two axes.
    #[inline]
    pub fn matrix_diagonal_last(&self) -> Result<Self, LayoutError> {
        self.matrix_diagonal(-1, -2)
    }

    /// Removes axes of extent 1.
    #[inline]
    pub fn squeeze(&self) -> Self {
        Self::from_parts(axis::squeezed(self.axes()), self.offset())
    }

    /// Broadcasts against `extents`, aligning trailing axes.
    ///
    /// Missing leading axes and axes of extent 1 take the target extent with stride 0.
    pub fn broadcast_to(&self, extents: &[usize]) -> Result<Self, LayoutError> {
        let rank = self.rank();
        let len = extents.len();
        if len < rank {
            return Err(LayoutError::BroadcastRank { rank, len });
        }

        let (leading, aligned) = extents.split_at(len - rank);
        let leading = leading.iter().map(|&extent| Ok(Axis::new(extent, 0)));
        let aligned = self
            .axes()
            .iter()
            .zip_eq(aligned)
            .map(|(&axis, &target)| match (axis.extent, target) {
                (extent, target) if extent == target => Ok(axis),
                (1, target) => Ok(Axis::new(target, 0)),
                (extent, target) => Err(LayoutError::BroadcastAxis { extent, target }),
            });
        let axes = leading.chain(aligned).collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_parts(axes, self.offset()))
    }

    /// Returns a coalesced layout that references the same set of elements, in memory order.
    ///
    /// Reversed axes are flipped (folding their span into the offset), axes are sorted by
    /// decreasing stride, and contiguous neighbours are merged.
    pub fn ravel(&self) -> Self {
        let mut offset = self.offset();
        let mut axes = self.axes().to_vec();
        for axis in axes.iter_mut().filter(|axis| axis.stride < 0) {
            offset += axis.span();
            axis.stride = -axis.stride;
        }
        axis::sort(&mut axes);
        let len = axis::ravel(&mut axes);
        axes.truncate(len);
        Self::from_parts(axes, offset)
    }
}
