//! Algorithms over ordered sequences of [`Axis`] descriptors.
//!
//! Axes of extent 1 carry no information about memory locality. All ordering and merging
//! logic here skips them, and they are called *insignificant*.

use std::cmp::Ordering;

use derive_more::Display;
use itertools::Itertools;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// One dimension of a strided view.
///
/// `stride` is the signed element delta between consecutive positions along the axis.
/// A stride of 0 revisits the same element (broadcast), a negative one walks backwards.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{extent}:{stride}")]
pub struct Axis {
    pub extent: usize,
    pub stride: isize,
}

impl From<(usize, isize)> for Axis {
    #[inline]
    fn from((extent, stride): (usize, isize)) -> Self {
        Self { extent, stride }
    }
}

impl Axis {
    #[inline]
    pub const fn new(extent: usize, stride: isize) -> Self {
        Self { extent, stride }
    }

    /// Returns `true` if the axis has an extent other than 1.
    #[inline]
    pub const fn is_significant(&self) -> bool {
        self.extent != 1
    }

    /// Displacement from the first to the last element along the axis.
    /// Zero for empty axes.
    #[inline]
    pub const fn span(&self) -> isize {
        match self.extent {
            0 => 0,
            n => (n as isize - 1) * self.stride,
        }
    }
}

/// Which memory orders a sequence of axes satisfies.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutFlags {
    /// Strides of significant axes never increase.
    pub row_major: bool,
    /// Strides of significant axes never decrease.
    pub column_major: bool,
    /// No significant axis walks backwards.
    pub forwards_strided: bool,
}

/// Index of the first significant axis, if any.
#[inline]
pub fn first_significant(axes: &[Axis]) -> Option<usize> {
    axes.iter().position(Axis::is_significant)
}

/// Locality verdict for an `earlier` axis placed before a `later` one, in the order used
/// by [`sort`]: larger strides first.
///
/// `Some(Greater)` means the two must be swapped; `None` means the comparison is ambiguous.
#[inline]
fn locality(earlier: &Axis, later: &Axis) -> Option<Ordering> {
    if !earlier.is_significant() || !later.is_significant() {
        return None;
    }
    Some(later.stride.unsigned_abs().cmp(&earlier.stride.unsigned_abs()))
}

/// Insertion sort that tolerates ambiguous comparisons.
///
/// `verdict(earlier, later)` returns `Some(Greater)` if `later` must move in front of
/// `earlier`, `Some(Less)` or `Some(Equal)` if the pair is in order, and `None` if it cannot
/// tell. Ambiguous elements are skipped over rather than treated as barriers, and an element
/// never overtakes one it ties with.
pub(crate) fn insertion_sort_by<T, F>(items: &mut [T], mut verdict: F)
where
    F: FnMut(&T, &T) -> Option<Ordering>,
{
    for index in 1..items.len() {
        let mut current = index;
        for other in (0..index).rev() {
            match verdict(&items[other], &items[current]) {
                Some(Ordering::Greater) => {
                    items.swap(other, current);
                    current = other;
                }
                Some(_) => break,
                None => {}
            }
        }
    }
}

/// Returns `true` if significant axes appear in decreasing order of absolute stride.
pub fn is_sorted(axes: &[Axis]) -> bool {
    axes.iter()
        .filter(|axis| axis.is_significant())
        .tuple_windows()
        .all(|(x, y)| locality(x, y) != Some(Ordering::Greater))
}

/// Sorts axes by decreasing absolute stride, in place.
///
/// Insignificant axes keep their positions, and significant axes with equal absolute
/// strides keep their relative order.
pub fn sort(axes: &mut [Axis]) {
    insertion_sort_by(axes, locality);
}

/// Scans significant axes pairwise and reports the memory orders they satisfy.
pub fn flags(axes: &[Axis]) -> LayoutFlags {
    let significant = || axes.iter().filter(|axis| axis.is_significant());
    LayoutFlags {
        row_major: significant()
            .tuple_windows()
            .all(|(x, y)| x.stride >= y.stride),
        column_major: significant()
            .tuple_windows()
            .all(|(x, y)| x.stride <= y.stride),
        forwards_strided: significant().all(|axis| axis.stride >= 0),
    }
}

/// Coalesces a [sorted](sort) sequence in place and returns its new length.
///
/// An axis merges into its predecessor if `extent * stride` of the axis equals the stride of
/// the predecessor, and insignificant axes are dropped. The tail past the returned length is
/// left unspecified; callers truncate it. The addressed elements do not change, so there is
/// no offset to adjust.
pub fn ravel(axes: &mut [Axis]) -> usize {
    let mut len = 0;
    for index in 0..axes.len() {
        let axis = axes[index];
        if !axis.is_significant() {
            continue;
        }
        match len {
            0 => {
                axes[0] = axis;
                len = 1;
            }
            _ => {
                let last = &mut axes[len - 1];
                if axis.extent as isize * axis.stride == last.stride {
                    *last = Axis::new(last.extent * axis.extent, axis.stride);
                } else {
                    axes[len] = axis;
                    len += 1;
                }
            }
        }
    }
    len
}

/// Assigns row-major contiguous strides: the last axis gets stride 1.
/// Returns the number of elements the axes span.
pub fn contiguous_strides(axes: &mut [Axis]) -> usize {
    axes.iter_mut().rev().fold(1, |volume, axis| {
        axis.stride = volume as isize;
        volume * axis.extent
    })
}

/// Number of consecutive elements between the lowest and the highest referenced address.
/// Zero if any axis is empty.
pub fn storage_size(axes: &[Axis]) -> usize {
    if axes.iter().any(|axis| axis.extent == 0) {
        return 0;
    }
    1 + axes
        .iter()
        .map(|axis| axis.span().unsigned_abs())
        .sum::<usize>()
}

/// Displacement of the lowest referenced address relative to the first logical element.
/// Non-positive; only reversed axes contribute.
pub fn lowest_offset(axes: &[Axis]) -> isize {
    axes.iter().map(Axis::span).filter(|&span| span < 0).sum()
}

/// Displacement of the highest referenced address relative to the first logical element.
pub fn highest_offset(axes: &[Axis]) -> isize {
    axes.iter().map(Axis::span).filter(|&span| span > 0).sum()
}

/// Reverses the axis order in place.
#[inline]
pub fn transpose(axes: &mut [Axis]) {
    axes.reverse();
}

/// Returns the axes in reverse order.
#[inline]
pub fn transposed(axes: &[Axis]) -> Vec<Axis> {
    axes.iter().rev().copied().collect()
}

/// Removes axes of extent 1 in place.
#[inline]
pub fn squeeze(axes: &mut Vec<Axis>) {
    axes.retain(Axis::is_significant);
}

/// Returns the axes without those of extent 1.
#[inline]
pub fn squeezed(axes: &[Axis]) -> Vec<Axis> {
    axes.iter().filter(|axis| axis.is_significant()).copied().collect()
}

/// Broadcasts two positionally matched sequences against each other.
///
/// Where one side has extent 1 and the other does not, the extent-1 side takes the other
/// extent with stride 0. Returns `false` on the first incompatible pair; pairs visited before
/// it stay rewritten.
pub fn broadcast(x: &mut [Axis], y: &mut [Axis]) -> bool {
    debug_assert_eq!(x.len(), y.len());
    for (x, y) in x.iter_mut().zip(y.iter_mut()) {
        match (x.extent, y.extent) {
            (m, n) if m == n => {}
            (1, n) => *x = Axis::new(n, 0),
            (m, 1) => *y = Axis::new(m, 0),
            _ => return false,
        }
    }
    true
}
