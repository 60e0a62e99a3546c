use std::sync::Arc;

use casey::snake;
use derive_more::{Deref, Display, From, Into};
use itertools::Itertools;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::layout::LayoutError;

/// A `start:stop:step` range over one axis. Missing bounds default to the whole axis in the
/// direction of `step`; negative bounds count from the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SliceRange {
    pub start: Option<isize>,
    pub stop: Option<isize>,
    pub step: isize,
}

impl Default for SliceRange {
    fn default() -> Self {
        Self::all()
    }
}

impl std::fmt::Display for SliceRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bound = |x: Option<isize>| x.map(|x| x.to_string()).unwrap_or_default();
        write!(f, "{}:{}", bound(self.start), bound(self.stop))?;
        match self.step {
            1 => Ok(()),
            step => write!(f, ":{step}"),
        }
    }
}

impl SliceRange {
    #[inline]
    pub const fn new(start: Option<isize>, stop: Option<isize>, step: isize) -> Self {
        Self { start, stop, step }
    }

    /// Every element, in order.
    #[inline]
    pub const fn all() -> Self {
        Self::new(None, None, 1)
    }

    /// Every element, last to first.
    #[inline]
    pub const fn reversed() -> Self {
        Self::new(None, None, -1)
    }

    /// Elements at odd positions.
    #[inline]
    pub const fn odd() -> Self {
        Self::new(Some(1), None, 2)
    }

    /// Elements at even positions.
    #[inline]
    pub const fn even() -> Self {
        Self::new(Some(0), None, 2)
    }

    /// Resolves the range against an axis of `extent` elements.
    /// Returns the first selected position and the number of selected elements.
    pub fn resolve(&self, extent: usize) -> Result<(isize, usize), LayoutError> {
        let n = extent as isize;
        let wrap = |x: isize| if x < 0 { x + n } else { x };
        let err = || LayoutError::Slice {
            range: *self,
            extent,
        };
        match self.step {
            0 => Err(LayoutError::Step),
            step if step > 0 => {
                let start = self.start.map_or(0, wrap);
                let stop = self.stop.map_or(n, wrap);
                if !(0..=n).contains(&start) || !(0..=n).contains(&stop) {
                    return Err(err());
                }
                let len = match stop > start {
                    true => (stop - start + step - 1) / step,
                    false => 0,
                };
                Ok((start, len as usize))
            }
            step => {
                // `-1` stands for the position before the first element
                let start = self.start.map_or(n - 1, wrap);
                let stop = self.stop.map_or(-1, wrap);
                // position `n` does not exist, so a reversed range can not start there
                if !(-1..n).contains(&start) || !(-1..=n).contains(&stop) {
                    return Err(err());
                }
                let len = match start > stop {
                    true => (start - stop - step - 1) / -step,
                    false => 0,
                };
                Ok((start, len as usize))
            }
        }
    }
}

/// Placeholder that keeps every axis it is not pushed aside by.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ellipsis;

/// Inserts an axis of extent 1 and stride 0.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NewAxis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Subscript {
    /// Selects one position and removes the axis.
    #[display("{_0}")]
    Index(isize),
    /// Selects a strided range of positions.
    #[display("{_0}")]
    Slice(SliceRange),
    /// Passes through as many axes as the other subscripts leave.
    #[display("...")]
    Ellipsis,
    /// Inserts a new axis of extent 1.
    #[display("+")]
    NewAxis,
}

impl Subscript {
    /// Returns `true` if the subscript is matched against an axis of the layout.
    #[inline]
    pub const fn consumes_axis(&self) -> bool {
        matches!(self, Self::Index(_) | Self::Slice(_))
    }
}

impl From<SliceRange> for Subscript {
    #[inline]
    fn from(value: SliceRange) -> Self {
        Self::Slice(value)
    }
}

impl From<Ellipsis> for Subscript {
    #[inline]
    fn from(_: Ellipsis) -> Self {
        Self::Ellipsis
    }
}

impl From<NewAxis> for Subscript {
    #[inline]
    fn from(_: NewAxis) -> Self {
        Self::NewAxis
    }
}

impl From<std::ops::RangeFull> for Subscript {
    #[inline]
    fn from(_: std::ops::RangeFull) -> Self {
        Self::Slice(SliceRange::all())
    }
}

macro_rules! impl_subscript_from_int {
    ($($t:ty),+) => {
        $(
            impl From<$t> for Subscript {
                #[inline]
                fn from(value: $t) -> Self {
                    Self::Index(value as isize)
                }
            }

            impl From<std::ops::Range<$t>> for Subscript {
                #[inline]
                fn from(value: std::ops::Range<$t>) -> Self {
                    let range = SliceRange::new(Some(value.start as isize), Some(value.end as isize), 1);
                    Self::Slice(range)
                }
            }

            impl From<std::ops::RangeFrom<$t>> for Subscript {
                #[inline]
                fn from(value: std::ops::RangeFrom<$t>) -> Self {
                    Self::Slice(SliceRange::new(Some(value.start as isize), None, 1))
                }
            }

            impl From<std::ops::RangeTo<$t>> for Subscript {
                #[inline]
                fn from(value: std::ops::RangeTo<$t>) -> Self {
                    Self::Slice(SliceRange::new(None, Some(value.end as isize), 1))
                }
            }
        )+
    };
}

impl_subscript_from_int!(isize, i32, i64, usize);

/// A sequence of subscripts applied to a layout from its first axis on.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deref, From, Into, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("[{}]", _0.iter().format(", "))]
#[deref(forward)]
pub struct Subscripts(Arc<[Subscript]>);

impl From<Vec<Subscript>> for Subscripts {
    #[inline]
    fn from(value: Vec<Subscript>) -> Self {
        Self(value.into())
    }
}

impl From<&[Subscript]> for Subscripts {
    #[inline]
    fn from(value: &[Subscript]) -> Self {
        Self(value.into())
    }
}

macro_rules! impl_subscripts_from {
    ($t:ident) => {
        impl<$t: Into<Subscript>> From<$t> for Subscripts {
            #[inline]
            fn from(snake!($t): $t) -> Self {
                Self([snake!($t).into()].into())
            }
        }
    };
    ($($t:ident),+) => {
        impl<$($t),+> From<($($t),+)> for Subscripts
        where
            $($t: Into<Subscript>),+
        {
            #[inline]
            fn from(($(snake!($t)),+): ($($t),+)) -> Self {
                Self([$(snake!($t).into()),+].into())
            }
        }
    };
}

impl_subscripts_from!(T0);
impl_subscripts_from!(T0, T1);
impl_subscripts_from!(T0, T1, T2);
impl_subscripts_from!(T0, T1, T2, T3);
impl_subscripts_from!(T0, T1, T2, T3, T4);
impl_subscripts_from!(T0, T1, T2, T3, T4, T5);
impl_subscripts_from!(T0, T1, T2, T3, T4, T5, T6);
impl_subscripts_from!(T0, T1, T2, T3, T4, T5, T6, T7);

impl Subscripts {
    /// Number of [`Subscript::Ellipsis`] entries.
    #[inline]
    pub fn ellipsis_count(&self) -> usize {
        self.iter()
            .filter(|subscript| matches!(subscript, Subscript::Ellipsis))
            .count()
    }

    /// Number of subscripts that are matched against axes of the layout.
    #[inline]
    pub fn consumed_count(&self) -> usize {
        self.iter().filter(|subscript| subscript.consumes_axis()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::{Ellipsis, NewAxis, SliceRange, Subscript, Subscripts};
    use crate::{ErrorKind, loom::layout::LayoutError};

    #[test]
    fn test_resolve() -> Result<(), LayoutError> {
        assert_eq!(SliceRange::all().resolve(8)?, (0, 8));
        assert_eq!(SliceRange::reversed().resolve(8)?, (7, 8));
        assert_eq!(SliceRange::odd().resolve(8)?, (1, 4));
        assert_eq!(SliceRange::even().resolve(7)?, (0, 4));
        assert_eq!(SliceRange::new(Some(2), Some(-1), 3).resolve(10)?, (2, 3));
        assert_eq!(SliceRange::new(Some(-2), Some(1), -2).resolve(10)?, (8, 4));
        assert_eq!(SliceRange::new(Some(5), Some(2), 1).resolve(10)?, (5, 0));
        assert_eq!(SliceRange::reversed().resolve(0)?, (-1, 0));
        assert_eq!(SliceRange::all().resolve(0)?, (0, 0));
        Ok(())
    }

    #[test]
    fn test_resolve_errors() {
        let err = SliceRange::new(None, None, 0).resolve(4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = SliceRange::new(Some(5), None, 1).resolve(4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);

        let err = SliceRange::new(Some(-6), None, 1).resolve(4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);

        // a reversed range starts at an existing position
        let err = SliceRange::new(Some(4), None, -1).resolve(4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
        let err = SliceRange::new(Some(0), None, -1).resolve(0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
        assert_eq!(SliceRange::new(Some(3), None, -1).resolve(4).ok(), Some((3, 4)));
        assert_eq!(SliceRange::new(Some(-5), None, -1).resolve(4).ok(), Some((-1, 0)));
    }

    #[test]
    fn test_subscripts_from() {
        let subscripts = Subscripts::from((Ellipsis, 6, NewAxis, .., 1..3));
        assert_eq!(
            &subscripts[..],
            &[
                Subscript::Ellipsis,
                Subscript::Index(6),
                Subscript::NewAxis,
                Subscript::Slice(SliceRange::all()),
                Subscript::Slice(SliceRange::new(Some(1), Some(3), 1)),
            ]
        );
        assert_eq!(subscripts.ellipsis_count(), 1);
        assert_eq!(subscripts.consumed_count(), 3);
        assert_eq!(subscripts.to_string(), "[..., 6, +, :, 1:3]");

        let subscripts = Subscripts::from(SliceRange::reversed());
        assert_eq!(subscripts.to_string(), "[::-1]");
    }
}
