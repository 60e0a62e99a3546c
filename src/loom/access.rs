//! Joint iteration plans over several strided operands.
//!
//! An [`AccessLayout`] shares one *batch* shape among all of its operands. Each operand also
//! keeps trailing *core* axes of its own, which the planner never touches. Batch axes are stored
//! in iteration order: axis 0 is the innermost, fastest-varying one, which is the last batch axis
//! of the layouts the operands were created from.

use std::{cmp::Ordering, ops::BitOr};

use itertools::Itertools;
use thiserror::Error;

use super::layout::{
    Axis, Extents, Layout, Strides,
    axis::{self, insertion_sort_by},
};
use crate::ErrorKind;

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("Extents can only be set once and before adding any operand")]
    Extents,
    #[error("access layout is not initialized: no operand has been added")]
    Uninitialized,
    #[error("access layout is optimized and accepts no more operands")]
    Frozen,
    #[error("operand {index} is out of range for an access layout of {count} operands")]
    Operand { index: usize, count: usize },
    #[error("operand asks for {core} core dimensions, but its layout has rank {rank}")]
    Core { core: usize, rank: usize },
    #[error("Can not broadcast operand of batch extents {operand} into batch extents {extents}")]
    Broadcast { extents: Extents, operand: Extents },
}

impl AccessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Extents | Self::Uninitialized | Self::Frozen => ErrorKind::InvalidOperation,
            Self::Operand { .. } => ErrorKind::OutOfRange,
            Self::Core { .. } => ErrorKind::InvalidArgument,
            Self::Broadcast { .. } => ErrorKind::Broadcast,
        }
    }
}

/// Which passes [`AccessLayout::optimize_batch`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OptimizeFlags {
    /// Sort batch axes by memory locality, innermost first.
    pub reorder: bool,
    /// Merge batch axes that are contiguous for every operand.
    pub coalesce: bool,
}

impl Default for OptimizeFlags {
    fn default() -> Self {
        Self::ALL
    }
}

impl BitOr for OptimizeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self {
            reorder: self.reorder || rhs.reorder,
            coalesce: self.coalesce || rhs.coalesce,
        }
    }
}

impl OptimizeFlags {
    pub const NONE: Self = Self {
        reorder: false,
        coalesce: false,
    };
    pub const REORDER: Self = Self {
        reorder: true,
        coalesce: false,
    };
    pub const COALESCE: Self = Self {
        reorder: false,
        coalesce: true,
    };
    pub const ALL: Self = Self {
        reorder: true,
        coalesce: true,
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Operand {
    /// Batch strides in iteration order.
    strides: Vec<isize>,
    /// Core axes in layout order.
    core: Vec<Axis>,
    offset: isize,
}

/// A batch shape shared by several operands, each with its own strides and core axes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AccessLayout {
    /// Batch extents in iteration order. `None` until set or seeded by the first operand.
    extents: Option<Vec<usize>>,
    /// Set by [`AccessLayout::set_extents`]; a fixed batch shape never grows.
    fixed: bool,
    /// Set by [`AccessLayout::optimize_batch`]; batch axes no longer match operand layouts.
    frozen: bool,
    operands: Vec<Operand>,
}

impl std::fmt::Display for AccessLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Some(extents) = &self.extents else {
            return write!(f, "{{}}");
        };
        write!(f, "{{{extents:?}")?;
        for operand in &self.operands {
            write!(f, "; {:?}", operand.strides)?;
            if !operand.core.is_empty() {
                write!(f, " | {}", operand.core.iter().format(", "))?;
            }
            if operand.offset != 0 {
                write!(f, " +{}", operand.offset)?;
            }
        }
        write!(f, "}}")
    }
}

impl AccessLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixes the batch shape up front. Operands added later must broadcast into it.
    pub fn set_extents(&mut self, extents: &[usize]) -> Result<(), AccessError> {
        if self.frozen {
            return Err(AccessError::Frozen);
        }
        if self.extents.is_some() || !self.operands.is_empty() {
            return Err(AccessError::Extents);
        }
        self.extents = Some(extents.iter().rev().copied().collect());
        self.fixed = true;
        Ok(())
    }

    /// Adds an operand whose axes are all batch axes.
    #[inline]
    pub fn add_operand(&mut self, layout: &Layout) -> Result<(), AccessError> {
        self.add_operand_with_core(layout, 0)
    }

    /// Adds an operand whose trailing `core` axes are private to it.
    ///
    /// The leading axes are broadcast against the batch shape, aligned from the last one.
    /// Operand axes of extent 1 are promoted with stride 0. Without fixed extents the batch
    /// shape is promoted as well; earlier operands then get stride 0 along the grown axes. On
    /// failure the access layout is left as it was.
    pub fn add_operand_with_core(&mut self, layout: &Layout, core: usize) -> Result<(), AccessError> {
        if self.frozen {
            return Err(AccessError::Frozen);
        }
        let rank = layout.rank();
        if core > rank {
            return Err(AccessError::Core { core, rank });
        }
        let (batch, core) = layout.axes().split_at(rank - core);
        let batch = batch.iter().rev().copied().collect_vec();

        let Some(extents) = &self.extents else {
            self.extents = Some(batch.iter().map(|axis| axis.extent).collect());
            self.operands.push(Operand {
                strides: batch.iter().map(|axis| axis.stride).collect(),
                core: core.to_vec(),
                offset: layout.offset(),
            });
            return Ok(());
        };

        let err = || AccessError::Broadcast {
            extents: extents.iter().rev().copied().collect_vec().into(),
            operand: batch.iter().rev().map(|axis| axis.extent).collect_vec().into(),
        };
        if self.fixed && batch.len() > extents.len() {
            return Err(err());
        }

        let len = extents.len().max(batch.len());
        let mut axes = batch.clone();
        axes.resize(len, Axis::new(1, 0));
        let mut target = extents.iter().map(|&extent| Axis::new(extent, 0)).collect_vec();
        target.resize(len, Axis::new(1, 0));
        if !axis::broadcast(&mut axes, &mut target) {
            return Err(err());
        }

        let grown = extents
            .iter()
            .zip(&target)
            .positions(|(&extent, target)| extent != target.extent)
            .collect_vec();
        if self.fixed && !grown.is_empty() {
            return Err(err());
        }
        let promoted = target.iter().map(|axis| axis.extent).collect_vec();
        let strides = axes.iter().map(|axis| axis.stride).collect_vec();

        for operand in &mut self.operands {
            operand.strides.resize(len, 0);
            for &index in &grown {
                operand.strides[index] = 0;
            }
        }
        self.extents = Some(promoted);
        self.operands.push(Operand {
            strides,
            core: core.to_vec(),
            offset: layout.offset(),
        });
        Ok(())
    }

    fn extents_or_err(&self) -> Result<&[usize], AccessError> {
        match (&self.extents, self.operands.is_empty()) {
            (Some(extents), false) => Ok(extents),
            _ => Err(AccessError::Uninitialized),
        }
    }

    fn operand(&self, index: usize) -> Result<&Operand, AccessError> {
        self.extents_or_err()?;
        let count = self.operands.len();
        self.operands
            .get(index)
            .ok_or(AccessError::Operand { index, count })
    }

    pub fn operand_count(&self) -> Result<usize, AccessError> {
        self.extents_or_err()?;
        Ok(self.operands.len())
    }

    /// Batch extents in iteration order, innermost first.
    pub fn batch_extents(&self) -> Result<Extents, AccessError> {
        self.extents_or_err().map(Extents::from)
    }

    /// Batch strides of one operand in iteration order, innermost first.
    pub fn batch_strides(&self, operand: usize) -> Result<Strides, AccessError> {
        self.operand(operand)
            .map(|operand| Strides::from(&operand.strides[..]))
    }

    pub fn core_extents(&self, operand: usize) -> Result<Extents, AccessError> {
        self.operand(operand)
            .map(|operand| operand.core.iter().map(|axis| axis.extent).collect_vec().into())
    }

    pub fn core_strides(&self, operand: usize) -> Result<Strides, AccessError> {
        self.operand(operand)
            .map(|operand| operand.core.iter().map(|axis| axis.stride).collect_vec().into())
    }

    pub fn offset(&self, operand: usize) -> Result<isize, AccessError> {
        self.operand(operand).map(|operand| operand.offset)
    }

    /// Joint locality verdict for batch axes `x` placed before `y` in iteration order.
    ///
    /// Operands with a zero stride on either axis abstain, and the first strict comparison
    /// decides. `Some(Equal)` if every voting operand ties, `None` if none votes.
    fn locality(&self, extents: &[usize], x: usize, y: usize) -> Option<Ordering> {
        if extents[x] == 1 || extents[y] == 1 {
            return None;
        }
        let mut verdict = None;
        for operand in &self.operands {
            let (sx, sy) = (operand.strides[x], operand.strides[y]);
            if sx == 0 || sy == 0 {
                continue;
            }
            match sx.unsigned_abs().cmp(&sy.unsigned_abs()) {
                Ordering::Equal => verdict = Some(Ordering::Equal),
                ordering => return Some(ordering),
            }
        }
        verdict
    }

    fn reorder(&mut self) {
        let Some(extents) = &self.extents else {
            return;
        };
        let mut order = (0..extents.len()).collect_vec();
        insertion_sort_by(&mut order, |&x, &y| self.locality(extents, x, y));

        let extents = order.iter().map(|&index| extents[index]).collect();
        for operand in &mut self.operands {
            operand.strides = order.iter().map(|&index| operand.strides[index]).collect();
        }
        self.extents = Some(extents);
    }

    fn coalesce(&mut self) {
        let Some(extents) = &mut self.extents else {
            return;
        };
        if extents.is_empty() {
            return;
        }

        fn mergeable(extents: &[usize], operands: &[Operand], x: usize, y: usize) -> bool {
            extents[x] == 1
                || extents[y] == 1
                || operands
                    .iter()
                    .all(|operand| operand.strides[x] * extents[x] as isize == operand.strides[y])
        }

        let operands = &mut self.operands;

        let mut last = 0;
        for index in 1..extents.len() {
            if mergeable(extents, operands, last, index) {
                if extents[last] == 1 {
                    for operand in operands.iter_mut() {
                        operand.strides[last] = operand.strides[index];
                    }
                }
                extents[last] *= extents[index];
            } else {
                last += 1;
                extents[last] = extents[index];
                for operand in operands.iter_mut() {
                    operand.strides[last] = operand.strides[index];
                }
            }
        }

        extents.truncate(last + 1);
        for operand in operands.iter_mut() {
            operand.strides.truncate(last + 1);
        }
    }

    /// Reorders and/or coalesces batch axes. The set of visited element offsets per operand
    /// does not change, only the order of the visit.
    ///
    /// Afterwards the access layout accepts no more operands or extents.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn optimize_batch(&mut self, flags: OptimizeFlags) {
        self.frozen = true;
        if flags.reorder {
            self.reorder();
        }
        if flags.coalesce {
            self.coalesce();
        }
        log::trace!("optimized access layout: {self}");
    }

    /// Walks every batch position, first axis fastest, yielding per-operand element offsets of
    /// the first core element. Empty before any operand is added.
    pub fn iter_offsets(&self) -> Offsets<'_> {
        let extents = self.extents.as_deref().unwrap_or_default();
        let done = self.operands.is_empty() || extents.contains(&0);
        Offsets {
            layout: self,
            extents,
            index: vec![0; extents.len()],
            offsets: self.operands.iter().map(|operand| operand.offset).collect(),
            done,
        }
    }
}

/// Iterator returned by [`AccessLayout::iter_offsets`].
#[derive(Debug, Clone)]
pub struct Offsets<'a> {
    layout: &'a AccessLayout,
    extents: &'a [usize],
    index: Vec<usize>,
    offsets: Vec<isize>,
    done: bool,
}

impl Iterator for Offsets<'_> {
    type Item = Vec<isize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.offsets.clone();

        self.done = true;
        for (axis, &extent) in self.extents.iter().enumerate() {
            let operands = self.layout.operands.iter();
            self.index[axis] += 1;
            if self.index[axis] < extent {
                for (offset, operand) in self.offsets.iter_mut().zip_eq(operands) {
                    *offset += operand.strides[axis];
                }
                self.done = false;
                break;
            }
            let rewind = (extent - 1) as isize;
            for (offset, operand) in self.offsets.iter_mut().zip_eq(operands) {
                *offset -= rewind * operand.strides[axis];
            }
            self.index[axis] = 0;
        }

        Some(item)
    }
}

/// Builds an [`AccessLayout`] and optimizes it on [`build`](AccessLayoutBuilder::build).
#[derive(Debug, Default, Clone)]
pub struct AccessLayoutBuilder {
    layout: AccessLayout,
    flags: OptimizeFlags,
}

impl AccessLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flags(mut self, flags: OptimizeFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn extents(mut self, extents: &[usize]) -> Result<Self, AccessError> {
        self.layout.set_extents(extents)?;
        Ok(self)
    }

    pub fn add_operand(mut self, layout: &Layout) -> Result<Self, AccessError> {
        self.layout.add_operand(layout)?;
        Ok(self)
    }

    pub fn add_operand_with_core(mut self, layout: &Layout, core: usize) -> Result<Self, AccessError> {
        self.layout.add_operand_with_core(layout, core)?;
        Ok(self)
    }

    pub fn build(self) -> Result<AccessLayout, AccessError> {
        let mut layout = self.layout;
        layout.extents_or_err()?;
        layout.optimize_batch(self.flags);
        Ok(layout)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::Itertools;

    use super::{AccessError, AccessLayout, AccessLayoutBuilder, OptimizeFlags};
    use crate::{ErrorKind, loom::layout::Layout};

    fn offsets(layout: &AccessLayout) -> Vec<Vec<isize>> {
        layout.iter_offsets().sorted().collect()
    }

    #[test]
    fn test_coalesce() -> Result<(), Box<dyn Error>> {
        let layout = Layout::custom(&[20, 6, 12, 12], &[1728, 288, 12, 1], 0)?;
        let access = AccessLayoutBuilder::new()
            .add_operand(&layout)?
            .add_operand(&layout)?
            .build()?;
        println!("{access}");

        assert_eq!(access.operand_count()?, 2);
        assert_eq!(&access.batch_extents()?[..], &[144, 120]);
        assert_eq!(&access.batch_strides(0)?[..], &[1, 288]);
        assert_eq!(&access.batch_strides(1)?[..], &[1, 288]);
        Ok(())
    }

    #[test]
    fn test_reorder() -> Result<(), Box<dyn Error>> {
        let x = Layout::custom(&[20, 6, 12, 12], &[864, 144, 12, 1], 0)?;
        let y = Layout::custom(&[20, 6, 12, 12], &[1, 20, 120, 1440], 0)?;
        let access = AccessLayoutBuilder::new()
            .flags(OptimizeFlags::REORDER)
            .add_operand(&x)?
            .add_operand(&y)?
            .build()?;
        println!("{access}");

        assert_eq!(&access.batch_extents()?[..], &[12, 12, 6, 20]);
        assert_eq!(&access.batch_strides(0)?[..], &[1, 12, 144, 864]);
        assert_eq!(&access.batch_strides(1)?[..], &[1440, 120, 20, 1]);
        Ok(())
    }

    #[test]
    fn test_reorder_transposed() -> Result<(), Box<dyn Error>> {
        // the first operand decides; the second only votes where the first abstains
        let x = Layout::contiguous(&[4, 3]).transpose();
        let y = Layout::custom(&[3, 4], &[0, 1], 0)?;
        let access = AccessLayoutBuilder::new()
            .flags(OptimizeFlags::REORDER)
            .add_operand(&x)?
            .add_operand(&y)?
            .build()?;
        assert_eq!(&access.batch_extents()?[..], &[3, 4]);
        assert_eq!(&access.batch_strides(0)?[..], &[1, 3]);
        assert_eq!(&access.batch_strides(1)?[..], &[0, 1]);

        // all operands abstain: the order is kept
        let x = Layout::custom(&[3, 4], &[0, 1], 0)?;
        let y = Layout::custom(&[3, 4], &[5, 0], 0)?;
        let access = AccessLayoutBuilder::new()
            .flags(OptimizeFlags::REORDER)
            .add_operand(&x)?
            .add_operand(&y)?
            .build()?;
        assert_eq!(&access.batch_extents()?[..], &[4, 3]);
        Ok(())
    }

    #[test]
    fn test_broadcast() -> Result<(), Box<dyn Error>> {
        let x = Layout::contiguous(&[2, 3, 4]);
        let y = Layout::contiguous(&[3, 1]);
        let access = AccessLayoutBuilder::new()
            .flags(OptimizeFlags::NONE)
            .add_operand(&x)?
            .add_operand(&y)?
            .build()?;
        assert_eq!(&access.batch_extents()?[..], &[4, 3, 2]);
        assert_eq!(&access.batch_strides(0)?[..], &[1, 4, 12]);
        assert_eq!(&access.batch_strides(1)?[..], &[0, 1, 0]);

        // the batch shape grows while it is not fixed
        let access = AccessLayoutBuilder::new()
            .flags(OptimizeFlags::NONE)
            .add_operand(&y)?
            .add_operand(&x)?
            .build()?;
        assert_eq!(&access.batch_extents()?[..], &[4, 3, 2]);
        assert_eq!(&access.batch_strides(0)?[..], &[0, 1, 0]);
        assert_eq!(&access.batch_strides(1)?[..], &[1, 4, 12]);

        let err = AccessLayoutBuilder::new()
            .add_operand(&x)?
            .add_operand(&Layout::contiguous(&[5]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Broadcast);
        assert!(err.kind().is_invalid_argument());
        assert!(err.to_string().contains("[2, 3, 4]"));
        assert!(err.to_string().contains("[5]"));
        Ok(())
    }

    #[test]
    fn test_extents() -> Result<(), Box<dyn Error>> {
        let x = Layout::contiguous(&[3, 1]);
        let access = AccessLayoutBuilder::new()
            .flags(OptimizeFlags::NONE)
            .extents(&[2, 3, 4])?
            .add_operand(&x)?
            .build()?;
        assert_eq!(&access.batch_extents()?[..], &[4, 3, 2]);
        assert_eq!(&access.batch_strides(0)?[..], &[0, 1, 0]);

        // fixed extents never grow
        let err = AccessLayoutBuilder::new()
            .extents(&[3, 1])?
            .add_operand(&Layout::contiguous(&[3, 4]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Broadcast);
        let err = AccessLayoutBuilder::new()
            .extents(&[3])?
            .add_operand(&Layout::contiguous(&[2, 3]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Broadcast);

        let err = AccessLayoutBuilder::new()
            .extents(&[2])?
            .extents(&[2])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
        assert_eq!(
            err.to_string(),
            "Extents can only be set once and before adding any operand"
        );

        let mut access = AccessLayout::new();
        access.add_operand(&x)?;
        let err = access.set_extents(&[3, 1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
        Ok(())
    }

    #[test]
    fn test_frozen() -> Result<(), Box<dyn Error>> {
        let x = Layout::contiguous(&[3, 3]);
        let mut access = AccessLayoutBuilder::new()
            .flags(OptimizeFlags::REORDER)
            .add_operand(&x.transpose())?
            .build()?;
        assert_eq!(&access.batch_strides(0)?[..], &[1, 3]);

        // the batch axes were reordered, so a later operand could not be paired with them
        let err = access.add_operand(&x).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
        assert!(matches!(err, AccessError::Frozen));
        let err = access.set_extents(&[3, 3]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
        assert_eq!(access.operand_count()?, 1);

        // the same operands added up front keep their pairing
        let access = AccessLayoutBuilder::new()
            .flags(OptimizeFlags::REORDER)
            .add_operand(&x.transpose())?
            .add_operand(&x)?
            .build()?;
        assert!(access.iter_offsets().contains(&vec![1, 3]));
        assert!(access.iter_offsets().all(|x| x[0] == 3 * (x[1] % 3) + x[1] / 3));

        let mut access = AccessLayout::new();
        access.add_operand(&x)?;
        access.optimize_batch(OptimizeFlags::NONE);
        let err = access.add_operand(&x).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
        Ok(())
    }

    #[test]
    fn test_core() -> Result<(), Box<dyn Error>> {
        let x = Layout::custom(&[5, 3, 2, 2], &[12, 4, 2, 1], 7)?;
        let y = Layout::contiguous(&[3, 8]);
        let access = AccessLayoutBuilder::new()
            .add_operand_with_core(&x, 2)?
            .add_operand_with_core(&y, 1)?
            .build()?;
        assert_eq!(&access.batch_extents()?[..], &[3, 5]);
        assert_eq!(&access.batch_strides(0)?[..], &[4, 12]);
        assert_eq!(&access.batch_strides(1)?[..], &[8, 0]);
        assert_eq!(&access.core_extents(0)?[..], &[2, 2]);
        assert_eq!(&access.core_strides(0)?[..], &[2, 1]);
        assert_eq!(&access.core_extents(1)?[..], &[8]);
        assert_eq!(access.offset(0)?, 7);

        let err = access.core_extents(2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);

        let err = AccessLayoutBuilder::new()
            .add_operand_with_core(&y, 3)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        Ok(())
    }

    #[test]
    fn test_uninitialized() -> Result<(), Box<dyn Error>> {
        let access = AccessLayout::new();
        assert!(matches!(access.operand_count(), Err(AccessError::Uninitialized)));
        assert!(matches!(access.batch_extents(), Err(AccessError::Uninitialized)));
        assert!(matches!(access.batch_strides(0), Err(AccessError::Uninitialized)));
        assert!(matches!(access.core_extents(0), Err(AccessError::Uninitialized)));
        assert!(matches!(access.core_strides(0), Err(AccessError::Uninitialized)));
        assert_eq!(access.iter_offsets().count(), 0);

        let mut access = AccessLayout::new();
        access.set_extents(&[2, 3])?;
        let err = access.batch_extents().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);

        let err = AccessLayoutBuilder::new().build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
        Ok(())
    }

    #[test]
    fn test_iter_offsets() -> Result<(), Box<dyn Error>> {
        let x = Layout::contiguous(&[2, 3]);
        let access = AccessLayoutBuilder::new()
            .flags(OptimizeFlags::NONE)
            .add_operand(&x.transpose())?
            .build()?;
        let offsets = access.iter_offsets().map(|x| x[0]).collect_vec();
        assert_eq!(offsets, [0, 3, 1, 4, 2, 5]);

        let access = AccessLayoutBuilder::new()
            .add_operand(&Layout::default().with_offset(4))?
            .build()?;
        assert_eq!(access.iter_offsets().collect_vec(), [vec![4]]);

        let access = AccessLayoutBuilder::new()
            .add_operand(&Layout::contiguous(&[2, 0]))?
            .build()?;
        assert_eq!(access.iter_offsets().count(), 0);
        Ok(())
    }

    #[test]
    fn test_random() -> Result<(), Box<dyn Error>> {
        for _ in 0..256 {
            let rank = fastrand::usize(0..5);
            let extents = (0..rank).map(|_| fastrand::usize(1..5)).collect_vec();
            let operands = (0..fastrand::usize(1..4))
                .map(|_| {
                    let contiguous = Layout::contiguous(&extents);
                    let mut order = (0..rank).collect_vec();
                    fastrand::shuffle(&mut order);
                    let strides = order
                        .iter()
                        .map(|&index| match fastrand::u8(..4) {
                            0 => 0,
                            1 => -contiguous.strides()[index],
                            _ => contiguous.strides()[index],
                        })
                        .collect_vec();
                    Layout::custom(&extents, &strides, fastrand::isize(0..32))
                })
                .collect::<Result<Vec<_>, _>>()?;

            let build = |flags: OptimizeFlags| -> Result<AccessLayout, AccessError> {
                operands
                    .iter()
                    .try_fold(AccessLayoutBuilder::new().flags(flags), |builder, layout| {
                        builder.add_operand(layout)
                    })?
                    .build()
            };
            let reference = build(OptimizeFlags::NONE)?;
            let count = extents.iter().product::<usize>();
            assert_eq!(reference.iter_offsets().count(), count);

            for flags in [
                OptimizeFlags::REORDER,
                OptimizeFlags::COALESCE,
                OptimizeFlags::ALL,
            ] {
                let optimized = build(flags)?;
                assert_eq!(offsets(&optimized), offsets(&reference), "{optimized}");
                assert!(optimized.batch_extents()?.len() <= rank.max(1));
            }
        }
        Ok(())
    }
}
