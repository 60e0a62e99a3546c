use std::{
    ops::Range,
    sync::{
        Arc, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
};

use bytemuck::Pod;
use thiserror::Error;

use crate::ErrorKind;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("out of memory: requested {requested} bytes, but only {available} bytes are available")]
    OutOfMemory { requested: usize, available: usize },
    #[error("a request of {0} bytes exceeds the address space")]
    TooLarge(usize),
    #[error("the system failed to reserve {0} bytes")]
    Reserve(usize),
    #[error("alignment {0} is not a power of two")]
    Alignment(usize),
    #[error("range {start}..{end} is out of a heap of {size} bytes")]
    Range { start: usize, end: usize, size: usize },
}

impl MemoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::OutOfMemory { .. } | Self::TooLarge(_) | Self::Reserve(_) => {
                ErrorKind::OutOfMemory
            }
            Self::Alignment(_) => ErrorKind::InvalidArgument,
            Self::Range { .. } => ErrorKind::OutOfRange,
        }
    }
}

/// Source of large backing allocations.
pub trait MemoryResource {
    type Heap: MemoryHeap;

    /// Allocates a heap of `size` bytes whose start is aligned to `alignment`.
    fn create_heap(&self, size: usize, alignment: usize) -> Result<Self::Heap, MemoryError>;
}

/// One contiguous backing allocation.
pub trait MemoryHeap {
    type Buffer;

    fn size(&self) -> usize;

    /// Creates a view of `size` bytes starting `offset` bytes into the heap.
    fn create_buffer(&self, offset: usize, size: usize) -> Result<Self::Buffer, MemoryError>;
}

/// Host memory resource with an optional capacity.
#[derive(Debug, Default, Clone)]
pub struct HostMemoryResource {
    capacity: Option<usize>,
    used: Arc<AtomicUsize>,
}

impl HostMemoryResource {
    /// A resource limited only by the system allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// A resource that fails with [`MemoryError::OutOfMemory`] past `capacity` bytes of live heaps.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = Some(capacity);
        let used = Default::default();
        Self { capacity, used }
    }

    /// Bytes held by live heaps.
    #[inline]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    #[inline]
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

impl MemoryResource for HostMemoryResource {
    type Heap = HostHeap;

    fn create_heap(&self, size: usize, alignment: usize) -> Result<Self::Heap, MemoryError> {
        if !alignment.is_power_of_two() {
            return Err(MemoryError::Alignment(alignment));
        }

        // over-allocate so that an aligned start always fits
        let padded = size
            .checked_add(alignment - 1)
            .ok_or(MemoryError::TooLarge(size))?;

        let capacity = self.capacity;
        let fits = |used: usize| {
            used.checked_add(size)
                .filter(|&used| capacity.is_none_or(|capacity| used <= capacity))
        };
        if let Err(used) = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, fits)
        {
            let available = capacity.map_or(usize::MAX, |capacity| capacity.saturating_sub(used));
            return Err(MemoryError::OutOfMemory {
                requested: size,
                available,
            });
        }

        let mut data = Vec::new();
        if data.try_reserve_exact(padded).is_err() {
            self.used.fetch_sub(size, Ordering::AcqRel);
            return Err(MemoryError::Reserve(padded));
        }
        data.resize(padded, 0u8);
        let data = data.into_boxed_slice();
        let start = data.as_ptr().align_offset(alignment);
        let memory = HostMemory {
            data: RwLock::new(data),
            start,
            size,
            used: self.used.clone(),
        };
        Ok(HostHeap(Arc::new(memory)))
    }
}

#[derive(Debug)]
struct HostMemory {
    data: RwLock<Box<[u8]>>,
    /// Offset of the aligned start within `data`.
    start: usize,
    size: usize,
    used: Arc<AtomicUsize>,
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        self.used.fetch_sub(self.size, Ordering::AcqRel);
    }
}

/// A heap of host memory. Buffer views keep the memory alive.
#[derive(Debug, Clone)]
pub struct HostHeap(Arc<HostMemory>);

impl MemoryHeap for HostHeap {
    type Buffer = HostBuffer;

    #[inline]
    fn size(&self) -> usize {
        self.0.size
    }

    fn create_buffer(&self, offset: usize, size: usize) -> Result<Self::Buffer, MemoryError> {
        let heap_size = self.size();
        match offset.checked_add(size) {
            Some(end) if end <= heap_size => Ok(HostBuffer {
                memory: self.0.clone(),
                offset,
                size,
            }),
            _ => Err(MemoryError::Range {
                start: offset,
                end: offset.saturating_add(size),
                size: heap_size,
            }),
        }
    }
}

/// A byte range of a [`HostHeap`].
#[derive(Debug, Clone)]
pub struct HostBuffer {
    memory: Arc<HostMemory>,
    offset: usize,
    size: usize,
}

impl HostBuffer {
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Offset of the view within its heap.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    fn range(&self) -> Range<usize> {
        let start = self.memory.start + self.offset;
        start..start + self.size
    }

    /// Address of the first byte of the view.
    pub fn address(&self) -> usize {
        let data = self.memory.data.read().expect("failed to lock");
        data[self.range()].as_ptr() as usize
    }

    /// Copies the contents out as elements of `T`.
    pub fn read<T: Pod>(&self) -> Vec<T> {
        let data = self.memory.data.read().expect("failed to lock");
        bytemuck::pod_collect_to_vec(&data[self.range()])
    }

    /// Writes `contents` starting `offset` bytes into the view.
    pub fn write<T: Pod>(&self, offset: usize, contents: &[T]) -> Result<(), MemoryError> {
        let contents: &[u8] = bytemuck::cast_slice(contents);
        let end = offset.saturating_add(contents.len());
        if end > self.size {
            let size = self.size;
            return Err(MemoryError::Range {
                start: offset,
                end,
                size,
            });
        }
        let start = self.range().start;
        let mut data = self.memory.data.write().expect("failed to lock");
        data[start + offset..start + end].copy_from_slice(contents);
        Ok(())
    }
}
