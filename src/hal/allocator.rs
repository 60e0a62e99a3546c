//! A caching allocator that carves memory heaps into blocks.
//!
//! Free blocks are binned by the queue they were last used on, and a request from a queue only
//! reuses blocks of that queue. A buffer that was also used on other queues is not reused until
//! every one of those queues has signaled completion.
//!
//! The allocator itself is not synchronized: one allocator is meant to be driven by one thread.
//! [`Buffer`]s can be dropped anywhere; they hand their blocks back through a channel that the
//! allocator drains on the next [`CachingAllocator::allocate`] or [`CachingAllocator::collect`].

use std::{collections::BTreeSet, sync::Arc};

use derive_more::Display;
use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use super::{
    memory::{MemoryError, MemoryHeap, MemoryResource},
    queue::{Event, Queue, QueueId},
};
use crate::ErrorKind;

pub const DEFAULT_SIZE_STEP: usize = 256;
pub const DEFAULT_REQUEST_SIZE_STEP: usize = 2 << 20;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("{0} must be a power of two, but is {1}")]
    Step(&'static str, usize),
    #[error("request size step {request} is smaller than size step {size}")]
    RequestStep { size: usize, request: usize },
    #[error("alignment {0} is not a power of two")]
    Alignment(usize),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

impl AllocError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Step(..) | Self::RequestStep { .. } | Self::Alignment(_) => {
                ErrorKind::InvalidArgument
            }
            Self::Memory(err) => err.kind(),
        }
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeapId(usize);

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(usize);

/// A partition of a heap. Neighbours in address order are linked both ways.
#[derive(Debug, Clone, Copy)]
struct Block {
    heap: HeapId,
    offset: usize,
    size: usize,
    queue: QueueId,
    occupied: bool,
    prev: Option<BlockId>,
    next: Option<BlockId>,
}

/// Public snapshot of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub heap: HeapId,
    pub offset: usize,
    pub size: usize,
    pub queue: QueueId,
    pub occupied: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorStats {
    pub heaps: usize,
    pub heap_bytes: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
    pub occupied_blocks: usize,
    pub occupied_bytes: usize,
    /// Blocks waiting for events of other queues.
    pub pending: usize,
}

/// A block handed back by a dropped [`Allocation`], with events of the other queues it was
/// used on.
#[derive(Debug)]
struct Returned {
    block: BlockId,
    events: Vec<Box<dyn Event>>,
}

/// A block whose release waits for events.
#[derive(Debug)]
struct Pending {
    block: BlockId,
    events: Vec<Box<dyn Event>>,
}

/// Tracks one allocated block. Dropping it returns the block to its allocator.
#[derive(Debug)]
pub struct Allocation {
    block: BlockId,
    heap: HeapId,
    offset: usize,
    size: usize,
    queue: Arc<dyn Queue>,
    recorded: Vec<Arc<dyn Queue>>,
    sender: flume::Sender<Returned>,
}

impl Drop for Allocation {
    fn drop(&mut self) {
        let block = self.block;
        let owner = self.queue.id();
        let events = std::mem::take(&mut self.recorded)
            .into_iter()
            .filter(|queue| queue.id() != owner)
            .unique_by(|queue| queue.id())
            .map(|queue| queue.signal())
            .collect();
        _ = self.sender.send(Returned { block, events });
    }
}

/// A view into allocator-owned memory.
#[derive(Debug)]
pub struct Buffer<V> {
    view: V,
    allocation: Allocation,
}

impl<V> Buffer<V> {
    #[inline]
    pub fn view(&self) -> &V {
        &self.view
    }

    /// Requested size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.allocation.size
    }

    /// Offset of the view within its heap.
    #[inline]
    pub fn offset(&self) -> usize {
        self.allocation.offset
    }

    #[inline]
    pub fn heap(&self) -> HeapId {
        self.allocation.heap
    }

    /// The queue the buffer was allocated for.
    #[inline]
    pub fn queue(&self) -> &Arc<dyn Queue> {
        &self.allocation.queue
    }

    /// Notes that `queue` uses the buffer. Once dropped, the block is not reused before every
    /// recorded queue other than the owning one has completed the work submitted up to the drop.
    ///
    /// An `exclusive` record forgets the queues recorded before.
    pub fn record(&mut self, queue: &Arc<dyn Queue>, exclusive: bool) {
        let recorded = &mut self.allocation.recorded;
        if exclusive {
            recorded.clear();
        }
        if recorded.iter().all(|other| other.id() != queue.id()) {
            recorded.push(queue.clone());
        }
    }
}

#[derive(Debug, Clone)]
pub struct CachingAllocatorBuilder<R> {
    resource: R,
    size_step: usize,
    request_size_step: usize,
}

impl<R: MemoryResource> CachingAllocatorBuilder<R> {
    pub fn new(resource: R) -> Self {
        Self {
            resource,
            size_step: DEFAULT_SIZE_STEP,
            request_size_step: DEFAULT_REQUEST_SIZE_STEP,
        }
    }

    /// Granularity of block sizes and alignment of block offsets.
    pub fn size_step(mut self, size_step: usize) -> Self {
        self.size_step = size_step;
        self
    }

    /// Granularity of heap sizes requested from the resource.
    pub fn request_size_step(mut self, request_size_step: usize) -> Self {
        self.request_size_step = request_size_step;
        self
    }

    pub fn build(self) -> Result<CachingAllocator<R>, AllocError> {
        let Self {
            resource,
            size_step,
            request_size_step,
        } = self;
        if !size_step.is_power_of_two() {
            return Err(AllocError::Step("size step", size_step));
        }
        if !request_size_step.is_power_of_two() {
            return Err(AllocError::Step("request size step", request_size_step));
        }
        if request_size_step < size_step {
            return Err(AllocError::RequestStep {
                size: size_step,
                request: request_size_step,
            });
        }

        let (sender, receiver) = flume::unbounded();
        Ok(CachingAllocator {
            resource,
            size_step,
            request_size_step,
            heaps: HashMap::default(),
            blocks: HashMap::default(),
            free: HashMap::default(),
            pending: Vec::new(),
            sender,
            receiver,
            next_id: 0,
        })
    }
}

#[derive(Debug)]
struct Heap<H> {
    inner: H,
    /// Alignment of the heap start, at least the size step.
    alignment: usize,
}

/// Caching block allocator over a [`MemoryResource`].
pub struct CachingAllocator<R: MemoryResource> {
    resource: R,
    size_step: usize,
    request_size_step: usize,
    heaps: HashMap<HeapId, Heap<R::Heap>>,
    blocks: HashMap<BlockId, Block>,
    /// Free blocks by queue, ordered by size for best-fit lookup.
    free: HashMap<QueueId, BTreeSet<(usize, BlockId)>>,
    pending: Vec<Pending>,
    sender: flume::Sender<Returned>,
    receiver: flume::Receiver<Returned>,
    next_id: usize,
}

impl<R: MemoryResource> CachingAllocator<R> {
    #[inline]
    pub fn resource(&self) -> &R {
        &self.resource
    }

    #[inline]
    pub fn size_step(&self) -> usize {
        self.size_step
    }

    #[inline]
    pub fn request_size_step(&self) -> usize {
        self.request_size_step
    }

    fn next_id(&mut self) -> usize {
        self.next_id += 1;
        self.next_id
    }

    /// Allocates `size` bytes aligned to `alignment` for use on `queue`.
    ///
    /// Returned and completed blocks are collected first. Without a fitting free block of
    /// `queue`, a new heap is requested. If the resource is exhausted, pending releases are
    /// waited out and unused heaps released before one more attempt.
    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, queue)))]
    pub fn allocate(
        &mut self,
        size: usize,
        alignment: usize,
        queue: &Arc<dyn Queue>,
    ) -> Result<Buffer<<R::Heap as MemoryHeap>::Buffer>, AllocError> {
        if !alignment.is_power_of_two() {
            return Err(AllocError::Alignment(alignment));
        }
        // block offsets are multiples of the size step, so larger alignments need padding
        let padding = alignment.saturating_sub(self.size_step);
        let rounded = size
            .max(1)
            .checked_next_multiple_of(self.size_step)
            .and_then(|rounded| rounded.checked_add(padding))
            .ok_or(MemoryError::TooLarge(size))?;

        self.collect();
        let queue_id = queue.id();
        let id = match self.find_free(queue_id, rounded, alignment) {
            Some(id) => id,
            None => self.grow(rounded, alignment, queue_id)?,
        };
        let block = self.take(id, rounded);
        let offset = block.offset.next_multiple_of(alignment);

        let view = match self.heaps.get(&block.heap) {
            Some(heap) => heap.inner.create_buffer(offset, size),
            None => unreachable!("block {id} refers to a released heap"),
        };
        let view = match view {
            Ok(view) => view,
            Err(err) => {
                self.release(id);
                return Err(err.into());
            }
        };

        let allocation = Allocation {
            block: id,
            heap: block.heap,
            offset,
            size,
            queue: queue.clone(),
            recorded: Vec::new(),
            sender: self.sender.clone(),
        };
        Ok(Buffer { view, allocation })
    }

    /// Smallest free block of `queue` holding at least `size` bytes, on a heap aligned to at
    /// least `alignment`.
    fn find_free(&self, queue: QueueId, size: usize, alignment: usize) -> Option<BlockId> {
        self.free
            .get(&queue)?
            .range((size, BlockId(0))..)
            .find(|&&(_, id)| {
                self.heaps
                    .get(&self.block(id).heap)
                    .is_some_and(|heap| heap.alignment >= alignment)
            })
            .map(|&(_, id)| id)
    }

    /// Creates a heap for a block of `size` bytes and returns the free block spanning it.
    fn grow(&mut self, size: usize, alignment: usize, queue: QueueId) -> Result<BlockId, AllocError> {
        let heap_size = size
            .checked_next_multiple_of(self.request_size_step)
            .ok_or(MemoryError::TooLarge(size))?;
        let alignment = alignment.max(self.size_step);
        let heap = match self.resource.create_heap(heap_size, alignment) {
            Ok(heap) => heap,
            Err(err) if err.kind() == ErrorKind::OutOfMemory => {
                log::warn!("{err}; waiting for pending releases and retrying");
                self.flush();
                if let Some(id) = self.find_free(queue, size, alignment) {
                    return Ok(id);
                }
                self.trim();
                self.resource.create_heap(heap_size, alignment)?
            }
            Err(err) => return Err(err.into()),
        };

        let heap_id = HeapId(self.next_id());
        let block_id = BlockId(self.next_id());
        let heap_size = heap.size();
        log::debug!("create heap {heap_id} of {heap_size} bytes");

        self.heaps.insert(
            heap_id,
            Heap {
                inner: heap,
                alignment,
            },
        );
        self.blocks.insert(
            block_id,
            Block {
                heap: heap_id,
                offset: 0,
                size: heap_size,
                queue,
                occupied: false,
                prev: None,
                next: None,
            },
        );
        self.index(block_id);
        Ok(block_id)
    }

    fn block(&self, id: BlockId) -> Block {
        match self.blocks.get(&id) {
            Some(&block) => block,
            None => unreachable!("block {id} does not exist"),
        }
    }

    fn block_mut(&mut self, id: BlockId) -> &mut Block {
        match self.blocks.get_mut(&id) {
            Some(block) => block,
            None => unreachable!("block {id} does not exist"),
        }
    }

    /// Adds a free block to the free index.
    fn index(&mut self, id: BlockId) {
        let block = self.block(id);
        self.free
            .entry(block.queue)
            .or_default()
            .insert((block.size, id));
    }

    /// Removes a block from the free index, if present.
    fn unindex(&mut self, id: BlockId) {
        let block = self.block(id);
        if let Some(free) = self.free.get_mut(&block.queue) {
            free.remove(&(block.size, id));
            if free.is_empty() {
                self.free.remove(&block.queue);
            }
        }
    }

    /// Marks a free block occupied, splitting off the tail past `size` as a new free block.
    fn take(&mut self, id: BlockId, size: usize) -> Block {
        self.unindex(id);
        let block = self.block(id);
        if block.size - size >= self.size_step {
            let tail_id = BlockId(self.next_id());
            let tail = Block {
                offset: block.offset + size,
                size: block.size - size,
                prev: Some(id),
                ..block
            };
            if let Some(next) = block.next {
                self.block_mut(next).prev = Some(tail_id);
            }
            self.blocks.insert(tail_id, tail);
            self.index(tail_id);

            let block = self.block_mut(id);
            block.size = size;
            block.next = Some(tail_id);
        }

        let block = self.block_mut(id);
        block.occupied = true;
        *block
    }

    fn mergeable(&self, x: BlockId, y: BlockId) -> bool {
        let (x, y) = (self.block(x), self.block(y));
        !x.occupied && !y.occupied && x.queue == y.queue && x.heap == y.heap
    }

    /// Merges `next` into `id`. `next` must directly follow `id`.
    fn merge(&mut self, id: BlockId, next: BlockId) {
        self.unindex(id);
        self.unindex(next);
        let Some(removed) = self.blocks.remove(&next) else {
            return;
        };
        if let Some(after) = removed.next {
            self.block_mut(after).prev = Some(id);
        }
        let block = self.block_mut(id);
        block.size += removed.size;
        block.next = removed.next;
    }

    /// Marks a block free and merges it with free neighbours of the same queue.
    fn release(&mut self, id: BlockId) {
        self.block_mut(id).occupied = false;

        if let Some(next) = self.block(id).next {
            if self.mergeable(id, next) {
                self.merge(id, next);
            }
        }

        let id = match self.block(id).prev {
            Some(prev) if self.mergeable(prev, id) => {
                self.merge(prev, id);
                prev
            }
            _ => id,
        };

        self.index(id);
    }

    /// Handles a block returned by a dropped buffer.
    fn recycle(&mut self, id: BlockId, events: Vec<Box<dyn Event>>) {
        match events.is_empty() {
            true => {
                log::trace!("recycle block {id}");
                self.release(id);
            }
            false => {
                log::trace!("defer block {id} on {} queues", events.len());
                self.pending.push(Pending { block: id, events });
            }
        }
    }

    /// Takes back blocks of dropped buffers, then frees pending blocks whose events have all
    /// been signaled.
    pub fn collect(&mut self) {
        let returned = self.receiver.try_iter().collect_vec();
        for Returned { block, events } in returned {
            self.recycle(block, events);
        }

        let (ready, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|pending| pending.events.iter().all(|event| event.is_signaled()));
        self.pending = pending;
        for Pending { block, .. } in ready {
            log::trace!("release deferred block {block}");
            self.release(block);
        }
    }

    /// Blocks until every pending release has completed, then frees those blocks.
    pub fn flush(&mut self) {
        self.collect();
        for event in self.pending.iter().flat_map(|pending| &pending.events) {
            event.wait();
        }
        self.collect();
    }

    /// Releases every heap that is one free block. Returns the number of bytes released.
    pub fn trim(&mut self) -> usize {
        let unused = self
            .blocks
            .iter()
            .filter(|(_, block)| !block.occupied && block.prev.is_none() && block.next.is_none())
            .map(|(&id, _)| id)
            .collect_vec();

        let mut released = 0;
        for id in unused {
            self.unindex(id);
            let Some(block) = self.blocks.remove(&id) else {
                continue;
            };
            if self.heaps.remove(&block.heap).is_some() {
                log::debug!("release heap {} of {} bytes", block.heap, block.size);
                released += block.size;
            }
        }
        released
    }

    /// Snapshots of all blocks, ordered by heap and offset.
    pub fn blocks(&self) -> Vec<BlockInfo> {
        self.blocks
            .values()
            .map(|block| BlockInfo {
                heap: block.heap,
                offset: block.offset,
                size: block.size,
                queue: block.queue,
                occupied: block.occupied,
            })
            .sorted_by_key(|block| (block.heap, block.offset))
            .collect()
    }

    /// Snapshots of free blocks, ordered by heap and offset.
    pub fn free_blocks(&self) -> Vec<BlockInfo> {
        self.blocks()
            .into_iter()
            .filter(|block| !block.occupied)
            .collect()
    }

    pub fn stats(&self) -> AllocatorStats {
        let pending = self.pending.len();
        let heaps = self.heaps.len();
        let heap_bytes = self.heaps.values().map(|heap| heap.inner.size()).sum();
        self.blocks.values().fold(
            AllocatorStats {
                heaps,
                heap_bytes,
                pending,
                ..Default::default()
            },
            |mut stats, block| {
                match block.occupied {
                    true => {
                        stats.occupied_blocks += 1;
                        stats.occupied_bytes += block.size;
                    }
                    false => {
                        stats.free_blocks += 1;
                        stats.free_bytes += block.size;
                    }
                }
                stats
            },
        )
    }

    /// Prints the allocator's blocks in a human-readable format.
    pub fn print_pretty(&self) -> String {
        self.blocks()
            .into_iter()
            .map(|block| {
                let state = match block.occupied {
                    true => "occupied",
                    false => "free",
                };
                let end = block.offset + block.size;
                format!(
                    "heap {}\t{}..{}\t{state}\t{}",
                    block.heap, block.offset, end, block.queue
                )
            })
            .join("\n")
    }
}

impl<R: MemoryResource> std::fmt::Debug for CachingAllocator<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingAllocator")
            .field("size_step", &self.size_step)
            .field("request_size_step", &self.request_size_step)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<R: MemoryResource> std::fmt::Display for CachingAllocator<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.print_pretty())
    }
}
