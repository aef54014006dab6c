//! Fixed-block memory pool.
//!
//! One contiguous arena is carved into `unit_number` units of `unit_size`
//! bytes at construction. Every unit sits on exactly one of two intrusive
//! doubly-linked lists, "freed" or "allocated", threaded through a header
//! table that runs parallel to the arena. Both `malloc` and `free` are O(1)
//! relinks; requests the pool cannot serve go to the general allocator.
//!
//! The pool does no locking. All mutation takes `&mut self`; share it across
//! threads only behind a lock of the caller's choosing.

use crate::config::PoolConfig;
use crate::error::{ConkitError, Result};
use crate::memory::debug::{MemoryCategory, MemoryTracker, MEMORY_TRACKER};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Per-unit header: links into whichever list currently holds the unit.
#[derive(Debug, Clone, Copy, Default)]
struct UnitHeader {
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum List {
    Freed,
    Allocated,
}

/// Memory handed out by [`MemoryPool::malloc`].
///
/// A block is move-only and consumed by [`MemoryPool::free`], so it cannot be
/// freed twice. Unit blocks address the arena of the pool that produced them;
/// read and write them through that pool. A unit block dropped without
/// `free` stays allocated in its pool for the pool's lifetime.
#[derive(Debug)]
#[must_use = "a pool unit that is dropped without `free` is never reused"]
pub struct Block {
    kind: BlockKind,
}

#[derive(Debug)]
enum BlockKind {
    Unit { pool: u64, index: usize, len: usize },
    Heap(HeapBytes),
}

/// Fallback allocation; reports its bytes back to the tracker when dropped.
#[derive(Debug)]
struct HeapBytes {
    bytes: Box<[u8]>,
    tracker: &'static MemoryTracker,
}

impl Drop for HeapBytes {
    fn drop(&mut self) {
        self.tracker
            .record_bytes(MemoryCategory::PoolFallback, -(self.bytes.len() as i64));
    }
}

impl Block {
    /// Requested size in bytes.
    pub fn len(&self) -> usize {
        match &self.kind {
            BlockKind::Unit { len, .. } => *len,
            BlockKind::Heap(heap) => heap.bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if the block lives in a pool arena rather than on the heap.
    pub fn is_pooled(&self) -> bool {
        matches!(self.kind, BlockKind::Unit { .. })
    }
}

/// Statistics for pool monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub unit_number: usize,
    pub unit_size: usize,
    pub units_in_use: usize,
    pub units_free: usize,
    pub hits: u64,
    pub fallbacks: u64,
}

impl PoolStats {
    /// Percentage of allocations served from the arena
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.fallbacks == 0 {
            0.0
        } else {
            (self.hits as f64) / ((self.hits + self.fallbacks) as f64) * 100.0
        }
    }
}

/// Single-threaded fixed-size unit allocator.
#[derive(Debug)]
pub struct MemoryPool {
    id: u64,
    unit_size: usize,
    arena: Box<[u8]>,
    headers: Box<[UnitHeader]>,
    freed: Option<usize>,
    allocated: Option<usize>,
    units_in_use: usize,
    hits: u64,
    fallbacks: u64,
    tracker: &'static MemoryTracker,
}

impl MemoryPool {
    /// Preallocate `unit_number` units of `unit_size` bytes each.
    pub fn new(unit_number: usize, unit_size: usize) -> Result<Self> {
        Self::from_config(&PoolConfig {
            unit_number,
            unit_size,
        })
    }

    pub fn from_config(config: &PoolConfig) -> Result<Self> {
        Self::with_tracker(config, &MEMORY_TRACKER)
    }

    /// Like [`MemoryPool::from_config`], reporting arena and fallback bytes
    /// to `tracker` instead of the global [`MEMORY_TRACKER`].
    pub fn with_tracker(config: &PoolConfig, tracker: &'static MemoryTracker) -> Result<Self> {
        config.validate()?;
        let arena_bytes = config.arena_bytes().ok_or_else(|| {
            ConkitError::InvalidConfig("pool arena size overflows usize".to_string())
        })?;

        let mut pool = Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            unit_size: config.unit_size,
            arena: vec![0u8; arena_bytes].into_boxed_slice(),
            headers: vec![UnitHeader::default(); config.unit_number].into_boxed_slice(),
            freed: None,
            allocated: None,
            units_in_use: 0,
            hits: 0,
            fallbacks: 0,
            tracker,
        };
        for index in 0..config.unit_number {
            pool.push_front(List::Freed, index);
        }

        tracker.record_alloc(MemoryCategory::PoolArena, 1);
        tracker.record_bytes(MemoryCategory::PoolArena, arena_bytes as i64);
        debug!(
            pool = pool.id,
            unit_number = config.unit_number,
            unit_size = config.unit_size,
            "Memory pool created"
        );
        Ok(pool)
    }

    pub fn unit_size(&self) -> usize {
        self.unit_size
    }

    pub fn unit_number(&self) -> usize {
        self.headers.len()
    }

    /// Hand out a unit, or a heap block when `requested_size` exceeds the
    /// unit size or every unit is in use.
    #[must_use = "the block must be handed back with `free`"]
    pub fn malloc(&mut self, requested_size: usize) -> Block {
        if requested_size > self.unit_size {
            debug!(
                pool = self.id,
                requested_size,
                unit_size = self.unit_size,
                "Request exceeds unit size, using general allocator"
            );
            return self.fallback(requested_size);
        }

        let Some(index) = self.freed else {
            debug!(pool = self.id, requested_size, "Pool exhausted, using general allocator");
            return self.fallback(requested_size);
        };

        self.unlink(List::Freed, index);
        self.push_front(List::Allocated, index);
        self.units_in_use += 1;
        self.hits += 1;
        trace!(pool = self.id, index, "Unit allocated");

        Block {
            kind: BlockKind::Unit {
                pool: self.id,
                index,
                len: requested_size,
            },
        }
    }

    /// Return a block. Units of this pool go back on the free list; anything
    /// else is released through the general allocator.
    pub fn free(&mut self, block: Block) {
        match block.kind {
            BlockKind::Unit { pool, index, .. } if self.owns(pool, index) => {
                self.unlink(List::Allocated, index);
                self.push_front(List::Freed, index);
                self.units_in_use -= 1;
                trace!(pool = self.id, index, "Unit freed");
            }
            BlockKind::Unit { pool, index, .. } => {
                warn!(
                    pool = self.id,
                    owner = pool,
                    index,
                    "Block does not belong to this pool, dropping it"
                );
            }
            BlockKind::Heap(heap) => drop(heap),
        }
    }

    /// Bytes of `block`, or `None` for a unit of another pool.
    pub fn bytes<'a>(&'a self, block: &'a Block) -> Option<&'a [u8]> {
        match &block.kind {
            BlockKind::Unit { pool, index, len } if self.owns(*pool, *index) => {
                let start = index * self.unit_size;
                Some(&self.arena[start..start + len])
            }
            BlockKind::Unit { .. } => None,
            BlockKind::Heap(heap) => Some(&heap.bytes[..]),
        }
    }

    /// Mutable bytes of `block`, or `None` for a unit of another pool.
    pub fn bytes_mut<'a>(&'a mut self, block: &'a mut Block) -> Option<&'a mut [u8]> {
        match &mut block.kind {
            BlockKind::Unit { pool, index, len } if self.owns(*pool, *index) => {
                let start = *index * self.unit_size;
                Some(&mut self.arena[start..start + *len])
            }
            BlockKind::Unit { .. } => None,
            BlockKind::Heap(heap) => Some(&mut heap.bytes[..]),
        }
    }

    /// Start address of `block`, or `None` for a unit of another pool.
    pub fn as_ptr(&self, block: &Block) -> Option<*const u8> {
        self.bytes(block).map(<[u8]>::as_ptr)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            unit_number: self.unit_number(),
            unit_size: self.unit_size,
            units_in_use: self.units_in_use,
            units_free: self.unit_number() - self.units_in_use,
            hits: self.hits,
            fallbacks: self.fallbacks,
        }
    }

    fn fallback(&mut self, requested_size: usize) -> Block {
        self.fallbacks += 1;
        self.tracker.record_alloc(MemoryCategory::PoolFallback, 1);
        self.tracker
            .record_bytes(MemoryCategory::PoolFallback, requested_size as i64);
        Block {
            kind: BlockKind::Heap(HeapBytes {
                bytes: vec![0u8; requested_size].into_boxed_slice(),
                tracker: self.tracker,
            }),
        }
    }

    #[inline]
    fn owns(&self, pool: u64, index: usize) -> bool {
        pool == self.id && index < self.headers.len()
    }

    #[inline]
    fn head_mut(&mut self, list: List) -> &mut Option<usize> {
        match list {
            List::Freed => &mut self.freed,
            List::Allocated => &mut self.allocated,
        }
    }

    fn push_front(&mut self, list: List, index: usize) {
        let old_head = *self.head_mut(list);
        self.headers[index] = UnitHeader {
            prev: None,
            next: old_head,
        };
        if let Some(head) = old_head {
            self.headers[head].prev = Some(index);
        }
        *self.head_mut(list) = Some(index);
    }

    fn unlink(&mut self, list: List, index: usize) {
        let UnitHeader { prev, next } = self.headers[index];
        match prev {
            Some(prev) => self.headers[prev].next = next,
            None => *self.head_mut(list) = next,
        }
        if let Some(next) = next {
            self.headers[next].prev = prev;
        }
        self.headers[index] = UnitHeader::default();
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        self.tracker
            .record_bytes(MemoryCategory::PoolArena, -(self.arena.len() as i64));
        if self.units_in_use > 0 {
            debug!(
                pool = self.id,
                outstanding = self.units_in_use,
                "Memory pool dropped with units still allocated"
            );
        }
    }
}
