use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::types::{BlobKind, CodeHeapKind, HeapId};
use crate::units::align_up;

/// Point-in-time usage of one heap, used by summaries and metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapStats {
    pub kind: CodeHeapKind,
    pub name: String,
    pub low_boundary: usize,
    pub high_boundary: usize,
    pub committed: usize,
    pub size: usize,
    pub used: usize,
    pub max_used: usize,
    pub free: usize,
    pub blob_count: usize,
    pub method_count: usize,
    pub adapter_count: usize,
    pub full_count: u32,
}

/// Shared, lock-free view of a code heap.
///
/// Bounds are fixed at creation; capacity and counters are atomics so that observers
/// (metrics pollers, stack walkers) can read them without the cache lock. All mutation
/// goes through the heap's [`HeapAllocator`], which lives behind that lock.
#[derive(Debug)]
pub struct CodeHeap {
    id: HeapId,
    kind: CodeHeapKind,
    low: usize,
    reserved: usize,
    segment_shift: u32,
    committed: AtomicUsize,
    allocated_segments: AtomicUsize,
    max_allocated_segments: AtomicUsize,
    blob_count: AtomicUsize,
    method_count: AtomicUsize,
    adapter_count: AtomicUsize,
    full_count: AtomicU32,
}

impl CodeHeap {
    pub fn id(&self) -> HeapId {
        self.id
    }

    pub fn kind(&self) -> CodeHeapKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.heap_name()
    }

    pub fn segment_size(&self) -> usize {
        1 << self.segment_shift
    }

    #[inline]
    pub fn low_boundary(&self) -> usize {
        self.low
    }

    #[inline]
    pub fn high_boundary(&self) -> usize {
        self.low + self.reserved
    }

    /// End of the committed prefix. Pairs with the release store in `expand_by`.
    #[inline]
    pub fn high(&self) -> usize {
        self.low + self.committed.load(Ordering::Acquire)
    }

    /// Whether `address` falls inside the committed part of this heap.
    #[inline]
    pub fn contains(&self, address: usize) -> bool {
        address >= self.low && address < self.high()
    }

    pub fn max_capacity(&self) -> usize {
        self.reserved
    }

    pub fn capacity(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    pub fn allocated_capacity(&self) -> usize {
        self.allocated_segments.load(Ordering::Relaxed) << self.segment_shift
    }

    pub fn unallocated_capacity(&self) -> usize {
        self.max_capacity() - self.allocated_capacity()
    }

    pub fn max_allocated_capacity(&self) -> usize {
        self.max_allocated_segments.load(Ordering::Relaxed) << self.segment_shift
    }

    pub fn blob_count(&self) -> usize {
        self.blob_count.load(Ordering::Relaxed)
    }

    pub fn method_count(&self) -> usize {
        self.method_count.load(Ordering::Relaxed)
    }

    pub fn adapter_count(&self) -> usize {
        self.adapter_count.load(Ordering::Relaxed)
    }

    pub fn full_count(&self) -> u32 {
        self.full_count.load(Ordering::Relaxed)
    }

    /// Bump the exhaustion counter and return the new value.
    pub fn report_full(&self) -> u32 {
        self.full_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Account for a blob becoming observable.
    pub fn record_commit(&self, kind: BlobKind) {
        match kind {
            BlobKind::Method { .. } => {
                self.method_count.fetch_add(1, Ordering::Relaxed);
            }
            BlobKind::Adapter => {
                self.adapter_count.fetch_add(1, Ordering::Relaxed);
            }
            BlobKind::Stub => {}
        }
    }

    /// Undo [`record_commit`](Self::record_commit) for a blob being freed.
    pub fn record_free(&self, kind: BlobKind) {
        let counter = match kind {
            BlobKind::Method { .. } => &self.method_count,
            BlobKind::Adapter => &self.adapter_count,
            BlobKind::Stub => return,
        };
        let previous = counter.fetch_sub(1, Ordering::Relaxed);
        assert!(previous > 0, "{} count underflow in {}", kind.label(), self.name());
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            kind: self.kind,
            name: self.name().to_string(),
            low_boundary: self.low_boundary(),
            high_boundary: self.high_boundary(),
            committed: self.capacity(),
            size: self.max_capacity(),
            used: self.allocated_capacity(),
            max_used: self.max_allocated_capacity(),
            free: self.unallocated_capacity(),
            blob_count: self.blob_count(),
            method_count: self.method_count(),
            adapter_count: self.adapter_count(),
            full_count: self.full_count(),
        }
    }
}

/// A block handed out by a heap, in bytes relative to the heap's low boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapBlock {
    pub offset: usize,
    pub size: usize,
}

/// Settings a heap allocator is created with.
#[derive(Debug, Clone, Copy)]
pub struct HeapGeometry {
    pub segment_size: usize,
    pub min_block_segments: usize,
    pub page_size: usize,
    pub initial_commit: usize,
}

/// The mutable half of a code heap: segment free list and committed prefix.
///
/// Owned by the cache-wide lock; every `&mut self` method is therefore only reachable
/// while that lock is held.
#[derive(Debug)]
pub struct HeapAllocator {
    heap: Arc<CodeHeap>,
    /// Free blocks keyed by first segment, values are lengths in segments.
    free: BTreeMap<usize, usize>,
    /// Allocated blocks keyed by first segment.
    used: BTreeMap<usize, usize>,
    next_segment: usize,
    committed_segments: usize,
    reserved_segments: usize,
    min_block_segments: usize,
    commit_granularity: usize,
}

impl HeapAllocator {
    /// Create the heap `[low, low + reserved)` and commit its initial prefix.
    ///
    /// `reserved` must be a multiple of both the page and segment size.
    pub fn new(
        id: HeapId,
        kind: CodeHeapKind,
        low: usize,
        reserved: usize,
        geometry: HeapGeometry,
    ) -> Self {
        assert!(geometry.segment_size.is_power_of_two());
        let segment_shift = geometry.segment_size.trailing_zeros();
        let commit_granularity = geometry.page_size.max(geometry.segment_size);
        assert_eq!(reserved % commit_granularity, 0, "unaligned heap size");

        let initial =
            align_up(geometry.initial_commit.min(reserved), commit_granularity).min(reserved);
        let heap = Arc::new(CodeHeap {
            id,
            kind,
            low,
            reserved,
            segment_shift,
            committed: AtomicUsize::new(initial),
            allocated_segments: AtomicUsize::new(0),
            max_allocated_segments: AtomicUsize::new(0),
            blob_count: AtomicUsize::new(0),
            method_count: AtomicUsize::new(0),
            adapter_count: AtomicUsize::new(0),
            full_count: AtomicU32::new(0),
        });
        debug!(
            "{}: reserved {}K, committed {}K at {:#x}",
            kind.heap_name(),
            reserved / 1024,
            initial / 1024,
            low
        );

        Self {
            heap,
            free: BTreeMap::new(),
            used: BTreeMap::new(),
            next_segment: 0,
            committed_segments: initial >> segment_shift,
            reserved_segments: reserved >> segment_shift,
            min_block_segments: geometry.min_block_segments.max(1),
            commit_granularity,
        }
    }

    pub fn heap(&self) -> &Arc<CodeHeap> {
        &self.heap
    }

    #[inline]
    fn shift(&self) -> u32 {
        self.heap.segment_shift
    }

    /// Segments needed for `bytes`, or `None` when the request cannot be represented.
    fn segments_for(&self, bytes: usize) -> Option<usize> {
        let rounded = bytes.checked_add(self.heap.segment_size() - 1)?;
        Some((rounded >> self.shift()).max(self.min_block_segments))
    }

    /// Allocate a block of at least `bytes` from the free list or the committed tail.
    pub fn allocate(&mut self, bytes: usize) -> Option<HeapBlock> {
        debug_assert!(bytes > 0);
        let wanted = self.segments_for(bytes)?;
        if wanted > self.reserved_segments {
            return None;
        }

        let (start, length) = match self.search_free_list(wanted) {
            Some(found) => found,
            None => {
                if wanted > self.committed_segments - self.next_segment {
                    return None;
                }
                let start = self.next_segment;
                self.next_segment += wanted;
                (start, wanted)
            }
        };

        self.used.insert(start, length);
        let allocated = self.heap.allocated_segments.fetch_add(length, Ordering::Relaxed) + length;
        self.heap
            .max_allocated_segments
            .fetch_max(allocated, Ordering::Relaxed);
        self.heap.blob_count.fetch_add(1, Ordering::Relaxed);

        trace!("{}: allocated {} segments at {}", self.heap.name(), length, start);
        Some(HeapBlock {
            offset: start << self.shift(),
            size: length << self.shift(),
        })
    }

    /// First fit. A remainder smaller than the minimum block is handed out with the block.
    fn search_free_list(&mut self, wanted: usize) -> Option<(usize, usize)> {
        let (&start, &length) = self.free.iter().find(|(_, &len)| len >= wanted)?;
        self.free.remove(&start);
        if length - wanted < self.min_block_segments {
            return Some((start, length));
        }
        self.free.insert(start + wanted, length - wanted);
        Some((start, wanted))
    }

    /// Return the block starting at `offset` to the free list; yields its size in bytes.
    ///
    /// Panics if no block starts there, which means a double free or a stale handle.
    pub fn deallocate(&mut self, offset: usize) -> usize {
        let start = offset >> self.shift();
        let length = match self.used.remove(&start) {
            Some(length) => length,
            None => panic!(
                "{}: free of unallocated block at offset {:#x}",
                self.heap.name(),
                offset
            ),
        };
        self.add_to_free_list(start, length);
        self.heap.allocated_segments.fetch_sub(length, Ordering::Relaxed);
        self.heap.blob_count.fetch_sub(1, Ordering::Relaxed);
        length << self.shift()
    }

    fn add_to_free_list(&mut self, mut start: usize, mut length: usize) {
        if let Some((&prev, &prev_len)) = self.free.range(..start).next_back() {
            if prev + prev_len == start {
                self.free.remove(&prev);
                start = prev;
                length += prev_len;
            }
        }
        if let Some(next_len) = self.free.remove(&(start + length)) {
            length += next_len;
        }
        self.free.insert(start, length);
    }

    /// Grow the committed prefix by at least `bytes`, up to the reservation.
    ///
    /// Returns false once the heap is fully committed.
    pub fn expand_by(&mut self, bytes: usize) -> bool {
        if self.committed_segments >= self.reserved_segments {
            return false;
        }
        let committed = self.committed_segments << self.shift();
        // the reservation is granule-aligned, so clamping first keeps the rounding in range
        let target = align_up(
            committed.saturating_add(bytes).min(self.heap.reserved),
            self.commit_granularity,
        );
        self.committed_segments = target >> self.shift();
        // Observers read the committed size without the lock.
        self.heap.committed.store(target, Ordering::Release);
        debug!(
            "{}: expanded committed size {}K -> {}K",
            self.heap.name(),
            committed / 1024,
            target / 1024
        );
        true
    }

    /// Size in bytes of the allocated block starting at `offset`.
    pub fn block_size(&self, offset: usize) -> Option<usize> {
        self.used
            .get(&(offset >> self.shift()))
            .map(|len| len << self.shift())
    }

    pub fn free_block_count(&self) -> usize {
        self.free.len()
    }

    /// Bytes sitting on the free list (excludes the never-used committed tail).
    pub fn free_list_bytes(&self) -> usize {
        self.free.values().sum::<usize>() << self.shift()
    }
}
