use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use codecache_core::{
    initialize_heaps, BlobHandle, CodeCacheConfig, CodeCacheError, CodeHeap, CodeHeapKind,
    HeapAllocator, HeapGeometry, HeapId, HeapLayout, ReservedRegion, Result,
};
use crossbeam_skiplist::SkipMap;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, trace};

use crate::blob::{BlobPlacement, BlobSpec, BlobState, CodeBlob};
use crate::exhaustion::ExhaustionState;
use crate::traits::{Clock, CompileBroker, Detached, GcRequester, MonotonicClock};
use crate::unloading::EpochState;

/// The code cache: one reserved region split into heaps, plus the index of committed
/// blobs.
///
/// Lookups (`contains`, `find_blob`, iteration, statistics) never block. Everything that
/// changes heap contents goes through [`CodeCache::lock`].
pub struct CodeCache {
    pub(crate) config: CodeCacheConfig,
    layout: HeapLayout,
    region: ReservedRegion,
    /// Indexed by `HeapId`.
    heaps: Vec<Arc<CodeHeap>>,
    /// Heap ids sorted by kind, then address.
    sorted: Vec<HeapId>,
    /// Committed blobs keyed by start address.
    pub(crate) blobs: SkipMap<usize, Arc<CodeBlob>>,
    state: Mutex<CacheState>,
    pub(crate) epochs: EpochState,
    pub(crate) exhaustion: ExhaustionState,
    pub(crate) methods_with_dependencies: AtomicUsize,
    pub(crate) broker: Arc<dyn CompileBroker>,
    pub(crate) gc: Arc<dyn GcRequester>,
    pub(crate) clock: Arc<dyn Clock>,
}

struct CacheState {
    allocators: Vec<HeapAllocator>,
    /// Allocated but not yet committed.
    pending: HashMap<BlobHandle, PendingBlob>,
}

#[derive(Debug, Clone, Copy)]
struct PendingBlob {
    size: usize,
    capacity: usize,
    installed: usize,
}

pub struct CodeCacheBuilder {
    config: CodeCacheConfig,
    broker: Arc<dyn CompileBroker>,
    gc: Arc<dyn GcRequester>,
    clock: Arc<dyn Clock>,
}

impl CodeCacheBuilder {
    pub fn new(config: CodeCacheConfig) -> Self {
        Self {
            config,
            broker: Arc::new(Detached),
            gc: Arc::new(Detached),
            clock: Arc::new(MonotonicClock),
        }
    }

    pub fn compile_broker(mut self, broker: Arc<dyn CompileBroker>) -> Self {
        self.broker = broker;
        self
    }

    pub fn gc_requester(mut self, gc: Arc<dyn GcRequester>) -> Self {
        self.gc = gc;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Partition, reserve and create every heap.
    pub fn build(self) -> Result<CodeCache> {
        let config = self.config;
        config.validate()?;
        let layout = initialize_heaps(&config)?;
        let region = ReservedRegion::reserve(layout.reserved_size)?;

        let geometry = HeapGeometry {
            segment_size: config.segment_size,
            min_block_segments: config.min_block_segments,
            page_size: config.page_size,
            initial_commit: config.initial_commit_size,
        };
        let allocators: Vec<HeapAllocator> = layout
            .placements()
            .iter()
            .enumerate()
            .map(|(index, placement)| {
                HeapAllocator::new(
                    HeapId(index as u8),
                    placement.kind,
                    region.base() + placement.offset,
                    placement.size,
                    geometry,
                )
            })
            .collect();
        let heaps: Vec<Arc<CodeHeap>> = allocators.iter().map(|a| a.heap().clone()).collect();

        let mut sorted: Vec<HeapId> = heaps.iter().map(|h| h.id()).collect();
        sorted.sort_by_key(|id| {
            let heap = &heaps[id.0 as usize];
            (heap.kind(), heap.low_boundary())
        });

        for heap in &heaps {
            info!(
                "{}: size={}Kb bounds [{:#x}, {:#x})",
                heap.name(),
                heap.max_capacity() / 1024,
                heap.low_boundary(),
                heap.high_boundary()
            );
        }

        Ok(CodeCache {
            epochs: EpochState::new(&config),
            exhaustion: ExhaustionState::new(),
            config,
            layout,
            region,
            heaps,
            sorted,
            blobs: SkipMap::new(),
            state: Mutex::new(CacheState {
                allocators,
                pending: HashMap::new(),
            }),
            methods_with_dependencies: AtomicUsize::new(0),
            broker: self.broker,
            gc: self.gc,
            clock: self.clock,
        })
    }
}

impl CodeCache {
    /// Cache with no collaborators attached.
    pub fn new(config: CodeCacheConfig) -> Result<Self> {
        CodeCacheBuilder::new(config).build()
    }

    pub fn builder(config: CodeCacheConfig) -> CodeCacheBuilder {
        CodeCacheBuilder::new(config)
    }

    pub fn config(&self) -> &CodeCacheConfig {
        &self.config
    }

    pub fn layout(&self) -> &HeapLayout {
        &self.layout
    }

    /// Take the cache lock. Not reentrant.
    pub fn lock(&self) -> CacheGuard<'_> {
        CacheGuard {
            cache: self,
            state: self.state.lock(),
        }
    }

    /// Heaps sorted by kind, then address.
    pub fn heaps(&self) -> impl Iterator<Item = &Arc<CodeHeap>> + '_ {
        self.sorted.iter().map(move |id| &self.heaps[id.0 as usize])
    }

    pub fn heap(&self, id: HeapId) -> Option<&Arc<CodeHeap>> {
        self.heaps.get(id.0 as usize)
    }

    /// Heaps that hold compiled methods.
    pub fn method_heaps(&self) -> impl Iterator<Item = &Arc<CodeHeap>> + '_ {
        self.heaps().filter(|h| h.kind().accepts_methods())
    }

    /// First heap serving allocations of `kind`.
    pub fn heap_for(&self, kind: CodeHeapKind) -> Option<&Arc<CodeHeap>> {
        self.heaps().find(|h| h.kind().accepts(kind))
    }

    /// Heap a method compiled at `tier` is allocated in.
    pub fn code_kind_for_tier(&self, tier: u8) -> CodeHeapKind {
        let kind = CodeHeapKind::for_tier(tier, self.layout.segmented);
        if self.heap_for(kind).is_none() {
            return CodeHeapKind::MethodNonProfiled;
        }
        kind
    }

    pub fn heap_containing(&self, address: usize) -> Option<&Arc<CodeHeap>> {
        self.heaps.iter().find(|h| h.contains(address))
    }

    /// Whether `address` lies inside any heap's committed range.
    pub fn contains(&self, address: usize) -> bool {
        self.heap_containing(address).is_some()
    }

    /// Committed blob covering `address`, if any.
    pub fn find_blob(&self, address: usize) -> Option<Arc<CodeBlob>> {
        let entry = self.blobs.range(..=address).next_back()?;
        let blob = entry.value();
        (blob.contains(address) && blob.state() != BlobState::Freed).then(|| blob.clone())
    }

    pub(crate) fn address_of(&self, handle: BlobHandle) -> Result<usize> {
        let heap = self
            .heap(handle.heap)
            .ok_or(CodeCacheError::UnknownBlob(handle))?;
        Ok(heap.low_boundary() + handle.offset())
    }

    /// Committed blob behind `handle`.
    pub fn blob(&self, handle: BlobHandle) -> Option<Arc<CodeBlob>> {
        let address = self.address_of(handle).ok()?;
        self.blobs.get(&address).map(|e| e.value().clone())
    }

    /// Committed blobs that have not been freed, in address order.
    pub fn blobs(&self) -> impl Iterator<Item = Arc<CodeBlob>> + '_ {
        self.blobs
            .iter()
            .map(|e| e.value().clone())
            .filter(|b| b.state() != BlobState::Freed)
    }

    pub fn methods(&self) -> impl Iterator<Item = Arc<CodeBlob>> + '_ {
        self.blobs().filter(|b| b.kind().is_method())
    }

    /// Copy of the machine code installed in `handle`. Takes the cache lock.
    pub fn copy_code(&self, handle: BlobHandle) -> Result<Vec<u8>> {
        let _state = self.state.lock();
        let blob = self
            .blob(handle)
            .ok_or(CodeCacheError::UnknownBlob(handle))?;
        // SAFETY: the blob is committed, so its code is no longer written, and it cannot be
        // freed or reused while the lock is held.
        let bytes = unsafe {
            self.region
                .read(blob.address() - self.region.base(), blob.code_size())
        };
        Ok(bytes)
    }

    pub fn max_capacity(&self) -> usize {
        self.heaps.iter().map(|h| h.max_capacity()).sum()
    }

    pub fn capacity(&self) -> usize {
        self.heaps.iter().map(|h| h.capacity()).sum()
    }

    pub fn allocated_capacity(&self) -> usize {
        self.heaps.iter().map(|h| h.allocated_capacity()).sum()
    }

    pub fn unallocated_capacity(&self) -> usize {
        self.heaps.iter().map(|h| h.unallocated_capacity()).sum()
    }

    pub fn blob_count(&self) -> usize {
        self.heaps.iter().map(|h| h.blob_count()).sum()
    }

    pub fn method_count(&self) -> usize {
        self.heaps.iter().map(|h| h.method_count()).sum()
    }

    pub fn adapter_count(&self) -> usize {
        self.heaps.iter().map(|h| h.adapter_count()).sum()
    }

    pub fn methods_with_dependencies(&self) -> usize {
        self.methods_with_dependencies.load(Ordering::Acquire)
    }
}

/// Exclusive access to the heaps. Every mutating operation lives here, so it cannot be
/// called without holding the cache lock.
pub struct CacheGuard<'a> {
    cache: &'a CodeCache,
    state: MutexGuard<'a, CacheState>,
}

impl<'a> CacheGuard<'a> {
    pub fn cache(&self) -> &'a CodeCache {
        self.cache
    }

    /// Allocate `size` bytes for code of `kind`.
    ///
    /// Tries the heap for `kind`, growing its committed part as needed, then walks the
    /// fallback chain. Exhaustion is reported (compilation stops) before returning
    /// [`CodeCacheError::CodeCacheFull`]. A request no heap could ever hold is refused with
    /// [`CodeCacheError::InvalidAllocationSize`] and leaves compilation alone.
    pub fn allocate(&mut self, size: usize, kind: CodeHeapKind) -> Result<BlobHandle> {
        let largest = self.cache.heaps.iter().map(|h| h.max_capacity()).max();
        if size == 0 || largest.map_or(true, |largest| size > largest) {
            return Err(CodeCacheError::InvalidAllocationSize(size));
        }
        self.cache.gc_on_allocation();

        let mut current = kind;
        let mut attempts = 0;
        loop {
            attempts += 1;
            debug_assert!(attempts <= 4, "fallback chain did not terminate");
            if let Some(id) = self.cache.heap_for(current).map(|h| h.id()) {
                if let Some(handle) = self.allocate_in(id, size) {
                    return Ok(handle);
                }
            }

            let next = if self.cache.layout.segmented {
                current.fallback(kind)
            } else {
                None
            };
            match next {
                Some(next) => {
                    debug!(
                        "{} exhausted for {} bytes, falling back to {}",
                        current, size, next
                    );
                    current = next;
                }
                None => break,
            }
        }

        let full = self.cache.heap_for(kind).map(|h| h.kind()).unwrap_or(kind);
        self.cache.report_full(full, false);
        Err(CodeCacheError::CodeCacheFull {
            kind: full,
            requested: size,
        })
    }

    fn allocate_in(&mut self, id: HeapId, size: usize) -> Option<BlobHandle> {
        let state = &mut *self.state;
        let allocator = &mut state.allocators[id.0 as usize];
        loop {
            if let Some(block) = allocator.allocate(size) {
                let handle = BlobHandle::new(id, block.offset);
                state.pending.insert(
                    handle,
                    PendingBlob {
                        size,
                        capacity: block.size,
                        installed: 0,
                    },
                );
                trace!("Allocated {} bytes at {}", size, handle);
                return Some(handle);
            }
            if !allocator.expand_by(self.cache.config.expansion_size) {
                return None;
            }
        }
    }

    /// Copy machine code into an allocated, not yet committed blob.
    pub fn install_code(&mut self, handle: BlobHandle, code: &[u8]) -> Result<()> {
        let address = self.cache.address_of(handle)?;
        let pending = self
            .state
            .pending
            .get_mut(&handle)
            .ok_or(CodeCacheError::UnknownBlob(handle))?;
        if code.len() > pending.capacity {
            return Err(CodeCacheError::BlobTooSmall {
                handle,
                capacity: pending.capacity,
                requested: code.len(),
            });
        }
        let region = &self.cache.region;
        // SAFETY: the block belongs to this uncommitted handle and the cache lock is held,
        // so nothing else reads or writes it.
        unsafe { region.write(address - region.base(), code) };
        pending.installed = code.len();
        Ok(())
    }

    /// Make an allocated blob visible to lookups, iteration and unloading.
    ///
    /// Panics if the blob was already committed.
    pub fn commit(&mut self, handle: BlobHandle, spec: BlobSpec) -> Result<Arc<CodeBlob>> {
        let address = self.cache.address_of(handle)?;
        let Some(pending) = self.state.pending.remove(&handle) else {
            assert!(
                !self.cache.blobs.contains_key(&address),
                "blob {} committed twice",
                handle
            );
            return Err(CodeCacheError::UnknownBlob(handle));
        };

        let heap = &self.cache.heaps[handle.heap.0 as usize];
        let kind = spec.kind;
        let blob = Arc::new(CodeBlob::new(
            BlobPlacement {
                handle,
                heap_kind: heap.kind(),
                address,
                size: pending.size,
                capacity: pending.capacity,
                code_size: pending.installed,
            },
            spec,
            self.cache.epochs.gc_epoch(),
        ));
        heap.record_commit(kind);
        if kind.has_dependencies() {
            self.cache
                .methods_with_dependencies
                .fetch_add(1, Ordering::AcqRel);
        }
        self.cache.blobs.insert(address, blob.clone());
        trace!("Committed {} {} at {:#x}", kind.label(), blob.name(), address);
        Ok(blob)
    }

    /// Return a blob's memory to its heap. Yields the number of bytes released.
    ///
    /// Committed blobs also drop out of the per-heap counters. Panics on double free.
    pub fn free(&mut self, handle: BlobHandle) -> Result<usize> {
        let address = self.cache.address_of(handle)?;
        if self.state.pending.remove(&handle).is_some() {
            return Ok(self.state.allocators[handle.heap.0 as usize].deallocate(handle.offset()));
        }
        match self.cache.blobs.get(&address).map(|e| e.value().clone()) {
            Some(blob) => Ok(self.free_blob(&blob)),
            None => panic!("free of unknown or already freed blob {}", handle),
        }
    }

    pub(crate) fn free_blob(&mut self, blob: &CodeBlob) -> usize {
        let previous = blob.set_state(BlobState::Freed);
        assert!(previous != BlobState::Freed, "double free of {}", blob.handle());

        self.cache.blobs.remove(&blob.address());
        let handle = blob.handle();
        let heap = &self.cache.heaps[handle.heap.0 as usize];
        heap.record_free(blob.kind());
        if blob.kind().has_dependencies() {
            self.cache
                .methods_with_dependencies
                .fetch_sub(1, Ordering::AcqRel);
        }
        self.state.allocators[handle.heap.0 as usize].deallocate(handle.offset())
    }
}
