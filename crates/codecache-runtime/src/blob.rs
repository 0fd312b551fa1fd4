use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use codecache_core::{BlobHandle, BlobKind, CodeHeapKind};
use serde::{Deserialize, Serialize};

/// Identifier of a class a compiled method was optimized against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KlassId(pub u64);

impl fmt::Display for KlassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "klass#{}", self.0)
    }
}

/// Everything the compiler tells the cache about a blob when committing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobSpec {
    pub name: String,
    pub kind: BlobKind,
    pub dependencies: Vec<KlassId>,
}

impl BlobSpec {
    pub fn method(name: impl Into<String>, dependencies: Vec<KlassId>) -> Self {
        Self {
            name: name.into(),
            kind: BlobKind::Method {
                has_dependencies: !dependencies.is_empty(),
            },
            dependencies,
        }
    }

    pub fn adapter(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: BlobKind::Adapter,
            dependencies: Vec::new(),
        }
    }

    pub fn stub(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: BlobKind::Stub,
            dependencies: Vec::new(),
        }
    }
}

/// Reclamation progress of a committed blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlobState {
    Live = 0,
    MarkedForUnload = 1,
    /// Unlinked; memory is released after the next handshake.
    Reclaimable = 2,
    Freed = 3,
}

impl BlobState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Live,
            1 => Self::MarkedForUnload,
            2 => Self::Reclaimable,
            _ => Self::Freed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeoptStatus {
    NotMarked = 0,
    Marked = 1,
    NotEntrant = 2,
}

impl DeoptStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NotMarked,
            1 => Self::Marked,
            _ => Self::NotEntrant,
        }
    }
}

/// Metadata of a committed blob.
///
/// Shared as `Arc<CodeBlob>` between the cache's index and lock-free readers; all
/// mutable state is atomic.
pub struct CodeBlob {
    handle: BlobHandle,
    heap_kind: CodeHeapKind,
    kind: BlobKind,
    name: String,
    address: usize,
    size: usize,
    capacity: usize,
    code_size: usize,
    dependencies: Vec<KlassId>,
    state: AtomicU8,
    deopt: AtomicU8,
    gc_epoch: AtomicU64,
    /// Bit 0: unloading verdict. Bits 1-2: unloading cycle the verdict belongs to.
    unloading_state: AtomicU8,
}

pub(crate) struct BlobPlacement {
    pub handle: BlobHandle,
    pub heap_kind: CodeHeapKind,
    pub address: usize,
    pub size: usize,
    pub capacity: usize,
    pub code_size: usize,
}

impl CodeBlob {
    pub(crate) fn new(placement: BlobPlacement, spec: BlobSpec, gc_epoch: u64) -> Self {
        Self {
            handle: placement.handle,
            heap_kind: placement.heap_kind,
            kind: spec.kind,
            name: spec.name,
            address: placement.address,
            size: placement.size,
            capacity: placement.capacity,
            code_size: placement.code_size,
            dependencies: spec.dependencies,
            state: AtomicU8::new(BlobState::Live as u8),
            deopt: AtomicU8::new(DeoptStatus::NotMarked as u8),
            gc_epoch: AtomicU64::new(gc_epoch),
            unloading_state: AtomicU8::new(0),
        }
    }

    pub fn handle(&self) -> BlobHandle {
        self.handle
    }

    pub fn heap_kind(&self) -> CodeHeapKind {
        self.heap_kind
    }

    pub fn kind(&self) -> BlobKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn address(&self) -> usize {
        self.address
    }

    /// Bytes requested at allocation.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes actually reserved in the heap (segment rounded).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes of machine code installed before commit.
    pub fn code_size(&self) -> usize {
        self.code_size
    }

    #[inline]
    pub fn contains(&self, address: usize) -> bool {
        address >= self.address && address < self.address + self.capacity
    }

    pub fn dependencies(&self) -> &[KlassId] {
        &self.dependencies
    }

    pub fn depends_on(&self, klass: KlassId) -> bool {
        self.dependencies.contains(&klass)
    }

    pub fn state(&self) -> BlobState {
        BlobState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn transition(&self, from: BlobState, to: BlobState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn set_state(&self, to: BlobState) -> BlobState {
        BlobState::from_u8(self.state.swap(to as u8, Ordering::AcqRel))
    }

    pub fn deopt_status(&self) -> DeoptStatus {
        DeoptStatus::from_u8(self.deopt.load(Ordering::Acquire))
    }

    pub fn is_not_entrant(&self) -> bool {
        self.deopt_status() == DeoptStatus::NotEntrant
    }

    pub(crate) fn mark_for_deoptimization(&self) -> bool {
        self.deopt
            .compare_exchange(
                DeoptStatus::NotMarked as u8,
                DeoptStatus::Marked as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn make_not_entrant(&self) -> bool {
        self.deopt
            .compare_exchange(
                DeoptStatus::Marked as u8,
                DeoptStatus::NotEntrant as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// GC epoch in which this blob was last seen on a stack (or committed).
    pub fn gc_epoch(&self) -> u64 {
        self.gc_epoch.load(Ordering::Acquire)
    }

    pub(crate) fn stamp_epoch(&self, epoch: u64) {
        self.gc_epoch.store(epoch, Ordering::Release);
    }

    pub(crate) fn unloading_state(&self) -> u8 {
        self.unloading_state.load(Ordering::Acquire)
    }

    pub(crate) fn exchange_unloading_state(&self, current: u8, new: u8) -> Result<u8, u8> {
        self.unloading_state
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }
}

impl fmt::Debug for CodeBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeBlob")
            .field("handle", &self.handle)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("address", &format_args!("{:#x}", self.address))
            .field("size", &self.size)
            .field("state", &self.state())
            .field("deopt", &self.deopt_status())
            .finish()
    }
}
