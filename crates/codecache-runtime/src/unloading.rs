//! GC epochs, unloading verdicts and dependency-driven invalidation.
//!
//! The collector brackets every marking cycle with [`CodeCache::on_marking_cycle_start`]
//! and [`CodeCache::on_marking_cycle_finish`]. Blobs found on a thread stack during
//! marking are stamped with the current epoch; a method whose stamp falls far enough
//! behind the last completed cycle is cold. Reclamation is two-phase: unloading blobs
//! are first unlinked, and their memory is only released after a handshake guarantees
//! no thread still executes them.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use codecache_core::{BlobHandle, CodeCacheConfig};
use crossbeam_queue::SegQueue;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::aging::{AgingHeuristic, ColdGcCount};
use crate::blob::{BlobState, CodeBlob, KlassId};
use crate::cache::CodeCache;
use crate::traits::{Handshake, IsUnloadingBehaviour};

const INITIAL_GC_EPOCH: u64 = 2;

pub(crate) struct EpochState {
    gc_epoch: CachePadded<AtomicU64>,
    unloading_cycle: AtomicU8,
    cold_gc_count: AtomicU64,
    aging: Mutex<AgingHeuristic>,
    unlinked: SegQueue<Arc<CodeBlob>>,
}

impl EpochState {
    pub(crate) fn new(config: &CodeCacheConfig) -> Self {
        Self {
            gc_epoch: CachePadded::new(AtomicU64::new(INITIAL_GC_EPOCH)),
            unloading_cycle: AtomicU8::new(1),
            cold_gc_count: AtomicU64::new(ColdGcCount::Unbounded.to_bits()),
            aging: Mutex::new(AgingHeuristic::new(config)),
            unlinked: SegQueue::new(),
        }
    }

    pub(crate) fn gc_epoch(&self) -> u64 {
        self.gc_epoch.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn set_cold_gc_count(&self, count: ColdGcCount) {
        self.cold_gc_count.store(count.to_bits(), Ordering::Release);
    }
}

/// Packed per-blob unloading verdict: bit 0 is the verdict, bits 1-2 the cycle.
struct IsUnloadingState;

impl IsUnloadingState {
    fn create(unloading: bool, cycle: u8) -> u8 {
        (unloading as u8) | (cycle << 1)
    }

    fn is_unloading(state: u8) -> bool {
        state & 1 != 0
    }

    fn cycle(state: u8) -> u8 {
        (state >> 1) & 0b11
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassChangeKind {
    Load,
    Initialize,
    Redefine,
}

/// A class-hierarchy event that may invalidate optimistic assumptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassChange {
    pub klass: KlassId,
    pub kind: ClassChangeKind,
}

impl ClassChange {
    pub fn new(klass: KlassId, kind: ClassChangeKind) -> Self {
        Self { klass, kind }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    pub freed_blobs: usize,
    pub freed_bytes: usize,
    pub restarted_compilation: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeoptReport {
    pub made_not_entrant: usize,
    /// Of those, how many may still have activations on some stack.
    pub maybe_on_stack: usize,
}

impl CodeCache {
    pub fn gc_epoch(&self) -> u64 {
        self.epochs.gc_epoch()
    }

    pub fn is_marking(&self) -> bool {
        self.gc_epoch() % 2 == 1
    }

    /// Enter the marking state. Panics if marking is already active.
    pub fn on_marking_cycle_start(&self) {
        let epoch = self.gc_epoch();
        assert!(epoch % 2 == 0, "marking cycle started twice (epoch {})", epoch);
        let swapped = self.epochs.gc_epoch.compare_exchange(
            epoch,
            epoch + 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        assert!(swapped.is_ok(), "concurrent marking cycle transition");
        debug!("Marking cycle started, gc epoch {}", epoch + 1);
    }

    /// Leave the marking state and resample the aging heuristic. Panics if not marking.
    pub fn on_marking_cycle_finish(&self) {
        let epoch = self.gc_epoch();
        assert!(epoch % 2 == 1, "marking cycle finished while idle (epoch {})", epoch);
        let swapped = self.epochs.gc_epoch.compare_exchange(
            epoch,
            epoch + 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        assert!(swapped.is_ok(), "concurrent marking cycle transition");
        debug!("Marking cycle finished, gc epoch {}", epoch + 1);
        self.update_cold_gc_count();
    }

    /// Epoch of the last marking cycle that ran to completion.
    pub fn previous_completed_cycle(&self) -> u64 {
        let epoch = self.gc_epoch();
        if epoch % 2 == 1 {
            epoch - 2
        } else {
            epoch - 1
        }
    }

    pub fn unloading_cycle(&self) -> u8 {
        self.epochs.unloading_cycle.load(Ordering::Acquire)
    }

    /// Start a new unloading pass; cached verdicts from the previous pass go stale.
    pub fn increment_unloading_cycle(&self) {
        let next = match (self.unloading_cycle() + 1) % 4 {
            0 => 1,
            n => n,
        };
        self.epochs.unloading_cycle.store(next, Ordering::Release);
    }

    pub fn cold_gc_count(&self) -> ColdGcCount {
        ColdGcCount::from_bits(self.epochs.cold_gc_count.load(Ordering::Acquire))
    }

    fn update_cold_gc_count(&self) {
        let free = self.unallocated_capacity();
        let capacity = self.max_capacity();
        let now = self.clock.now();
        let count = self.epochs.aging.lock().update(free, capacity, now);
        self.epochs
            .cold_gc_count
            .store(count.to_bits(), Ordering::Release);
        self.record_unloading_usage(capacity - free);
    }

    /// Record that `blob` was seen on a stack during the current marking cycle.
    pub fn mark_as_maybe_on_stack(&self, blob: &CodeBlob) {
        blob.stamp_epoch(self.gc_epoch());
    }

    /// Handle-based variant of [`mark_as_maybe_on_stack`](Self::mark_as_maybe_on_stack).
    /// Returns false for handles with no committed blob.
    pub fn mark_handle_on_stack(&self, handle: BlobHandle) -> bool {
        match self.blob(handle) {
            Some(blob) => {
                self.mark_as_maybe_on_stack(&blob);
                true
            }
            None => false,
        }
    }

    pub fn is_maybe_on_stack(&self, blob: &CodeBlob) -> bool {
        blob.gc_epoch() >= self.previous_completed_cycle()
    }

    /// Whether a method has gone unused long enough to be unloaded.
    pub fn is_cold(&self, blob: &CodeBlob) -> bool {
        if !self.config.flushing || !blob.kind().is_method() {
            return false;
        }
        if blob.is_not_entrant() && !self.is_maybe_on_stack(blob) {
            return true;
        }
        match self.cold_gc_count() {
            ColdGcCount::Unbounded => false,
            ColdGcCount::Cycles(n) => {
                let horizon = blob.gc_epoch().saturating_add(2 * n as u64);
                self.previous_completed_cycle() > horizon
            }
        }
    }

    /// Unloading verdict for the current unloading cycle.
    ///
    /// Computed once per cycle; racing callers agree on the first published verdict.
    /// Once a blob is unloading it stays unloading.
    pub fn is_unloading(&self, blob: &CodeBlob, behaviour: &dyn IsUnloadingBehaviour) -> bool {
        let state = blob.unloading_state();
        if IsUnloadingState::is_unloading(state) {
            return true;
        }
        let current = self.unloading_cycle();
        if IsUnloadingState::cycle(state) == current {
            return false;
        }

        let unloading = behaviour.is_unloading(blob) || self.is_cold(blob);
        let new_state = IsUnloadingState::create(unloading, current);
        match blob.exchange_unloading_state(state, new_state) {
            Ok(_) => unloading,
            Err(found) => IsUnloadingState::is_unloading(found),
        }
    }

    /// Mark every live method the collector or the aging policy wants gone.
    pub fn do_unloading(&self, behaviour: &dyn IsUnloadingBehaviour) -> usize {
        let mut marked = 0;
        for blob in self.methods() {
            if blob.state() == BlobState::Live
                && self.is_unloading(&blob, behaviour)
                && blob.transition(BlobState::Live, BlobState::MarkedForUnload)
            {
                marked += 1;
            }
        }
        if marked > 0 {
            debug!("Marked {} methods for unloading", marked);
        }
        marked
    }

    /// Unlink every marked blob; returns how many moved to the unlinked list.
    pub fn unlink_marked(&self) -> usize {
        self.blobs()
            .filter(|b| b.state() == BlobState::MarkedForUnload)
            .filter(|b| self.register_unlinked(b))
            .count()
    }

    /// Queue a blob for release after the next handshake.
    ///
    /// Blobs marked by [`do_unloading`](Self::do_unloading) are the usual input. A `Live`
    /// blob is unlinked directly, for callers that retire code outside a GC cycle (e.g. a
    /// method replaced by a recompiled version). Returns false if it was already unlinked
    /// or freed.
    pub fn register_unlinked(&self, blob: &Arc<CodeBlob>) -> bool {
        let unlinked = blob.transition(BlobState::MarkedForUnload, BlobState::Reclaimable)
            || blob.transition(BlobState::Live, BlobState::Reclaimable);
        if unlinked {
            self.epochs.unlinked.push(blob.clone());
        }
        unlinked
    }

    pub fn unlinked_count(&self) -> usize {
        self.epochs.unlinked.len()
    }

    /// Release every unlinked blob.
    ///
    /// Runs the handshake first so no thread can still be executing the code, then frees
    /// under the cache lock. Compilation is turned back on if it had been stopped and
    /// memory was actually released.
    pub fn flush_unlinked(&self, handshake: &dyn Handshake) -> FlushReport {
        let mut batch = Vec::new();
        while let Some(blob) = self.epochs.unlinked.pop() {
            batch.push(blob);
        }
        if batch.is_empty() {
            return FlushReport::default();
        }

        handshake.synchronize();
        let freed_bytes: usize = {
            let mut guard = self.lock();
            batch.iter().map(|blob| guard.free_blob(blob)).sum()
        };
        let restarted = self.restart_compilation_if_disabled(freed_bytes);
        debug!(
            "Flushed {} unlinked blobs, {} bytes released",
            batch.len(),
            freed_bytes
        );

        FlushReport {
            freed_blobs: batch.len(),
            freed_bytes,
            restarted_compilation: restarted,
        }
    }

    /// Mark methods whose assumptions `change` may break. Cheap when no method carries
    /// dependencies.
    pub fn mark_for_deoptimization(&self, change: &ClassChange) -> usize {
        if self.methods_with_dependencies() == 0 {
            return 0;
        }
        let marked = self
            .methods()
            .filter(|b| b.kind().has_dependencies() && b.depends_on(change.klass))
            .filter(|b| b.mark_for_deoptimization())
            .count();
        if marked > 0 {
            debug!(
                "{:?} of {} marked {} dependent methods",
                change.kind, change.klass, marked
            );
        }
        marked
    }

    /// Mark every method, e.g. when a debugger needs all code to be recompiled.
    pub fn mark_all_for_deoptimization(&self) -> usize {
        self.methods().filter(|b| b.mark_for_deoptimization()).count()
    }

    /// Make every marked method not entrant, then handshake so threads stop entering it.
    pub fn deoptimize_marked(&self, handshake: &dyn Handshake) -> DeoptReport {
        let mut report = DeoptReport::default();
        for blob in self.methods() {
            if blob.make_not_entrant() {
                report.made_not_entrant += 1;
                if self.is_maybe_on_stack(&blob) {
                    report.maybe_on_stack += 1;
                }
            }
        }
        if report.made_not_entrant > 0 {
            handshake.synchronize();
            info!(
                "Deoptimized {} methods ({} possibly on stack)",
                report.made_not_entrant, report.maybe_on_stack
            );
        }
        report
    }
}
