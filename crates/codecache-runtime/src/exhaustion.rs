use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use codecache_core::CodeHeapKind;
use tracing::{debug, info, warn};

use crate::cache::CodeCache;
use crate::traits::GcCause;

pub(crate) struct ExhaustionState {
    compilation_enabled: AtomicBool,
    /// Set by the first thread that requests a code-cache GC; cleared when marking ends.
    gc_requested: AtomicBool,
    last_unloading_used: AtomicUsize,
    codemem_full_count: AtomicU32,
}

impl ExhaustionState {
    pub(crate) fn new() -> Self {
        Self {
            compilation_enabled: AtomicBool::new(true),
            gc_requested: AtomicBool::new(false),
            last_unloading_used: AtomicUsize::new(0),
            codemem_full_count: AtomicU32::new(0),
        }
    }
}

impl CodeCache {
    pub fn is_compilation_enabled(&self) -> bool {
        self.exhaustion.compilation_enabled.load(Ordering::Acquire)
    }

    /// Times any heap was reported full.
    pub fn codemem_full_count(&self) -> u32 {
        self.exhaustion.codemem_full_count.load(Ordering::Relaxed)
    }

    pub fn is_gc_requested(&self) -> bool {
        self.exhaustion.gc_requested.load(Ordering::Acquire)
    }

    /// Used capacity sampled when the last marking cycle finished.
    pub fn last_unloading_used(&self) -> usize {
        self.exhaustion.last_unloading_used.load(Ordering::Acquire)
    }

    /// Record that the heap for `kind` could not satisfy an allocation.
    ///
    /// Compilation is stopped. The warning is printed once per heap unless `force` is
    /// set.
    pub fn report_full(&self, kind: CodeHeapKind, force: bool) {
        let heap = self.heap_for(kind);
        let full_count = heap.map(|h| h.report_full()).unwrap_or(1);

        if self
            .exhaustion
            .compilation_enabled
            .swap(false, Ordering::AcqRel)
        {
            self.broker.stop_compilation(kind);
        }

        if full_count == 1 || force {
            let heap_kind = heap.map(|h| h.kind()).unwrap_or(kind);
            warn!("{} is full. Compiler has been disabled.", heap_kind.heap_name());
            if self.layout().segmented {
                warn!(
                    "Try increasing the code heap size using `{}`",
                    heap_kind.size_knob()
                );
            } else {
                warn!(
                    "Try increasing the code cache size using `{}`",
                    heap_kind.size_knob()
                );
            }
        }
        self.exhaustion
            .codemem_full_count
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Opportunistic check run on every allocation: ask the collector for a cycle when
    /// free space is critically low or a lot of code was allocated since the last one.
    pub fn gc_on_allocation(&self) {
        let free = self.unallocated_capacity();
        let max = self.max_capacity();
        let used = max - free;
        let free_ratio = free as f64 / max as f64;

        if free_ratio <= self.config.aggressive_fraction() {
            if self.request_gc(GcCause::CodeCacheAggressive) {
                debug!(
                    "Triggering aggressive GC due to having only {:.3}% free memory",
                    free_ratio * 100.0
                );
            }
            return;
        }

        let last_used = self.last_unloading_used();
        if last_used >= used {
            return;
        }

        let allocated_since_last_ratio = (used - last_used) as f64 / max as f64;
        let used_ratio = used as f64 / max as f64;
        let mut threshold = self.config.sweeper_fraction();
        if used_ratio > threshold {
            // tighten as the cache approaches exhaustion
            threshold *= free_ratio;
        }
        if allocated_since_last_ratio > threshold && self.request_gc(GcCause::CodeCacheThreshold) {
            debug!(
                "Triggering threshold ({:.3}%) GC due to allocating {:.3}% since last unloading \
                 ({:.3}% used -> {:.3}% used)",
                threshold * 100.0,
                allocated_since_last_ratio * 100.0,
                last_used as f64 / max as f64 * 100.0,
                used_ratio * 100.0
            );
        }
    }

    /// At most one request is in flight until the next marking cycle finishes.
    fn request_gc(&self, cause: GcCause) -> bool {
        let won = self
            .exhaustion
            .gc_requested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.gc.collect(cause);
        }
        won
    }

    pub(crate) fn record_unloading_usage(&self, used: usize) {
        self.exhaustion.gc_requested.store(false, Ordering::Release);
        self.exhaustion
            .last_unloading_used
            .store(used, Ordering::Release);
    }

    pub(crate) fn restart_compilation_if_disabled(&self, freed: usize) -> bool {
        if freed == 0 {
            return false;
        }
        let restarted = self
            .exhaustion
            .compilation_enabled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if restarted {
            info!("Restarting compiler");
            self.broker.restart_compilation();
        }
        restarted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobSpec;
    use crate::traits::{CompileBroker, Detached, GcRequester};
    use codecache_core::units::{K, M};
    use codecache_core::{CodeCacheConfig, CodeCacheError};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        gcs: Mutex<Vec<GcCause>>,
        stops: AtomicUsize,
        restarts: AtomicUsize,
    }

    impl GcRequester for Recorder {
        fn collect(&self, cause: GcCause) {
            self.gcs.lock().push(cause);
        }
    }

    impl CompileBroker for Recorder {
        fn stop_compilation(&self, _kind: CodeHeapKind) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn restart_compilation(&self) {
            self.restarts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn cache_with(recorder: &Arc<Recorder>, config: CodeCacheConfig) -> CodeCache {
        CodeCache::builder(config)
            .gc_requester(recorder.clone())
            .compile_broker(recorder.clone())
            .build()
            .unwrap()
    }

    #[test]
    fn threshold_gc_is_requested_once() {
        let recorder = Arc::new(Recorder::default());
        let cache = cache_with(&recorder, CodeCacheConfig::default().with_reserved_size(64 * M));
        {
            let mut guard = cache.lock();
            // 16M of 64M is beyond the 15% threshold
            for _ in 0..16 {
                guard.allocate(M, CodeHeapKind::MethodNonProfiled).unwrap();
                guard.allocate(K, CodeHeapKind::MethodNonProfiled).unwrap();
            }
        }
        assert_eq!(*recorder.gcs.lock(), vec![GcCause::CodeCacheThreshold]);
        assert!(cache.is_gc_requested());

        cache.on_marking_cycle_start();
        cache.on_marking_cycle_finish();
        assert!(!cache.is_gc_requested());
        assert_eq!(cache.last_unloading_used(), cache.allocated_capacity());
    }

    #[test]
    fn threshold_tightens_as_the_cache_fills() {
        let recorder = Arc::new(Recorder::default());
        let config = CodeCacheConfig {
            segmented: false,
            ..CodeCacheConfig::default().with_reserved_size(16 * M)
        };
        let cache = cache_with(&recorder, config);
        {
            let mut guard = cache.lock();
            for _ in 0..8 {
                guard.allocate(M, CodeHeapKind::Unified).unwrap();
            }
        }
        cache.on_marking_cycle_start();
        cache.on_marking_cycle_finish();
        assert_eq!(cache.last_unloading_used(), 8 * M);
        let requested = recorder.gcs.lock().len();

        let mut guard = cache.lock();
        // 1M since the last cycle (6.25%) stays under 15% * 7/16 free
        guard.allocate(M, CodeHeapKind::Unified).unwrap();
        guard.allocate(M, CodeHeapKind::Unified).unwrap();
        assert_eq!(recorder.gcs.lock().len(), requested);

        // 2M (12.5%) is below the nominal 15% but above 15% * 6/16 free
        guard.allocate(M, CodeHeapKind::Unified).unwrap();
        assert_eq!(recorder.gcs.lock().len(), requested + 1);
        assert_eq!(recorder.gcs.lock().last(), Some(&GcCause::CodeCacheThreshold));
    }

    #[test]
    fn aggressive_gc_when_nearly_full() {
        let recorder = Arc::new(Recorder::default());
        let config = CodeCacheConfig {
            segmented: false,
            sweeper_threshold: 100.0,
            ..CodeCacheConfig::default().with_reserved_size(4 * M)
        };
        let cache = cache_with(&recorder, config);
        let mut guard = cache.lock();
        while cache.unallocated_capacity() > 256 * K {
            guard.allocate(64 * K, CodeHeapKind::Unified).unwrap();
        }
        guard.allocate(K, CodeHeapKind::Unified).unwrap();
        assert_eq!(*recorder.gcs.lock(), vec![GcCause::CodeCacheAggressive]);
    }

    #[test]
    fn full_cache_stops_then_flush_restarts_compiler() {
        let recorder = Arc::new(Recorder::default());
        let config = CodeCacheConfig {
            segmented: false,
            ..CodeCacheConfig::default().with_reserved_size(2 * M)
        };
        let cache = cache_with(&recorder, config);

        let mut first = None;
        let err = {
            let mut guard = cache.lock();
            loop {
                match guard.allocate(64 * K, CodeHeapKind::Unified) {
                    Ok(handle) => {
                        let blob = guard
                            .commit(handle, BlobSpec::method("m", vec![]))
                            .unwrap();
                        first.get_or_insert(blob);
                    }
                    Err(e) => break e,
                }
            }
        };
        assert!(matches!(
            err,
            CodeCacheError::CodeCacheFull {
                kind: CodeHeapKind::Unified,
                requested
            } if requested == 64 * K
        ));
        assert!(!cache.is_compilation_enabled());
        assert_eq!(recorder.stops.load(Ordering::SeqCst), 1);

        // a second failure counts but does not stop again
        assert!(cache.lock().allocate(64 * K, CodeHeapKind::Unified).is_err());
        assert_eq!(recorder.stops.load(Ordering::SeqCst), 1);
        assert_eq!(cache.codemem_full_count(), 2);
        assert_eq!(cache.heaps().next().unwrap().full_count(), 2);

        let blob = first.unwrap();
        assert!(cache.register_unlinked(&blob));
        let report = cache.flush_unlinked(&Detached);
        assert!(report.restarted_compilation);
        assert!(cache.is_compilation_enabled());
        assert_eq!(recorder.restarts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn forced_report_still_counts() {
        let cache = CodeCache::new(CodeCacheConfig::default().with_reserved_size(64 * M)).unwrap();
        cache.report_full(CodeHeapKind::MethodProfiled, false);
        cache.report_full(CodeHeapKind::MethodProfiled, true);
        let profiled = cache.heap_for(CodeHeapKind::MethodProfiled).unwrap();
        assert_eq!(profiled.full_count(), 2);
        assert_eq!(cache.codemem_full_count(), 2);
        assert!(!cache.is_compilation_enabled());
    }
}
