use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use codecache_runtime::units::{K, M};
use codecache_runtime::{
    AllReachable, BlobSpec, BlobState, CodeCache, CodeCacheConfig, CodeCacheError, CodeHeapKind,
    ColdGcCount, Detached, KlassId, ManualClock,
};

fn tiny_segmented() -> CodeCacheConfig {
    CodeCacheConfig {
        non_method_size: Some(128 * K),
        profiled_size: Some(128 * K),
        non_profiled_size: Some(128 * K),
        minimum_use_space: 64 * K,
        compiler_buffer_size: 64 * K,
        ..CodeCacheConfig::default().with_reserved_size(384 * K)
    }
}

#[test]
fn test_non_method_spills_over_then_fails() {
    let cache = CodeCache::new(tiny_segmented()).unwrap();
    let mut guard = cache.lock();

    let mut placed = Vec::new();
    let err = loop {
        match guard.allocate(64 * K, CodeHeapKind::NonMethod) {
            Ok(handle) => placed.push(cache.heap(handle.heap).unwrap().kind()),
            Err(e) => break e,
        }
    };
    assert_eq!(
        placed,
        vec![
            CodeHeapKind::NonMethod,
            CodeHeapKind::NonMethod,
            CodeHeapKind::MethodNonProfiled,
            CodeHeapKind::MethodNonProfiled,
            CodeHeapKind::MethodProfiled,
            CodeHeapKind::MethodProfiled,
        ]
    );
    assert!(matches!(
        err,
        CodeCacheError::CodeCacheFull {
            kind: CodeHeapKind::NonMethod,
            ..
        }
    ));
    drop(guard);
    assert!(!cache.is_compilation_enabled());
}

#[test]
fn test_every_kind_terminates_when_all_heaps_are_full() {
    let cache = CodeCache::new(tiny_segmented()).unwrap();
    let mut guard = cache.lock();
    while guard.allocate(64 * K, CodeHeapKind::NonMethod).is_ok() {}

    for kind in CodeHeapKind::SEGMENTED {
        let err = guard.allocate(128, kind).unwrap_err();
        assert!(matches!(err, CodeCacheError::CodeCacheFull { kind: k, .. } if k == kind));
    }
}

#[test]
fn test_profiled_request_falls_back_to_non_profiled() {
    let cache = CodeCache::new(tiny_segmented()).unwrap();
    let mut guard = cache.lock();
    guard.allocate(128 * K, CodeHeapKind::MethodProfiled).unwrap();
    let handle = guard.allocate(64 * K, CodeHeapKind::MethodProfiled).unwrap();
    assert_eq!(
        cache.heap(handle.heap).unwrap().kind(),
        CodeHeapKind::MethodNonProfiled
    );
}

#[test]
fn test_default_64m_non_method_allocation() {
    let cache = CodeCache::new(CodeCacheConfig::default().with_reserved_size(64 * M)).unwrap();
    let layout = cache.layout();
    assert_eq!(layout.size_of(CodeHeapKind::NonMethod), Some(2 * M));
    assert_eq!(layout.size_of(CodeHeapKind::MethodProfiled), Some(31 * M));

    let heap = cache.heap_for(CodeHeapKind::NonMethod).unwrap().clone();
    let before = heap.unallocated_capacity();
    let mut guard = cache.lock();
    let handle = guard.allocate(4 * K, CodeHeapKind::NonMethod).unwrap();
    assert!(before - heap.unallocated_capacity() >= 4 * K);
    guard.free(handle).unwrap();
    assert_eq!(heap.unallocated_capacity(), before);
}

#[test]
fn test_epochs_strictly_increase() {
    let cache = CodeCache::new(CodeCacheConfig::default().with_reserved_size(64 * M)).unwrap();
    let mut last = cache.gc_epoch();
    for _ in 0..50 {
        if cache.is_marking() {
            cache.on_marking_cycle_finish();
        } else {
            cache.on_marking_cycle_start();
        }
        let epoch = cache.gc_epoch();
        assert!(epoch > last);
        assert!(cache.previous_completed_cycle() < epoch);
        last = epoch;
    }
}

#[test]
fn test_unused_methods_age_out() {
    let clock = Arc::new(ManualClock::new());
    let cache = CodeCache::builder(CodeCacheConfig::default().with_reserved_size(64 * M))
        .clock(clock.clone())
        .build()
        .unwrap();

    let (hot, cold) = {
        let mut guard = cache.lock();
        let h = guard.allocate(K, CodeHeapKind::MethodNonProfiled).unwrap();
        let c = guard.allocate(K, CodeHeapKind::MethodNonProfiled).unwrap();
        (
            guard.commit(h, BlobSpec::method("Hot::run", vec![])).unwrap(),
            guard.commit(c, BlobSpec::method("Cold::init", vec![])).unwrap(),
        )
    };

    for cycle in 0..3 {
        if cycle > 0 {
            clock.advance(Duration::from_secs(1));
            // uncommitted filler still counts as used space
            cache
                .lock()
                .allocate(8 * M, CodeHeapKind::MethodNonProfiled)
                .unwrap();
        }
        cache.on_marking_cycle_start();
        cache.mark_as_maybe_on_stack(&hot);
        cache.on_marking_cycle_finish();
    }

    assert_eq!(cache.cold_gc_count(), ColdGcCount::Cycles(2));
    assert!(cache.is_cold(&cold));
    assert!(!cache.is_cold(&hot));

    cache.increment_unloading_cycle();
    assert_eq!(cache.do_unloading(&AllReachable), 1);
    assert_eq!(cache.unlink_marked(), 1);
    let report = cache.flush_unlinked(&Detached);
    assert_eq!(report.freed_blobs, 1);
    assert_eq!(cold.state(), BlobState::Freed);
    assert_eq!(hot.state(), BlobState::Live);
    assert_eq!(cache.method_count(), 1);
}

#[test]
fn test_class_load_invalidates_dependents_only() {
    let cache = CodeCache::new(CodeCacheConfig::default().with_reserved_size(64 * M)).unwrap();
    let blobs: Vec<_> = {
        let mut guard = cache.lock();
        (0..10u64)
            .map(|i| {
                let h = guard
                    .allocate(256, CodeHeapKind::MethodNonProfiled)
                    .unwrap();
                let deps = if i % 2 == 0 { vec![KlassId(i)] } else { vec![] };
                guard.commit(h, BlobSpec::method(format!("M{}", i), deps)).unwrap()
            })
            .collect()
    };
    assert_eq!(cache.methods_with_dependencies(), 5);

    let change = codecache_runtime::ClassChange::new(
        KlassId(4),
        codecache_runtime::ClassChangeKind::Initialize,
    );
    assert_eq!(cache.mark_for_deoptimization(&change), 1);
    let report = cache.deoptimize_marked(&Detached);
    assert_eq!(report.made_not_entrant, 1);
    assert!(blobs[4].is_not_entrant());
    assert_eq!(blobs.iter().filter(|b| b.is_not_entrant()).count(), 1);
}

#[test]
fn test_lock_free_readers_during_churn() {
    let cache = CodeCache::new(CodeCacheConfig::default().with_reserved_size(64 * M)).unwrap();
    let heap = cache.heap_for(CodeHeapKind::MethodNonProfiled).unwrap().clone();
    let low = heap.low_boundary();
    let done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        for seed in 0..3 {
            let cache = &cache;
            let done = &done;
            scope.spawn(move || {
                let mut rng = fastrand::Rng::with_seed(seed);
                while !done.load(Ordering::Acquire) {
                    let address = low + rng.usize(0..4 * M);
                    if let Some(blob) = cache.find_blob(address) {
                        assert!(blob.contains(address));
                    }
                    let _ = cache.contains(address);
                }
            });
        }

        let mut rng = fastrand::Rng::with_seed(99);
        let mut live = Vec::new();
        for i in 0..2000 {
            let mut guard = cache.lock();
            if live.is_empty() || rng.bool() {
                let size = rng.usize(64..8 * K);
                let handle = guard.allocate(size, CodeHeapKind::MethodNonProfiled).unwrap();
                guard
                    .commit(handle, BlobSpec::method(format!("m{}", i), vec![]))
                    .unwrap();
                live.push(handle);
            } else {
                let victim = live.swap_remove(rng.usize(0..live.len()));
                guard.free(victim).unwrap();
            }
        }
        done.store(true, Ordering::Release);
    });

    assert_eq!(cache.blobs().count(), cache.method_count());
}
