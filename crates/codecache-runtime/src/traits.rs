//! Seams to the rest of the runtime: compiler threads, the garbage collector,
//! safepoints and time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use codecache_core::CodeHeapKind;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::blob::CodeBlob;

/// Why the cache asked the collector for a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcCause {
    /// Free space dropped to the aggressive-sweeping level.
    CodeCacheAggressive,
    /// Too much code was allocated since the last unloading cycle.
    CodeCacheThreshold,
}

/// Controls whether compiler threads keep producing code.
pub trait CompileBroker: Send + Sync {
    /// `kind` names the heap whose exhaustion caused the stop.
    fn stop_compilation(&self, kind: CodeHeapKind);
    fn restart_compilation(&self);
}

pub trait GcRequester: Send + Sync {
    fn collect(&self, cause: GcCause);
}

/// The collector's reachability verdict for a committed blob.
pub trait IsUnloadingBehaviour: Send + Sync {
    fn is_unloading(&self, blob: &CodeBlob) -> bool;
}

/// Brings every mutator thread to a point where it no longer holds stale code pointers.
pub trait Handshake: Send + Sync {
    fn synchronize(&self);
}

/// Monotonic time source, in seconds since an arbitrary origin.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Seconds elapsed since the first time any `MonotonicClock` was read.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> f64 {
        PROCESS_START.elapsed().as_secs_f64()
    }
}

/// Clock moved by hand, for deterministic tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, at: Duration) {
        self.nanos.store(at.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst)).as_secs_f64()
    }
}

/// Collaborator that ignores every request. Default for caches built without one.
#[derive(Debug, Default, Clone, Copy)]
pub struct Detached;

impl CompileBroker for Detached {
    fn stop_compilation(&self, _kind: CodeHeapKind) {}
    fn restart_compilation(&self) {}
}

impl GcRequester for Detached {
    fn collect(&self, _cause: GcCause) {}
}

impl Handshake for Detached {
    fn synchronize(&self) {}
}

/// Reachability predicate that keeps everything alive; only aging can unload.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllReachable;

impl IsUnloadingBehaviour for AllReachable {
    fn is_unloading(&self, _blob: &CodeBlob) -> bool {
        false
    }
}
