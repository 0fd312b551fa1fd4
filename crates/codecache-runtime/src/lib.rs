//! Runtime side of the JIT code cache.
//!
//! - `cache`: the cache manager, allocation routing and commit/free bookkeeping
//! - `blob`: committed blob metadata and its lifecycle state
//! - `unloading`: GC epochs, unloading verdicts, two-phase reclamation, deoptimization
//! - `aging`: the cold-code feedback loop
//! - `exhaustion`: full-cache reporting, GC requests and compiler throttling
//! - `report` / `metrics`: summaries, perf maps and Prometheus export
//! - `traits`: collaborator interfaces (compiler broker, GC, handshakes, clocks)

pub mod aging;
pub mod blob;
pub mod cache;
pub mod exhaustion;
pub mod metrics;
pub mod report;
pub mod traits;
pub mod unloading;

pub use aging::*;
pub use blob::*;
pub use cache::*;
pub use metrics::*;
pub use report::*;
pub use traits::*;
pub use unloading::*;

pub use codecache_core::{
    units, BlobHandle, BlobKind, CodeCacheConfig, CodeCacheError, CodeHeap, CodeHeapKind,
    HeapId, HeapLayout, HeapStats, Result,
};
