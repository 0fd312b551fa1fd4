use codecache_core::{CodeCacheError, Result};
use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};

use crate::cache::CodeCache;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapMetrics {
    pub heap: String,
    pub capacity: usize,
    pub committed: usize,
    pub used: usize,
    pub max_used: usize,
    pub free: usize,
    pub blobs: usize,
    pub full_count: u32,
}

/// Counter snapshot, cheap to take from any thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub heaps: Vec<HeapMetrics>,
    pub methods: usize,
    pub adapters: usize,
    pub methods_with_dependencies: usize,
    pub codemem_full_count: u32,
    pub compilation_enabled: bool,
    pub gc_epoch: u64,
}

impl CodeCache {
    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            heaps: self
                .heaps()
                .map(|h| HeapMetrics {
                    heap: h.name().to_string(),
                    capacity: h.max_capacity(),
                    committed: h.capacity(),
                    used: h.allocated_capacity(),
                    max_used: h.max_allocated_capacity(),
                    free: h.unallocated_capacity(),
                    blobs: h.blob_count(),
                    full_count: h.full_count(),
                })
                .collect(),
            methods: self.method_count(),
            adapters: self.adapter_count(),
            methods_with_dependencies: self.methods_with_dependencies(),
            codemem_full_count: self.codemem_full_count(),
            compilation_enabled: self.is_compilation_enabled(),
            gc_epoch: self.gc_epoch(),
        }
    }
}

fn metrics_error(e: prometheus::Error) -> CodeCacheError {
    CodeCacheError::Metrics(e.to_string())
}

/// Publishes [`CacheMetrics`] as Prometheus gauges.
pub struct PrometheusExporter {
    registry: Registry,
    heap_capacity: IntGaugeVec,
    heap_committed: IntGaugeVec,
    heap_used: IntGaugeVec,
    heap_max_used: IntGaugeVec,
    heap_free: IntGaugeVec,
    heap_blobs: IntGaugeVec,
    heap_full: IntGaugeVec,
    methods: IntGauge,
    adapters: IntGauge,
    dependent_methods: IntGauge,
    full_total: IntGauge,
    compilation_enabled: IntGauge,
    gc_epoch: IntGauge,
}

impl PrometheusExporter {
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new())
    }

    pub fn with_registry(registry: Registry) -> Result<Self> {
        let heap_gauge = |name: &str, help: &str| -> Result<IntGaugeVec> {
            let gauge = IntGaugeVec::new(Opts::new(name, help), &["heap"]).map_err(metrics_error)?;
            registry
                .register(Box::new(gauge.clone()))
                .map_err(metrics_error)?;
            Ok(gauge)
        };
        let gauge = |name: &str, help: &str| -> Result<IntGauge> {
            let gauge = IntGauge::new(name, help).map_err(metrics_error)?;
            registry
                .register(Box::new(gauge.clone()))
                .map_err(metrics_error)?;
            Ok(gauge)
        };

        let exporter = Self {
            heap_capacity: heap_gauge(
                "codecache_heap_capacity_bytes",
                "Reserved bytes per code heap",
            )?,
            heap_committed: heap_gauge(
                "codecache_heap_committed_bytes",
                "Committed bytes per code heap",
            )?,
            heap_used: heap_gauge("codecache_heap_used_bytes", "Allocated bytes per code heap")?,
            heap_max_used: heap_gauge(
                "codecache_heap_max_used_bytes",
                "High-water mark of allocated bytes per code heap",
            )?,
            heap_free: heap_gauge("codecache_heap_free_bytes", "Unallocated bytes per code heap")?,
            heap_blobs: heap_gauge("codecache_heap_blobs", "Blobs per code heap")?,
            heap_full: heap_gauge(
                "codecache_heap_full_total",
                "Times a code heap was reported full",
            )?,
            methods: gauge("codecache_methods", "Committed compiled methods")?,
            adapters: gauge("codecache_adapters", "Committed adapters")?,
            dependent_methods: gauge(
                "codecache_methods_with_dependencies",
                "Methods carrying class dependencies",
            )?,
            full_total: gauge("codecache_full_total", "Times any code heap was reported full")?,
            compilation_enabled: gauge(
                "codecache_compilation_enabled",
                "1 while compilation is enabled",
            )?,
            gc_epoch: gauge("codecache_gc_epoch", "Current GC marking epoch")?,
            registry,
        };
        Ok(exporter)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn update(&self, metrics: &CacheMetrics) {
        for heap in &metrics.heaps {
            let labels = [heap.heap.as_str()];
            self.heap_capacity.with_label_values(&labels).set(heap.capacity as i64);
            self.heap_committed.with_label_values(&labels).set(heap.committed as i64);
            self.heap_used.with_label_values(&labels).set(heap.used as i64);
            self.heap_max_used.with_label_values(&labels).set(heap.max_used as i64);
            self.heap_free.with_label_values(&labels).set(heap.free as i64);
            self.heap_blobs.with_label_values(&labels).set(heap.blobs as i64);
            self.heap_full.with_label_values(&labels).set(heap.full_count as i64);
        }
        self.methods.set(metrics.methods as i64);
        self.adapters.set(metrics.adapters as i64);
        self.dependent_methods.set(metrics.methods_with_dependencies as i64);
        self.full_total.set(metrics.codemem_full_count as i64);
        self.compilation_enabled.set(metrics.compilation_enabled as i64);
        self.gc_epoch.set(metrics.gc_epoch as i64);
    }

    /// Refresh from `cache` and render the text exposition format.
    pub fn render(&self, cache: &CodeCache) -> Result<String> {
        self.update(&cache.metrics());
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| CodeCacheError::Metrics(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobSpec;
    use codecache_core::units::M;
    use codecache_core::{CodeCacheConfig, CodeHeapKind};

    #[test]
    fn exporter_renders_heap_gauges() {
        let cache = CodeCache::new(CodeCacheConfig::default().with_reserved_size(64 * M)).unwrap();
        {
            let mut guard = cache.lock();
            let h = guard.allocate(2048, CodeHeapKind::MethodNonProfiled).unwrap();
            guard.commit(h, BlobSpec::method("m", vec![])).unwrap();
        }
        let exporter = PrometheusExporter::new().unwrap();
        let text = exporter.render(&cache).unwrap();
        assert!(text.contains(
            "codecache_heap_used_bytes{heap=\"CodeHeap 'non-profiled methods'\"} 2048"
        ));
        assert!(text.contains("codecache_methods 1"));
        assert!(text.contains("codecache_compilation_enabled 1"));
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let registry = Registry::new();
        assert!(PrometheusExporter::with_registry(registry.clone()).is_ok());
        assert!(matches!(
            PrometheusExporter::with_registry(registry),
            Err(CodeCacheError::Metrics(_))
        ));
    }

    #[test]
    fn snapshot_matches_cache() {
        let cache = CodeCache::new(CodeCacheConfig::default().with_reserved_size(64 * M)).unwrap();
        let metrics = cache.metrics();
        assert_eq!(metrics.heaps.len(), 3);
        assert_eq!(metrics.heaps.iter().map(|h| h.capacity).sum::<usize>(), 64 * M);
        assert_eq!(metrics.gc_epoch, 2);
    }
}
