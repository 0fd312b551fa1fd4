use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use codecache_core::{HeapStats, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::aging::ColdGcCount;
use crate::cache::CodeCache;

/// Serializable view of the whole cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSummary {
    pub heaps: Vec<HeapStats>,
    pub total_blobs: usize,
    pub nmethods: usize,
    pub adapters: usize,
    pub methods_with_dependencies: usize,
    pub compilation_enabled: bool,
    pub codemem_full_count: u32,
    pub gc_epoch: u64,
    pub cold_gc_count: ColdGcCount,
    pub unlinked: usize,
}

impl CacheSummary {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl CodeCache {
    pub fn summary(&self) -> CacheSummary {
        CacheSummary {
            heaps: self.heaps().map(|h| h.stats()).collect(),
            total_blobs: self.blob_count(),
            nmethods: self.method_count(),
            adapters: self.adapter_count(),
            methods_with_dependencies: self.methods_with_dependencies(),
            compilation_enabled: self.is_compilation_enabled(),
            codemem_full_count: self.codemem_full_count(),
            gc_epoch: self.gc_epoch(),
            cold_gc_count: self.cold_gc_count(),
            unlinked: self.unlinked_count(),
        }
    }

    /// Human-readable usage, one block per heap followed by totals.
    pub fn print_summary<W: Write>(&self, out: &mut W) -> io::Result<()> {
        for heap in self.heaps() {
            writeln!(
                out,
                "{}: size={}Kb used={}Kb max_used={}Kb free={}Kb",
                heap.name(),
                heap.max_capacity() / 1024,
                heap.allocated_capacity() / 1024,
                heap.max_allocated_capacity() / 1024,
                heap.unallocated_capacity() / 1024
            )?;
            writeln!(
                out,
                " bounds [{:#018x}, {:#018x}, {:#018x}]",
                heap.low_boundary(),
                heap.high(),
                heap.high_boundary()
            )?;
        }
        writeln!(
            out,
            " total_blobs={} nmethods={} adapters={}",
            self.blob_count(),
            self.method_count(),
            self.adapter_count()
        )?;
        let compilation = if self.is_compilation_enabled() {
            "enabled"
        } else {
            "disabled (not enough contiguous free space left)"
        };
        writeln!(out, " compilation: {}", compilation)?;
        writeln!(out, " full_count={}", self.codemem_full_count())
    }

    /// Write `<start> <size> <name>` (hex, hex, text) for every committed blob, in
    /// address order. Returns the number of lines written.
    pub fn write_perf_map<W: Write>(&self, out: &mut W) -> io::Result<usize> {
        let mut lines = 0;
        for blob in self.blobs() {
            writeln!(out, "{:x} {:x} {}", blob.address(), blob.size(), blob.name())?;
            lines += 1;
        }
        Ok(lines)
    }

    pub fn write_perf_map_file(&self, path: &Path) -> Result<usize> {
        let mut out = BufWriter::new(File::create(path)?);
        let lines = self.write_perf_map(&mut out)?;
        out.flush()?;
        debug!("Wrote {} perf map entries to {:?}", lines, path);
        Ok(lines)
    }
}
