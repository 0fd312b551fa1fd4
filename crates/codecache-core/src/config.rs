use std::path::Path;

use config as cfg;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CodeCacheError, Result};
use crate::units::{K, M};

/// Reserved size used when the user did not pin one.
pub const DEFAULT_RESERVED_SIZE: usize = 240 * M;
/// Largest reservation any cache or heap may ask for.
pub const MAX_RESERVED_SIZE: usize = 2048 * M;

/// Code cache configuration.
///
/// Every `Option` size is a user override; `None` lets the partitioner derive the value.
/// A `Some` reserved size is "pinned": overrides that do not add up to it are rejected
/// instead of being rescaled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CodeCacheConfig {
    /// Total reserved size of the cache in bytes.
    pub reserved_size: Option<usize>,
    /// Size of the heap holding stubs and adapters.
    pub non_method_size: Option<usize>,
    /// Size of the heap holding profiled methods.
    pub profiled_size: Option<usize>,
    /// Size of the heap holding non-profiled methods.
    pub non_profiled_size: Option<usize>,
    /// Split the cache into per-kind heaps.
    pub segmented: bool,
    /// Tiered compilation; without it there is no profiled heap.
    pub tiered: bool,
    /// Allocation granularity of every heap's free list.
    pub segment_size: usize,
    /// Smallest block handed out, in segments.
    pub min_block_segments: usize,
    /// Commit granularity.
    pub page_size: usize,
    /// Bytes committed per heap at startup.
    pub initial_commit_size: usize,
    /// Bytes committed per expansion step.
    pub expansion_size: usize,
    /// Minimum cache size required to run at all.
    pub minimum_use_space: usize,
    /// Scratch space the compilers keep in the non-method heap.
    pub compiler_buffer_size: usize,
    /// Percentage of free capacity below which sweeping turns aggressive.
    pub aggressive_sweeping_at: f64,
    /// Percentage of capacity allocated since the last unloading that triggers a GC.
    pub sweeper_threshold: f64,
    /// Aging aggressiveness; 0 disables cold-code detection.
    pub sweep_activity: u32,
    /// Remove cold methods at all.
    pub flushing: bool,
    /// Samples kept for allocation-rate and GC-interval averages.
    pub aging_history_len: usize,
}

impl Default for CodeCacheConfig {
    fn default() -> Self {
        Self {
            reserved_size: None,
            non_method_size: None,
            profiled_size: None,
            non_profiled_size: None,
            segmented: true,
            tiered: true,
            segment_size: 128,
            min_block_segments: 4,
            page_size: 4 * K,
            initial_commit_size: 2560 * K,
            expansion_size: 64 * K,
            minimum_use_space: 1536 * K,
            compiler_buffer_size: 512 * K,
            aggressive_sweeping_at: 10.0,
            sweeper_threshold: 15.0,
            sweep_activity: 4,
            flushing: true,
            aging_history_len: 10,
        }
    }
}

impl CodeCacheConfig {
    /// Load from an optional TOML file layered under `CODECACHE__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = cfg::Config::builder();
        if let Some(path) = path {
            debug!("Loading code cache configuration from {:?}", path);
            builder = builder.add_source(cfg::File::from(path).format(cfg::FileFormat::Toml));
        }
        builder = builder.add_source(
            cfg::Environment::with_prefix("CODECACHE")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: Self = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let parsed: Self =
            toml::from_str(text).map_err(|e| CodeCacheError::InvalidConfig(e.to_string()))?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| CodeCacheError::InvalidConfig(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// JSON schema of the configuration file.
    pub fn json_schema() -> Result<String> {
        Ok(serde_json::to_string_pretty(&schemars::schema_for!(CodeCacheConfig))?)
    }

    pub fn with_reserved_size(mut self, size: usize) -> Self {
        self.reserved_size = Some(size);
        self
    }

    /// Effective total and whether the user pinned it.
    pub fn total_size(&self) -> (usize, bool) {
        match self.reserved_size {
            Some(size) => (size, true),
            None => (DEFAULT_RESERVED_SIZE, false),
        }
    }

    /// Unit every heap size is rounded to.
    pub fn granularity(&self) -> usize {
        self.page_size.max(self.segment_size)
    }

    pub fn aggressive_fraction(&self) -> f64 {
        self.aggressive_sweeping_at / 100.0
    }

    pub fn sweeper_fraction(&self) -> f64 {
        self.sweeper_threshold / 100.0
    }

    /// Whether cold methods are aged out at all.
    pub fn aging_enabled(&self) -> bool {
        self.flushing && self.sweep_activity > 0
    }

    pub fn validate(&self) -> Result<()> {
        ensure(
            self.segment_size.is_power_of_two() && self.segment_size >= 16,
            "segment_size must be a power of two >= 16",
        )?;
        ensure(
            self.page_size.is_power_of_two(),
            "page_size must be a power of two",
        )?;
        ensure(
            (1..=100).contains(&self.min_block_segments),
            "min_block_segments must be 1..=100",
        )?;
        ensure(
            self.expansion_size >= 32 * K,
            "expansion_size must be at least 32K",
        )?;
        ensure(
            self.initial_commit_size > 0,
            "initial_commit_size must be > 0",
        )?;
        ensure(
            (0.0..=100.0).contains(&self.aggressive_sweeping_at),
            "aggressive_sweeping_at must be a percentage",
        )?;
        ensure(
            (0.0..=100.0).contains(&self.sweeper_threshold),
            "sweeper_threshold must be a percentage",
        )?;
        ensure(
            self.sweep_activity <= 2000,
            "sweep_activity must be 0..=2000",
        )?;
        ensure(
            self.aging_history_len > 0,
            "aging_history_len must be > 0",
        )?;
        for size in [
            self.reserved_size,
            self.non_method_size,
            self.profiled_size,
            self.non_profiled_size,
        ]
        .into_iter()
        .flatten()
        {
            ensure(
                size <= MAX_RESERVED_SIZE,
                "code cache sizes must not exceed 2048M",
            )?;
        }
        if !self.segmented {
            ensure(
                self.non_method_size.is_none()
                    && self.profiled_size.is_none()
                    && self.non_profiled_size.is_none(),
                "per-heap sizes require segmented = true",
            )?;
        }
        Ok(())
    }
}

fn ensure(condition: bool, message: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(CodeCacheError::InvalidConfig(message.to_string()))
    }
}
