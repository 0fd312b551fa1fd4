use std::collections::VecDeque;
use std::fmt;

use codecache_core::CodeCacheConfig;
use serde::{Deserialize, Serialize};
use tracing::info;

/// How many completed GC cycles a method may go unused before it counts as cold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColdGcCount {
    /// No pressure; nothing ages out.
    Unbounded,
    Cycles(u32),
}

impl ColdGcCount {
    pub const MIN: u32 = 2;
    pub const MAX: u32 = i32::MAX as u32;

    const UNBOUNDED_BITS: u64 = u64::MAX;

    /// Clamp a raw cycle count into `[MIN, MAX]`.
    pub fn clamped(cycles: f64) -> Self {
        let cycles = if cycles.is_finite() && cycles > 0.0 {
            cycles.min(Self::MAX as f64) as u32
        } else if cycles.is_infinite() && cycles > 0.0 {
            Self::MAX
        } else {
            0
        };
        Self::Cycles(cycles.clamp(Self::MIN, Self::MAX))
    }

    pub fn cycles(self) -> Option<u64> {
        match self {
            Self::Unbounded => None,
            Self::Cycles(n) => Some(n as u64),
        }
    }

    pub(crate) fn to_bits(self) -> u64 {
        self.cycles().unwrap_or(Self::UNBOUNDED_BITS)
    }

    pub(crate) fn from_bits(bits: u64) -> Self {
        if bits == Self::UNBOUNDED_BITS {
            Self::Unbounded
        } else {
            Self::Cycles(bits as u32)
        }
    }
}

impl fmt::Display for ColdGcCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unbounded => f.write_str("unbounded"),
            Self::Cycles(n) => write!(f, "{}", n),
        }
    }
}

/// Fixed-length history with a running average.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    samples: VecDeque<f64>,
    capacity: usize,
    sum: f64,
}

impl SampleWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0.0,
        }
    }

    pub fn add(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            if let Some(oldest) = self.samples.pop_front() {
                self.sum -= oldest;
            }
        }
        self.samples.push_back(value);
        self.sum += value;
    }

    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.sum / self.samples.len() as f64
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Feedback loop deciding how long unused code survives.
///
/// Sampled once per completed marking cycle: the faster code is allocated relative to
/// the space left before aggressive sweeping, the fewer cycles a method may stay unused.
#[derive(Debug, Clone)]
pub struct AgingHeuristic {
    enabled: bool,
    sweep_activity: f64,
    aggressive_fraction: f64,
    last_time: Option<f64>,
    last_used: usize,
    allocation_rates: SampleWindow,
    gc_intervals: SampleWindow,
    cold_gc_count: ColdGcCount,
}

impl AgingHeuristic {
    pub fn new(config: &CodeCacheConfig) -> Self {
        Self {
            enabled: config.aging_enabled(),
            sweep_activity: config.sweep_activity as f64,
            aggressive_fraction: config.aggressive_fraction(),
            last_time: None,
            last_used: 0,
            allocation_rates: SampleWindow::new(config.aging_history_len),
            gc_intervals: SampleWindow::new(config.aging_history_len),
            cold_gc_count: ColdGcCount::Unbounded,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn cold_gc_count(&self) -> ColdGcCount {
        self.cold_gc_count
    }

    /// Used capacity recorded at the last sample.
    pub fn last_used(&self) -> usize {
        self.last_used
    }

    pub fn allocation_rates(&self) -> &SampleWindow {
        &self.allocation_rates
    }

    pub fn gc_intervals(&self) -> &SampleWindow {
        &self.gc_intervals
    }

    /// Take a sample at the end of a marking cycle and recompute the cold GC count.
    pub fn update(&mut self, free: usize, capacity: usize, now: f64) -> ColdGcCount {
        let used = capacity.saturating_sub(free);
        let last_time = self.last_time.replace(now);
        let last_used = std::mem::replace(&mut self.last_used, used);

        if !self.enabled {
            return self.cold_gc_count;
        }

        let Some(last_time) = last_time else {
            info!("Unknown code cache pressure; don't age code");
            self.cold_gc_count = ColdGcCount::Unbounded;
            return self.cold_gc_count;
        };

        let gc_interval = now - last_time;
        if gc_interval <= 0.0 || last_used >= used {
            info!("No code cache pressure; don't age code");
            self.cold_gc_count = ColdGcCount::Unbounded;
            return self.cold_gc_count;
        }

        let allocation_rate = (used - last_used) as f64 / gc_interval;
        self.allocation_rates.add(allocation_rate);
        self.gc_intervals.add(gc_interval);

        let aggressive_threshold = (self.aggressive_fraction * capacity as f64) as usize;
        if free < aggressive_threshold {
            info!("Code cache critically low; use aggressive aging");
            self.cold_gc_count = ColdGcCount::Cycles(ColdGcCount::MIN);
            return self.cold_gc_count;
        }

        let average_interval = self.gc_intervals.average();
        let average_rate = self.allocation_rates.average();
        let time_to_aggressive = (free - aggressive_threshold) as f64 / average_rate;
        let cold_timeout = time_to_aggressive / self.sweep_activity;
        self.cold_gc_count = ColdGcCount::clamped(cold_timeout / average_interval);

        info!(
            "Allocation rate: {:.3} KB/s, time to aggressive unloading: {:.3} s, \
             cold timeout: {:.3} s, cold gc count: {}",
            average_rate / 1024.0,
            time_to_aggressive,
            cold_timeout,
            self.cold_gc_count
        );
        self.cold_gc_count
    }
}
