//! Core building blocks of the JIT code cache.
//!
//! - `config`: cache configuration, loading and validation
//! - `region`: the single reserved virtual-memory region backing every heap
//! - `heap`: segmented code heaps (shared view + lock-guarded allocator)
//! - `partition`: computes how the reservation is split into heaps
//! - `types`: heap kinds, blob kinds and handles

pub mod config;
pub mod error;
pub mod heap;
pub mod partition;
pub mod region;
pub mod types;

pub use config::*;
pub use error::*;
pub use heap::*;
pub use partition::*;
pub use region::*;
pub use types::*;

/// Size units and alignment helpers shared by the heap and the partitioner.
pub mod units {
    pub const K: usize = 1024;
    pub const M: usize = 1024 * K;

    /// Round `value` up to a multiple of `alignment` (a power of two).
    #[inline]
    pub const fn align_up(value: usize, alignment: usize) -> usize {
        (value + alignment - 1) & !(alignment - 1)
    }

    /// Round `value` down to a multiple of `alignment` (a power of two).
    #[inline]
    pub const fn align_down(value: usize, alignment: usize) -> usize {
        value & !(alignment - 1)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn alignment_helpers() {
            assert_eq!(align_up(1, 4096), 4096);
            assert_eq!(align_up(4096, 4096), 4096);
            assert_eq!(align_down(4097, 4096), 4096);
            assert_eq!(align_down(4095, 4096), 0);
            assert_eq!(align_up(0, 128), 0);
        }
    }
}
