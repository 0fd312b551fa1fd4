use std::ptr;

use memmap2::{MmapOptions, MmapRaw};
use tracing::debug;

use crate::error::Result;

/// The one virtual-memory reservation every code heap is carved out of.
///
/// Backed by an anonymous private mapping, so untouched pages cost no physical memory;
/// heaps track their committed prefix on top of it.
pub struct ReservedRegion {
    map: MmapRaw,
    size: usize,
}

impl std::fmt::Debug for ReservedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservedRegion")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("size", &self.size)
            .finish()
    }
}

impl ReservedRegion {
    pub fn reserve(size: usize) -> Result<Self> {
        let map = MmapOptions::new().len(size).map_anon()?;
        let region = Self {
            map: MmapRaw::from(map),
            size,
        };
        debug!(
            "Reserved code region [{:#x}, {:#x})",
            region.base(),
            region.base() + size
        );
        Ok(region)
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.map.as_ptr() as usize
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn contains(&self, address: usize) -> bool {
        address >= self.base() && address < self.base() + self.size
    }

    /// Copy `bytes` into the region at `offset`.
    ///
    /// # Safety
    /// `offset..offset + bytes.len()` must lie inside the region and no other thread may
    /// read or write that range concurrently.
    pub unsafe fn write(&self, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= self.size);
        // SAFETY: bounds and exclusivity are guaranteed by the caller.
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.map.as_mut_ptr().add(offset),
                bytes.len(),
            );
        }
    }

    /// Copy `len` bytes out of the region starting at `offset`.
    ///
    /// # Safety
    /// The range must lie inside the region and must not be written concurrently.
    pub unsafe fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        debug_assert!(offset + len <= self.size);
        let mut out = vec![0u8; len];
        // SAFETY: bounds and absence of writers are guaranteed by the caller.
        unsafe {
            ptr::copy_nonoverlapping(self.map.as_ptr().add(offset), out.as_mut_ptr(), len);
        }
        out
    }
}
