//! Shared memory regions
//!
//! A channel's buffer is memory both the agent and the platform can reach.
//! [`SharedMemory`] is the narrow byte-level view the framing code needs;
//! every multi-byte field is assembled explicitly in little-endian order by
//! the caller, so no Rust struct is ever overlaid on the region.
//!
//! - [`MappedRegion`]: a region the firmware already mapped (device memory,
//!   reserved SRAM); accessed with volatile reads and writes
//! - [`HeapRegion`]: ordinary heap memory, for host-side emulation and tests
//!
//! Regions are `Send + Sync` so a channel holding one can move to another
//! thread. Turn-taking on the buffer is still the SMT protocol's job.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr;
use core::sync::atomic::{AtomicU8, Ordering};

use crate::config::RegionDesc;
use crate::{Result, ScmiError};

/// Byte-addressable memory shared with the platform
///
/// Offsets are relative to the start of the region. Callers validate bounds
/// before access; implementations only `debug_assert!` them.
pub trait SharedMemory: Send + Sync {
    /// Region size in bytes
    fn size(&self) -> usize;

    /// Address the platform uses to reach the region
    fn bus_address(&self) -> usize;

    /// Copy `dst.len()` bytes out of the region
    fn read(&self, offset: usize, dst: &mut [u8]);

    /// Copy `src` into the region
    fn write(&self, offset: usize, src: &[u8]);

    /// Read a little-endian 32-bit word
    fn read_u32(&self, offset: usize) -> u32 {
        let mut word = [0u8; 4];
        self.read(offset, &mut word);
        u32::from_le_bytes(word)
    }

    /// Write a little-endian 32-bit word
    fn write_u32(&self, offset: usize, value: u32) {
        self.write(offset, &value.to_le_bytes());
    }
}

impl<T: SharedMemory + ?Sized> SharedMemory for Arc<T> {
    fn size(&self) -> usize {
        (**self).size()
    }

    fn bus_address(&self) -> usize {
        (**self).bus_address()
    }

    fn read(&self, offset: usize, dst: &mut [u8]) {
        (**self).read(offset, dst)
    }

    fn write(&self, offset: usize, src: &[u8]) {
        (**self).write(offset, src)
    }
}

/// Region mapped by the firmware before the agent starts
pub struct MappedRegion {
    base: *mut u8,
    bus_address: usize,
    size: usize,
}

// SAFETY: `new` requires the mapping to stay valid and only the platform to
// write it concurrently; every access is a volatile byte copy
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Wrap an already mapped region
    ///
    /// # Arguments
    /// * `base` - CPU virtual address of the region
    /// * `bus_address` - Address the platform uses for the same memory
    /// * `size` - Size in bytes
    ///
    /// # Safety
    /// `base..base + size` must stay mapped and valid for volatile access
    /// for the lifetime of the returned value, and nothing but the platform
    /// may write it concurrently.
    pub unsafe fn new(base: *mut u8, bus_address: usize, size: usize) -> Self {
        Self {
            base,
            bus_address,
            size,
        }
    }

    /// CPU virtual address of the region
    pub fn base(&self) -> usize {
        self.base as usize
    }
}

impl SharedMemory for MappedRegion {
    fn size(&self) -> usize {
        self.size
    }

    fn bus_address(&self) -> usize {
        self.bus_address
    }

    fn read(&self, offset: usize, dst: &mut [u8]) {
        debug_assert!(offset + dst.len() <= self.size);
        for (i, byte) in dst.iter_mut().enumerate() {
            // SAFETY: bounds checked by caller, mapping guaranteed by `new`
            *byte = unsafe { ptr::read_volatile(self.base.add(offset + i)) };
        }
    }

    fn write(&self, offset: usize, src: &[u8]) {
        debug_assert!(offset + src.len() <= self.size);
        for (i, byte) in src.iter().enumerate() {
            // SAFETY: bounds checked by caller, mapping guaranteed by `new`
            unsafe { ptr::write_volatile(self.base.add(offset + i), *byte) };
        }
    }
}

/// Heap-backed region
///
/// Share one between the agent and an emulated platform through `Arc`.
/// Bytes are individually atomic, like a bus both sides can reach.
#[derive(Debug)]
pub struct HeapRegion {
    bytes: Box<[AtomicU8]>,
    bus_address: usize,
}

impl HeapRegion {
    /// Zero-filled region of `size` bytes
    pub fn new(size: usize, bus_address: usize) -> Self {
        Self {
            bytes: (0..size).map(|_| AtomicU8::new(0)).collect(),
            bus_address,
        }
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.iter().map(|byte| byte.load(Ordering::Acquire)).collect()
    }
}

impl SharedMemory for HeapRegion {
    fn size(&self) -> usize {
        self.bytes.len()
    }

    fn bus_address(&self) -> usize {
        self.bus_address
    }

    fn read(&self, offset: usize, dst: &mut [u8]) {
        let src = &self.bytes[offset..offset + dst.len()];
        for (byte, cell) in dst.iter_mut().zip(src) {
            *byte = cell.load(Ordering::Acquire);
        }
    }

    fn write(&self, offset: usize, src: &[u8]) {
        let dst = &self.bytes[offset..offset + src.len()];
        for (cell, byte) in dst.iter().zip(src) {
            cell.store(*byte, Ordering::Release);
        }
    }
}

/// Turns a platform region description into accessible memory
///
/// Called once per static channel while the agent is set up.
pub trait RegionMapper {
    /// Map a region
    ///
    /// # Errors
    /// Returns `InvalidArgument` for an empty region, or whatever the
    /// mapping backend reports
    fn map(&mut self, region: RegionDesc) -> Result<Arc<dyn SharedMemory>>;
}

/// Mapper for firmware running with an identity map
///
/// The region's physical address is used directly as its CPU address.
pub struct IdentityMapper {
    _private: (),
}

impl IdentityMapper {
    /// # Safety
    /// Every region later passed to [`RegionMapper::map`] must be identity
    /// mapped and stay mapped for the life of the agent.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl RegionMapper for IdentityMapper {
    fn map(&mut self, region: RegionDesc) -> Result<Arc<dyn SharedMemory>> {
        if region.size == 0 || region.paddr == 0 {
            return Err(ScmiError::InvalidArgument);
        }

        // SAFETY: identity mapping promised by `IdentityMapper::new`
        let mapped = unsafe { MappedRegion::new(region.paddr as *mut u8, region.paddr, region.size) };
        Ok(Arc::new(mapped))
    }
}
