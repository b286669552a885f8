//! DMA memory abstraction
//!
//! The transfer engine never allocates DMA-visible memory on its own. The
//! platform hands out [`DmaRegion`]s through the [`DmaMemory`] trait and is
//! told explicitly when ownership of a region moves between the CPU and the
//! host controller.
//!
//! Descriptor memory is only touched through a [`SyncScope`], which syncs
//! for the CPU when it is created and for the device when it is dropped, on
//! every exit path.

use core::ptr::NonNull;
use zerocopy::{FromBytes, Immutable, IntoBytes};

/// DMA allocation failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    /// No memory available (or not available without blocking)
    OutOfMemory,
    /// Requested alignment cannot be satisfied
    BadAlignment,
    /// Memory is not addressable by a 32-bit controller
    AddressTooHigh,
}

/// Whether an allocation may sleep to obtain memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocMode {
    /// Caller context; the platform may block to map new memory
    MayBlock,
    /// Called with the structure lock held; exhaustion must fail fast
    NoWait,
}

/// Cache maintenance direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOp {
    /// CPU writes must become visible to the controller
    ForDevice,
    /// Controller writes must become visible to the CPU
    ForCpu,
}

/// A contiguous, physically addressable piece of DMA memory
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DmaRegion {
    virt: NonNull<u8>,
    phys: u32,
    len: usize,
}

// SAFETY: A DmaRegion is a plain description of memory owned by the DMA
// allocator. All accesses go through volatile reads/writes and the engine
// serializes descriptor mutation under its structure lock.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl core::fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaRegion")
            .field("virt", &self.virt.as_ptr())
            .field("phys", &format_args!("{:#010x}", self.phys))
            .field("len", &self.len)
            .finish()
    }
}

impl DmaRegion {
    /// Describe a region of DMA memory.
    ///
    /// # Safety
    ///
    /// `virt` must point to `len` bytes that stay mapped, writable and
    /// visible to the controller at `phys` for as long as the region (or any
    /// sub-region) is in use.
    pub unsafe fn new(virt: *mut u8, phys: u32, len: usize) -> Option<Self> {
        let virt = NonNull::new(virt)?;
        Some(Self { virt, phys, len })
    }

    /// Physical (bus) address of the first byte
    #[inline]
    pub fn phys(&self) -> u32 {
        self.phys
    }

    /// Length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// CPU pointer to the first byte
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.virt.as_ptr()
    }

    /// Sub-region `[offset, offset + len)`, or `None` if out of bounds
    pub fn sub(&self, offset: usize, len: usize) -> Option<DmaRegion> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        let phys = self.phys.checked_add(u32::try_from(offset).ok()?)?;
        // SAFETY: offset is in bounds of the parent allocation
        let virt = unsafe { NonNull::new_unchecked(self.virt.as_ptr().add(offset)) };
        Some(DmaRegion { virt, phys, len })
    }

    /// Volatile read of a plain-old-data value at `offset`.
    ///
    /// Out-of-bounds or misaligned reads return `None`.
    pub fn read<T: FromBytes>(&self, offset: usize) -> Option<T> {
        let ptr = self.checked_ptr::<T>(offset)?;
        // SAFETY: bounds and alignment were checked and T accepts any bit
        // pattern.
        Some(unsafe { core::ptr::read_volatile(ptr as *const T) })
    }

    /// Volatile write of a plain-old-data value at `offset`.
    ///
    /// Returns `false` if the write would be out of bounds or misaligned.
    pub fn write<T: IntoBytes + Immutable>(&self, offset: usize, value: T) -> bool {
        match self.checked_ptr::<T>(offset) {
            Some(ptr) => {
                // SAFETY: bounds and alignment were checked
                unsafe { core::ptr::write_volatile(ptr as *mut T, value) };
                true
            }
            None => false,
        }
    }

    /// Copy bytes into the region starting at `offset`
    pub fn copy_from_slice(&self, offset: usize, data: &[u8]) -> bool {
        match offset.checked_add(data.len()) {
            Some(end) if end <= self.len => {
                for (i, b) in data.iter().enumerate() {
                    // SAFETY: offset + i < len
                    unsafe { core::ptr::write_volatile(self.virt.as_ptr().add(offset + i), *b) };
                }
                true
            }
            _ => false,
        }
    }

    fn checked_ptr<T>(&self, offset: usize) -> Option<*mut u8> {
        let end = offset.checked_add(core::mem::size_of::<T>())?;
        if end > self.len {
            return None;
        }
        // SAFETY: in bounds
        let ptr = unsafe { self.virt.as_ptr().add(offset) };
        if (ptr as usize) % core::mem::align_of::<T>() != 0 {
            return None;
        }
        Some(ptr)
    }
}

/// DMA memory primitive provided by the platform
pub trait DmaMemory {
    /// Allocate `size` bytes aligned to `align` (a power of two)
    fn allocate(&self, size: usize, align: usize, mode: AllocMode) -> Result<DmaRegion, DmaError>;

    /// Return a region obtained from [`DmaMemory::allocate`]
    fn release(&self, region: DmaRegion);

    /// Cache maintenance for `[offset, offset + len)` of `region`
    fn sync(&self, region: &DmaRegion, offset: usize, len: usize, op: SyncOp);
}

/// Scoped CPU ownership of a piece of descriptor memory.
///
/// Creation syncs for the CPU (the controller may have written), dropping
/// syncs for the device (the controller may read what we wrote).
pub struct SyncScope<'a, D: DmaMemory + ?Sized> {
    dma: &'a D,
    region: DmaRegion,
}

impl<'a, D: DmaMemory + ?Sized> SyncScope<'a, D> {
    pub fn new(dma: &'a D, region: DmaRegion) -> Self {
        dma.sync(&region, 0, region.len(), SyncOp::ForCpu);
        Self { dma, region }
    }

    #[inline]
    pub fn read_u32(&self, offset: usize) -> u32 {
        self.region.read::<u32>(offset).unwrap_or(0)
    }

    #[inline]
    pub fn write_u32(&self, offset: usize, value: u32) {
        if !self.region.write(offset, value) {
            log::error!("DMA: write at {:#x} outside {:?}", offset, self.region);
        }
    }

    /// Read-modify-write of one 32-bit descriptor word
    #[inline]
    pub fn modify_u32(&self, offset: usize, f: impl FnOnce(u32) -> u32) {
        let v = self.read_u32(offset);
        self.write_u32(offset, f(v));
    }

    pub fn read<T: FromBytes>(&self) -> Option<T> {
        self.region.read(0)
    }

    pub fn write<T: IntoBytes + Immutable>(&self, value: T) {
        if !self.region.write(0, value) {
            log::error!("DMA: descriptor write does not fit {:?}", self.region);
        }
    }
}

impl<D: DmaMemory + ?Sized> Drop for SyncScope<'_, D> {
    fn drop(&mut self) {
        self.dma
            .sync(&self.region, 0, self.region.len(), SyncOp::ForDevice);
    }
}
